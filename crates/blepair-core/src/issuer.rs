//! Credential issuer seam and its mock implementation.
//!
//! The real issuing authority is an external collaborator; the protocol
//! only needs an async `issue(identity) -> token` boundary. [`MockIssuer`]
//! stands in for it: it sleeps to model authority latency and returns a
//! deterministic JWT-shaped token, so two calls for the same identity yield
//! the same credential.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::debug;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Async boundary to the credential-issuing authority.
#[async_trait::async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn issue(&self, identity: &str) -> Result<String, IssuerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum IssuerError {
    #[error("issuer unavailable: {0}")]
    Unavailable(String),
}

/// Deterministic stand-in for the issuing authority.
pub struct MockIssuer {
    latency: Duration,
}

impl MockIssuer {
    pub fn new() -> Self {
        Self {
            latency: Duration::from_secs(2),
        }
    }

    /// Override the modeled latency (tests use zero).
    pub fn with_latency(latency: Duration) -> Self {
        Self { latency }
    }
}

impl Default for MockIssuer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CredentialIssuer for MockIssuer {
    async fn issue(&self, identity: &str) -> Result<String, IssuerError> {
        tokio::time::sleep(self.latency).await;

        let header = URL_SAFE_NO_PAD.encode(json!({"alg": "none", "typ": "JWT"}).to_string());
        let payload = URL_SAFE_NO_PAD.encode(json!({"sub": identity, "iat": 0}).to_string());
        let digest = Sha256::digest(format!("{header}.{payload}").as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(digest);

        let token = format!("{header}.{payload}.{signature}");
        debug!("issued credential for {identity} ({} bytes)", token.len());
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{PayloadKind, classify};

    #[tokio::test]
    async fn issued_tokens_are_deterministic_and_credential_shaped() {
        let issuer = MockIssuer::with_latency(Duration::ZERO);
        let a = issuer.issue("TAB-000123").await.unwrap();
        let b = issuer.issue("TAB-000123").await.unwrap();
        assert_eq!(a, b);

        assert_eq!(a.matches('.').count(), 2);
        assert!(a.starts_with("eyJ"));
        assert_eq!(classify(&a), PayloadKind::Credential);
    }

    #[tokio::test]
    async fn different_identities_get_different_tokens() {
        let issuer = MockIssuer::with_latency(Duration::ZERO);
        let a = issuer.issue("TAB-000123").await.unwrap();
        let b = issuer.issue("MOB-000123").await.unwrap();
        assert_ne!(a, b);
    }
}
