//! Initiator-side handshake.
//!
//! Sequence: connect, write the one-time code, wait for the identity push
//! (notification or polling fallback), obtain a credential from the issuer,
//! fragment it and write the pieces in order. The transport is released on
//! every exit path, and the completion/error callbacks fire exactly once
//! per attempt.

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::time;

use crate::ble::notify::NotificationChannel;
use crate::ble::{CODE_CHAR_UUID, CREDENTIAL_CHAR_UUID, IDENTITY_CHAR_UUID};
use crate::codec::{self, Fragment, PayloadKind};
use crate::config::{FragmentScheme, PairingConfig};
use crate::error::PairingError;
use crate::issuer::CredentialIssuer;
use crate::pairing::InitiatorState;
use crate::transport::CentralTransport;

/// Status callbacks for an initiator attempt.
pub trait InitiatorEvents: Send + Sync {
    fn on_status(&self, status: &str);
    fn on_complete(&self, _outcome: &InitiatorOutcome) {}
    fn on_error(&self, _error: &PairingError) {}
}

/// What a successful attempt produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatorOutcome {
    pub identity: String,
    pub credential: String,
}

pub struct Initiator {
    transport: Arc<dyn CentralTransport>,
    issuer: Arc<dyn CredentialIssuer>,
    config: PairingConfig,
    state: InitiatorState,
}

impl Initiator {
    pub fn new(
        transport: Arc<dyn CentralTransport>,
        issuer: Arc<dyn CredentialIssuer>,
        config: PairingConfig,
    ) -> Self {
        Self {
            transport,
            issuer,
            config,
            state: InitiatorState::Idle,
        }
    }

    pub fn state(&self) -> InitiatorState {
        self.state
    }

    /// Run a full pairing attempt with a freshly generated code.
    pub async fn pair<C: InitiatorEvents>(
        &mut self,
        peer: &str,
        callback: &C,
    ) -> Result<InitiatorOutcome, PairingError> {
        let code = codec::generate_code_with_len(self.config.code_len);
        self.pair_with_code(peer, &code, callback).await
    }

    /// Run a full pairing attempt presenting an explicit code.
    ///
    /// Failures are terminal for this attempt; retrying is the caller's
    /// decision ([`PairingError::is_retryable`] says whether it could help).
    pub async fn pair_with_code<C: InitiatorEvents>(
        &mut self,
        peer: &str,
        code: &str,
        callback: &C,
    ) -> Result<InitiatorOutcome, PairingError> {
        if !codec::validate_code(code) {
            let err = PairingError::Validation(format!("malformed one-time code: {code:?}"));
            self.state = InitiatorState::Errored;
            callback.on_error(&err);
            return Err(err);
        }

        let result = self.run_handshake(peer, code, callback).await;

        // release the link on every exit path; disconnect is idempotent
        let _ = self.transport.disconnect().await;

        match &result {
            Ok(outcome) => {
                self.state = InitiatorState::Complete;
                info!("pairing complete with {}", outcome.identity);
                callback.on_complete(outcome);
            }
            Err(err) => {
                self.state = InitiatorState::Errored;
                callback.on_error(err);
            }
        }
        result
    }

    async fn run_handshake<C: InitiatorEvents>(
        &mut self,
        peer: &str,
        code: &str,
        callback: &C,
    ) -> Result<InitiatorOutcome, PairingError> {
        callback.on_status("connecting");
        self.transport.connect(peer).await?;

        // subscribe before presenting the code so the identity push cannot
        // slip past between the write and the subscription; the code is the
        // trigger value the polling fallback must not re-process
        let mut channel = NotificationChannel::open(
            self.transport.clone(),
            IDENTITY_CHAR_UUID,
            Some(code.as_bytes().to_vec()),
            &self.config,
        )
        .await;

        self.transport
            .write(CODE_CHAR_UUID, code.as_bytes())
            .await?;
        self.state = InitiatorState::CodeSent;
        callback.on_status("code sent, waiting for identity");
        self.state = InitiatorState::AwaitingIdentity;

        let identity = loop {
            let value = channel.next(self.config.notify_wait).await?;
            let text = String::from_utf8_lossy(&value).into_owned();
            match codec::classify(&text) {
                PayloadKind::Identity => break text,
                kind => {
                    // a stray or malformed push is logged and skipped, not
                    // fatal to the attempt
                    warn!("expected an identity, got {kind:?}; ignoring");
                }
            }
        };
        // the channel is dropped below, so identity pushes arriving after
        // this point are never reprocessed

        self.state = InitiatorState::IssuingCredential;
        callback.on_status("identity received, requesting credential");
        let credential = self
            .issuer
            .issue(&identity)
            .await
            .map_err(|e| PairingError::Issuer(e.to_string()))?;

        self.state = InitiatorState::SendingCredential;
        callback.on_status("sending credential");
        drop(channel);
        self.send_credential(&credential).await?;

        Ok(InitiatorOutcome {
            identity,
            credential,
        })
    }

    /// Write the credential as ordered fragments, aborting on the first
    /// failed write.
    async fn send_credential(&self, credential: &str) -> Result<(), PairingError> {
        let frames: Vec<Vec<u8>> = match self.config.fragment_scheme {
            FragmentScheme::Indexed => codec::fragment(credential, self.config.max_chunk)
                .iter()
                .map(Fragment::to_bytes)
                .collect(),
            FragmentScheme::Sentinel => {
                codec::sentinel_chunks(&codec::wrap_sentinel(credential), self.config.max_chunk)
            }
        };

        debug!("writing credential as {} fragment(s)", frames.len());
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                // pacing: back-to-back writes overrun some link layers
                time::sleep(self.config.inter_fragment_delay).await;
            }
            self.transport.write(CREDENTIAL_CHAR_UUID, frame).await?;
        }
        Ok(())
    }
}
