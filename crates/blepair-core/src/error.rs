//! Error taxonomy for transport and pairing failures.
//!
//! The split matters for callers: [`TransportError`] describes what the link
//! did, [`PairingError`] describes what the handshake did. `is_retryable`
//! distinguishes "try again" failures from invalid input.

use uuid::Uuid;

/// Failures raised by a transport adapter (central or peripheral role).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("write timed out")]
    WriteTimedOut,

    #[error("write cancelled")]
    WriteCancelled,

    #[error("write failed: {0}")]
    Write(String),

    #[error("payload of {len} bytes exceeds the {max}-byte write limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("notification channel failed: {0}")]
    Subscription(String),

    #[error("attribute not found: {0}")]
    AttributeNotFound(Uuid),

    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("no Bluetooth adapter available")]
    NoAdapter,

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
}

/// Failures raised by the pairing state machines.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("pairing cancelled")]
    Cancelled,

    #[error("invalid payload: {0}")]
    Validation(String),

    #[error("reassembly failed: {0}")]
    Reassembly(#[from] crate::codec::ReassemblyError),

    #[error("credential issuer failed: {0}")]
    Issuer(String),
}

impl PairingError {
    /// Whether retrying the whole attempt could plausibly succeed.
    ///
    /// Validation and reassembly failures mean the input itself was bad;
    /// everything else is a link or timing problem.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PairingError::Validation(_) | PairingError::Reassembly(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_retryable() {
        let err = PairingError::Transport(TransportError::WriteTimedOut);
        assert!(err.is_retryable());
        assert!(PairingError::Timeout("identity").is_retryable());
    }

    #[test]
    fn validation_errors_are_not_retryable() {
        assert!(!PairingError::Validation("bad code".into()).is_retryable());
    }
}
