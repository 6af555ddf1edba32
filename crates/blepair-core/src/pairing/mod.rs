//! Pairing state machines for both roles.
//!
//! One dispatch point per inbound event, named states instead of nested
//! callbacks. The initiator drives a [`crate::transport::CentralTransport`];
//! the responder consumes the peripheral's serialized write stream.

pub mod initiator;
pub mod responder;

use tokio::sync::mpsc;

use crate::error::PairingError;

pub use initiator::{Initiator, InitiatorEvents, InitiatorOutcome};
pub use responder::{ConfirmationHook, Responder, ResponderEvents};

/// Initiator-side session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitiatorState {
    Idle,
    CodeSent,
    AwaitingIdentity,
    IssuingCredential,
    SendingCredential,
    Complete,
    Errored,
}

/// Responder-side session states. `AwaitingConfirmation` is only entered
/// when a confirmation hook is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderState {
    Advertising,
    CodeReceived,
    AwaitingConfirmation,
    IdentitySent,
    AwaitingCredential,
    Complete,
    Errored,
}

/// A completed pairing as seen by the responder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingRecord {
    pub connection_code: String,
    pub serial_number: String,
    pub jwt_token: String,
}

/// Channel-backed responder callback for callers that prefer events over
/// trait impls.
pub struct SimpleResponderCallback {
    tx: mpsc::Sender<ResponderEvent>,
}

#[derive(Debug, Clone)]
pub enum ResponderEvent {
    Status(String),
    CodeReceived { peer: String, code: String },
    Paired(PairingRecord),
    Error(String),
}

impl SimpleResponderCallback {
    pub fn new() -> (Self, mpsc::Receiver<ResponderEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

impl ResponderEvents for SimpleResponderCallback {
    fn on_status(&self, status: &str) {
        let _ = self.tx.try_send(ResponderEvent::Status(status.to_string()));
    }

    fn on_code_received(&self, peer: &str, code: &str) {
        let _ = self.tx.try_send(ResponderEvent::CodeReceived {
            peer: peer.to_string(),
            code: code.to_string(),
        });
    }

    fn on_paired(&self, record: &PairingRecord) {
        let _ = self.tx.try_send(ResponderEvent::Paired(record.clone()));
    }

    fn on_error(&self, error: &PairingError) {
        let _ = self.tx.try_send(ResponderEvent::Error(error.to_string()));
    }
}

/// Channel-backed initiator callback.
pub struct SimpleInitiatorCallback {
    tx: mpsc::Sender<InitiatorEvent>,
}

#[derive(Debug, Clone)]
pub enum InitiatorEvent {
    Status(String),
    Complete { identity: String, credential: String },
    Error(String),
}

impl SimpleInitiatorCallback {
    pub fn new() -> (Self, mpsc::Receiver<InitiatorEvent>) {
        let (tx, rx) = mpsc::channel(32);
        (Self { tx }, rx)
    }
}

impl InitiatorEvents for SimpleInitiatorCallback {
    fn on_status(&self, status: &str) {
        let _ = self.tx.try_send(InitiatorEvent::Status(status.to_string()));
    }

    fn on_complete(&self, outcome: &InitiatorOutcome) {
        let _ = self.tx.try_send(InitiatorEvent::Complete {
            identity: outcome.identity.clone(),
            credential: outcome.credential.clone(),
        });
    }

    fn on_error(&self, error: &PairingError) {
        let _ = self.tx.try_send(InitiatorEvent::Error(error.to_string()));
    }
}
