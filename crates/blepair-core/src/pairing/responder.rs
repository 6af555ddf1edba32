//! Responder-side handshake.
//!
//! The responder advertises, validates the one-time code, optionally waits
//! for human confirmation, pushes its identity, and reassembles the
//! credential the initiator writes back. Every inbound write goes through
//! [`Responder::handle_write`], the single dispatch point; a malformed
//! message is logged and skipped, never allowed to take the dispatch loop
//! down.

use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;

use crate::ble::{
    CODE_CHAR_UUID, CREDENTIAL_CHAR_UUID, IDENTITY_CHAR_UUID, SERVICE_UUID, STATUS_CHAR_UUID,
};
use crate::codec::{self, Fragment, PayloadKind};
use crate::config::{FragmentScheme, PairingConfig};
use crate::error::PairingError;
use crate::pairing::{PairingRecord, ResponderState};
use crate::session::SessionStore;
use crate::transport::{AttributeSpec, InboundWrite, PeripheralTransport};

/// Human-confirmation seam. The hook decides whether the displayed code is
/// accepted; taking longer than the configured timeout lapses the attempt.
#[async_trait::async_trait]
pub trait ConfirmationHook: Send + Sync {
    async fn confirm(&self, code: &str) -> bool;
}

/// Status callbacks for the responder role.
pub trait ResponderEvents: Send + Sync {
    fn on_status(&self, status: &str);
    fn on_code_received(&self, _peer: &str, _code: &str) {}
    fn on_paired(&self, _record: &PairingRecord) {}
    fn on_error(&self, _error: &PairingError) {}
}

pub struct Responder {
    transport: Arc<dyn PeripheralTransport>,
    sessions: SessionStore,
    identity: String,
    config: PairingConfig,
    hook: Option<Arc<dyn ConfirmationHook>>,
    state: ResponderState,
    completed: bool,
}

impl Responder {
    pub fn new(
        transport: Arc<dyn PeripheralTransport>,
        identity: String,
        config: PairingConfig,
    ) -> Self {
        Self {
            transport,
            sessions: SessionStore::new(),
            identity,
            config,
            hook: None,
            state: ResponderState::Advertising,
            completed: false,
        }
    }

    /// Register a confirmation hook; without one, codes are accepted
    /// immediately.
    pub fn with_confirmation(mut self, hook: Arc<dyn ConfirmationHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn state(&self) -> ResponderState {
        self.state
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The responder's virtual attribute table.
    pub fn attribute_table() -> Vec<AttributeSpec> {
        vec![
            AttributeSpec::new(CODE_CHAR_UUID).writable(),
            AttributeSpec::new(IDENTITY_CHAR_UUID).readable().notifiable(),
            AttributeSpec::new(CREDENTIAL_CHAR_UUID).writable(),
            AttributeSpec::new(STATUS_CHAR_UUID).readable().notifiable(),
        ]
    }

    /// Configure the attribute table and begin advertising. Setup failures
    /// here are fatal to the attempt.
    pub async fn start(&mut self) -> Result<(), PairingError> {
        self.transport
            .configure(SERVICE_UUID, &Self::attribute_table())
            .await?;
        self.transport
            .advertise(&self.config.device_name, Duration::ZERO)
            .await?;
        self.state = ResponderState::Advertising;
        info!("responder advertising as '{}'", self.config.device_name);
        Ok(())
    }

    /// Serve the inbound write stream until it closes, returning the first
    /// completed pairing, if any.
    ///
    /// Handler failures after setup are reported through the callback and
    /// do not stop the loop: one bad message from one peer must not end the
    /// responder's ability to serve others.
    pub async fn run<C: ResponderEvents>(
        &mut self,
        mut writes: mpsc::Receiver<InboundWrite>,
        callback: &C,
    ) -> Result<Option<PairingRecord>, PairingError> {
        self.start().await?;
        callback.on_status("advertising, waiting for an initiator");

        let mut record = None;
        while let Some(write) = writes.recv().await {
            match self.handle_write(&write, callback).await {
                Ok(Some(completed)) => {
                    if record.is_none() {
                        record = Some(completed);
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("handler error for peer {}: {err}", write.peer);
                    callback.on_error(&err);
                }
            }
        }

        let _ = self.transport.stop_advertising().await;
        Ok(record)
    }

    /// Dispatch one inbound write. Returns a record when this write
    /// completed the pairing.
    ///
    /// Routing is by attribute first: the code attribute only ever carries
    /// codes, the credential attribute carries whole credentials or
    /// fragments. Writes on any other attribute fall back to content
    /// classification, for peers that collapse everything onto one
    /// attribute.
    pub async fn handle_write<C: ResponderEvents>(
        &mut self,
        write: &InboundWrite,
        callback: &C,
    ) -> Result<Option<PairingRecord>, PairingError> {
        let text = std::str::from_utf8(&write.payload).ok();

        if write.attribute == CODE_CHAR_UUID {
            // handle_code rejects malformed codes itself
            self.handle_code(&write.peer, text.unwrap_or_default(), callback)
                .await?;
            return Ok(None);
        }
        if write.attribute == CREDENTIAL_CHAR_UUID {
            if let Some(text) = text {
                if codec::classify(text) == PayloadKind::Credential {
                    // single-write delivery: complete without the accumulator
                    return self.complete(&write.peer, text, callback).await;
                }
            }
            return self.handle_gated_fragment(write, callback).await;
        }

        match text.map(codec::classify) {
            Some(PayloadKind::Code) => {
                self.handle_code(&write.peer, text.unwrap_or_default(), callback)
                    .await?;
                Ok(None)
            }
            Some(PayloadKind::Credential) => {
                self.complete(&write.peer, text.unwrap_or_default(), callback)
                    .await
            }
            _ => self.handle_gated_fragment(write, callback).await,
        }
    }

    /// Fragment path, but only once this peer has presented a code;
    /// anything earlier is a stray write and is dropped without creating a
    /// session.
    async fn handle_gated_fragment<C: ResponderEvents>(
        &mut self,
        write: &InboundWrite,
        callback: &C,
    ) -> Result<Option<PairingRecord>, PairingError> {
        if self.sessions.code(&write.peer).await.is_none() {
            debug!(
                "ignoring {}-byte payload from unpaired peer {}",
                write.payload.len(),
                write.peer
            );
            return Ok(None);
        }
        self.handle_fragment(write, callback).await
    }

    /// Push the identity again after a reported send failure. Offered to
    /// the caller instead of silent internal retries.
    pub async fn resend_identity(&mut self) -> Result<(), PairingError> {
        self.transport
            .notify(IDENTITY_CHAR_UUID, self.identity.as_bytes())
            .await?;
        self.state = ResponderState::AwaitingCredential;
        Ok(())
    }

    /// Best-effort push on the optional status attribute; most centrals
    /// never subscribe to it.
    async fn push_status(&self, status: &str) {
        if let Err(e) = self
            .transport
            .notify(STATUS_CHAR_UUID, status.as_bytes())
            .await
        {
            debug!("status push skipped: {e}");
        }
    }

    async fn handle_code<C: ResponderEvents>(
        &mut self,
        peer: &str,
        code: &str,
        callback: &C,
    ) -> Result<(), PairingError> {
        if !codec::validate_code(code) {
            // shape-check failure is a log, not an exception
            warn!("rejecting malformed code from {peer}");
            return Ok(());
        }
        if self
            .sessions
            .code_expired(peer, self.config.code_expiry)
            .await
        {
            debug!("stored code for {peer} had expired; superseding");
        }

        self.sessions.replace_code(peer, code).await;
        self.state = ResponderState::CodeReceived;
        callback.on_code_received(peer, code);

        if let Some(hook) = self.hook.clone() {
            self.state = ResponderState::AwaitingConfirmation;
            callback.on_status("waiting for confirmation");
            match time::timeout(self.config.confirmation_timeout, hook.confirm(code)).await {
                Ok(true) => {}
                Ok(false) => {
                    // a lapsed attempt leaves nothing behind the peer could
                    // complete against
                    self.sessions.reset(peer).await;
                    self.state = ResponderState::Errored;
                    return Err(PairingError::Cancelled);
                }
                Err(_) => {
                    // the attempt lapses loudly, never silently hangs
                    self.sessions.reset(peer).await;
                    self.state = ResponderState::Errored;
                    return Err(PairingError::Timeout("confirmation"));
                }
            }
        }

        // a code is in hand; stop inviting other initiators
        let _ = self.transport.stop_advertising().await;

        callback.on_status("sending identity");
        if let Err(err) = self
            .transport
            .notify(IDENTITY_CHAR_UUID, self.identity.as_bytes())
            .await
        {
            // reported distinctly so the caller can trigger a resend
            return Err(err.into());
        }

        self.state = ResponderState::IdentitySent;
        self.push_status("identity-sent").await;
        callback.on_status("identity sent, awaiting credential");
        self.state = ResponderState::AwaitingCredential;
        Ok(())
    }

    async fn handle_fragment<C: ResponderEvents>(
        &mut self,
        write: &InboundWrite,
        callback: &C,
    ) -> Result<Option<PairingRecord>, PairingError> {
        let reassembled = match self.config.fragment_scheme {
            FragmentScheme::Indexed => {
                let fragment = Fragment::from_bytes(&write.payload)?;
                self.sessions.insert_indexed(&write.peer, fragment).await?
            }
            FragmentScheme::Sentinel => {
                self.sessions
                    .append_and_extract(&write.peer, &write.payload)
                    .await
            }
        };

        match reassembled {
            Some(payload) => self.complete(&write.peer, &payload, callback).await,
            None => Ok(None),
        }
    }

    async fn complete<C: ResponderEvents>(
        &mut self,
        peer: &str,
        credential: &str,
        callback: &C,
    ) -> Result<Option<PairingRecord>, PairingError> {
        if self.completed {
            // stale duplicate after completion: ignore, not an error
            debug!("ignoring credential delivery after completion");
            return Ok(None);
        }

        let Some(code) = self.sessions.code(peer).await else {
            return Err(PairingError::Validation(
                "credential received before any one-time code".to_string(),
            ));
        };

        let record = PairingRecord {
            connection_code: code,
            serial_number: self.identity.clone(),
            jwt_token: credential.to_string(),
        };

        self.completed = true;
        self.state = ResponderState::Complete;
        self.push_status("paired").await;
        let _ = self.transport.stop_advertising().await;

        info!("pairing complete for peer {peer}");
        callback.on_paired(&record);
        Ok(Some(record))
    }
}
