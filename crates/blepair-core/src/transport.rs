//! Transport seam between the state machines and the BLE stack.
//!
//! The pairing state machines only ever talk to these traits. The real
//! adapters live in [`crate::ble`]; integration tests wire both roles
//! together with an in-memory implementation.

use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

/// Declaration of one attribute in the responder's virtual table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec {
    pub uuid: Uuid,
    pub readable: bool,
    pub writable: bool,
    pub notifiable: bool,
}

impl AttributeSpec {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            readable: false,
            writable: false,
            notifiable: false,
        }
    }

    pub fn readable(mut self) -> Self {
        self.readable = true;
        self
    }

    pub fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    pub fn notifiable(mut self) -> Self {
        self.notifiable = true;
        self
    }
}

/// One accepted write from a connected peer, dispatched exactly once.
#[derive(Debug, Clone)]
pub struct InboundWrite {
    pub peer: String,
    pub attribute: Uuid,
    pub payload: Vec<u8>,
}

/// Initiator-side link: connect outward, write, subscribe, read.
#[async_trait::async_trait]
pub trait CentralTransport: Send + Sync {
    /// Establish the link and discover attributes. Implementations apply
    /// any platform settle delay before returning.
    async fn connect(&self, peer: &str) -> Result<(), TransportError>;

    /// Confirmed write of one frame. Callers fragment beforehand; payloads
    /// over the single-write ceiling fail with `PayloadTooLarge`.
    async fn write(&self, attribute: Uuid, payload: &[u8]) -> Result<(), TransportError>;

    /// Request change notifications for an attribute. A `Subscription`
    /// error here is the signal to fall back to polling reads.
    async fn subscribe(&self, attribute: Uuid)
    -> Result<mpsc::Receiver<Vec<u8>>, TransportError>;

    /// Read the attribute's current value (the polling fallback path).
    async fn read(&self, attribute: Uuid) -> Result<Vec<u8>, TransportError>;

    /// Tear down the link. Idempotent: closing an already-closed link is
    /// not an error.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Responder-side link: declare attributes, advertise, push values.
///
/// Inbound writes arrive on an `mpsc::Receiver<InboundWrite>` handed out by
/// the concrete adapter, keeping all session mutations funneled through one
/// task.
#[async_trait::async_trait]
pub trait PeripheralTransport: Send + Sync {
    /// Declare the service and its attributes. Idempotent: any previously
    /// configured service is cleared first, and "nothing to clear" is
    /// swallowed.
    async fn configure(
        &self,
        service: Uuid,
        attributes: &[AttributeSpec],
    ) -> Result<(), TransportError>;

    /// Begin broadcasting. `Duration::ZERO` means advertise until
    /// explicitly stopped.
    async fn advertise(&self, device_name: &str, duration: Duration)
    -> Result<(), TransportError>;

    /// Stop broadcasting. Idempotent; stopping an already-stopped
    /// advertisement is swallowed.
    async fn stop_advertising(&self) -> Result<(), TransportError>;

    /// Push a value to subscribed peers. Fails if the attribute lacks the
    /// notify property or no peer is subscribed.
    async fn notify(&self, attribute: Uuid, payload: &[u8]) -> Result<(), TransportError>;
}
