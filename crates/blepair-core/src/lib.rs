//! blepair core library
//!
//! Pairs two devices over BLE and bootstraps trust between them: the
//! responder advertises and waits; the initiator connects and presents a
//! one-time code; the responder answers with its device identity; the
//! initiator writes back a signed credential, fragmented to fit the
//! transport's frame limit.
//!
//! # Modules
//!
//! - **codec**: code generation, payload classification, fragmentation
//! - **ble**: central and peripheral transport adapters, polling fallback
//! - **pairing**: the initiator and responder state machines
//! - **session**: per-peer in-flight state
//! - **issuer**: the credential authority seam and its mock
//!
//! # Responder example
//!
//! ```ignore
//! use blepair_core::{BlePeripheral, Responder, PairingConfig};
//! use blepair_core::codec::generate_identity;
//!
//! let mut peripheral = BlePeripheral::new().await?;
//! let writes = peripheral.take_write_receiver().unwrap();
//!
//! let identity = generate_identity("DEV")?;
//! let mut responder = Responder::new(Arc::new(peripheral), identity, PairingConfig::default());
//! let record = responder.run(writes, &callback).await?;
//! ```
//!
//! # Initiator example
//!
//! ```ignore
//! use blepair_core::{BleCentral, BleScanner, Initiator, MockIssuer, PairingConfig};
//!
//! let scanner = BleScanner::new().await?;
//! let devices = scanner.scan(Duration::from_secs(10), None).await?;
//!
//! let config = PairingConfig::default();
//! let central = Arc::new(BleCentral::new(config.clone()).await?);
//! let mut initiator = Initiator::new(central, Arc::new(MockIssuer::new()), config);
//! let outcome = initiator.pair(&devices[0].address, &callback).await?;
//! ```

pub mod ble;
pub mod codec;
pub mod config;
pub mod error;
pub mod issuer;
pub mod pairing;
pub mod session;
pub mod transport;

// BLE re-exports
pub use ble::{
    BleCentral, BlePeripheral, BleScanner, DiscoveredDevice, NotificationChannel, ScanCallback,
    CODE_CHAR_UUID, CREDENTIAL_CHAR_UUID, IDENTITY_CHAR_UUID, SERVICE_UUID, STATUS_CHAR_UUID,
};

// Codec re-exports
pub use codec::{Fragment, PayloadKind, ReassemblyError};

// Config re-exports
pub use config::{AppSettings, FragmentScheme, PairingConfig};

// Error re-exports
pub use error::{PairingError, TransportError};

// Issuer re-exports
pub use issuer::{CredentialIssuer, IssuerError, MockIssuer};

// Pairing re-exports
pub use pairing::{
    ConfirmationHook, Initiator, InitiatorEvents, InitiatorOutcome, InitiatorState,
    PairingRecord, Responder, ResponderEvents, ResponderState, SimpleInitiatorCallback,
    SimpleResponderCallback,
};

// Session re-exports
pub use session::SessionStore;

// Transport re-exports
pub use transport::{AttributeSpec, CentralTransport, InboundWrite, PeripheralTransport};
