//! BLE transport adapters and shared identifiers.
//!
//! Both roles share one service with four attributes: code exchange
//! (bidirectional), identity delivery, credential delivery, and an optional
//! status attribute. Distinct attributes per message type keep the codec's
//! classification precedence out of the hot path; content classification
//! still runs on receipt for peers that write everything to one attribute.

pub mod central;
pub mod notify;
pub mod peripheral;
pub mod scanner;

use uuid::Uuid;

pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x0000a10e_0000_1000_8000_00805f9b34fb);
pub const CODE_CHAR_UUID: Uuid = Uuid::from_u128(0x0000a10f_0000_1000_8000_00805f9b34fb);
pub const IDENTITY_CHAR_UUID: Uuid = Uuid::from_u128(0x0000a110_0000_1000_8000_00805f9b34fb);
pub const CREDENTIAL_CHAR_UUID: Uuid = Uuid::from_u128(0x0000a111_0000_1000_8000_00805f9b34fb);
pub const STATUS_CHAR_UUID: Uuid = Uuid::from_u128(0x0000a112_0000_1000_8000_00805f9b34fb);

/// Single-write payload ceiling (ATT default MTU minus the 3-byte header).
/// Callers fragment anything larger.
pub const MAX_WRITE_LEN: usize = 20;

pub use central::BleCentral;
pub use notify::NotificationChannel;
pub use peripheral::BlePeripheral;
pub use scanner::{BleScanner, DiscoveredDevice, ScanCallback};
