//! Central-role transport adapter over btleplug.
//!
//! Wraps connect / write / subscribe / read / disconnect behind
//! [`CentralTransport`]. The post-connect settle delay is a platform quirk,
//! not protocol logic, so it sits behind the `settle_after_connect` flag.

use btleplug::api::{Central, Characteristic, Manager as _, Peripheral, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral as PlatformPeripheral};
use futures_util::StreamExt;
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time;
use uuid::Uuid;

use crate::ble::{MAX_WRITE_LEN, SERVICE_UUID};
use crate::config::PairingConfig;
use crate::error::TransportError;
use crate::transport::CentralTransport;

pub struct BleCentral {
    adapter: Adapter,
    config: PairingConfig,
    peripheral: Mutex<Option<PlatformPeripheral>>,
}

impl BleCentral {
    pub async fn new(config: PairingConfig) -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let adapter = adapters.into_iter().next().ok_or(TransportError::NoAdapter)?;

        Ok(Self {
            adapter,
            config,
            peripheral: Mutex::new(None),
        })
    }

    async fn lookup(&self, address: &str) -> Result<Option<PlatformPeripheral>, TransportError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if props.address.to_string().eq_ignore_ascii_case(address) {
                    return Ok(Some(peripheral));
                }
            }
        }
        Ok(None)
    }

    /// Resolve an address to a peripheral, scanning for it when it is not
    /// already in the adapter cache.
    async fn find_device(&self, address: &str) -> Result<PlatformPeripheral, TransportError> {
        if let Some(peripheral) = self.lookup(address).await? {
            return Ok(peripheral);
        }

        debug!("{address} not cached, scanning for it");
        self.adapter
            .start_scan(ScanFilter {
                services: vec![SERVICE_UUID],
            })
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let deadline = time::Instant::now() + self.config.scan_timeout;
        let result = loop {
            if let Some(peripheral) = self.lookup(address).await? {
                break Ok(peripheral);
            }
            if time::Instant::now() >= deadline {
                break Err(TransportError::DeviceNotFound(address.to_string()));
            }
            time::sleep(Duration::from_millis(200)).await;
        };

        let _ = self.adapter.stop_scan().await;
        result
    }

    async fn connected(&self) -> Result<PlatformPeripheral, TransportError> {
        self.peripheral
            .lock()
            .await
            .clone()
            .ok_or_else(|| TransportError::Connection("not connected".to_string()))
    }

    fn find_characteristic(
        peripheral: &PlatformPeripheral,
        uuid: Uuid,
    ) -> Result<Characteristic, TransportError> {
        for service in peripheral.services() {
            if service.uuid == SERVICE_UUID {
                for characteristic in service.characteristics {
                    if characteristic.uuid == uuid {
                        return Ok(characteristic);
                    }
                }
            }
        }
        Err(TransportError::AttributeNotFound(uuid))
    }

    fn map_write_error(err: &btleplug::Error) -> TransportError {
        match err {
            btleplug::Error::TimedOut(_) => TransportError::WriteTimedOut,
            other => TransportError::Write(other.to_string()),
        }
    }
}

#[async_trait::async_trait]
impl CentralTransport for BleCentral {
    async fn connect(&self, peer: &str) -> Result<(), TransportError> {
        let peripheral = self.find_device(peer).await?;

        debug!("Connecting to {peer}");
        peripheral
            .connect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        if self.config.settle_after_connect {
            // some link layers drop the first write issued right after
            // connect; give the connection time to settle
            time::sleep(self.config.settle_delay).await;
        }

        debug!("Discovering services on {peer}");
        peripheral
            .discover_services()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        *self.peripheral.lock().await = Some(peripheral);
        Ok(())
    }

    async fn write(&self, attribute: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        if payload.len() > MAX_WRITE_LEN {
            return Err(TransportError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_WRITE_LEN,
            });
        }
        let peripheral = self.connected().await?;
        let characteristic = Self::find_characteristic(&peripheral, attribute)?;
        peripheral
            .write(&characteristic, payload, WriteType::WithResponse)
            .await
            .map_err(|e| Self::map_write_error(&e))
    }

    async fn subscribe(
        &self,
        attribute: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        let peripheral = self.connected().await?;
        let characteristic = Self::find_characteristic(&peripheral, attribute)?;

        peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| TransportError::Subscription(e.to_string()))?;

        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| TransportError::Subscription(e.to_string()))?;

        let (tx, rx) = mpsc::channel(16);
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != attribute {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    // receiver dropped: subscription no longer wanted
                    break;
                }
            }
            debug!("notification stream for {attribute} ended");
        });

        Ok(rx)
    }

    async fn read(&self, attribute: Uuid) -> Result<Vec<u8>, TransportError> {
        let peripheral = self.connected().await?;
        let characteristic = Self::find_characteristic(&peripheral, attribute)?;
        peripheral
            .read(&characteristic)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(peripheral) = self.peripheral.lock().await.take() else {
            return Ok(()); // already closed
        };
        if let Err(e) = peripheral.disconnect().await {
            warn!("disconnect reported {e}, ignoring");
        }
        Ok(())
    }
}
