//! BLE scanner: discover advertising responders.
//!
//! Filters on the shared service UUID. Discovery events are forwarded to
//! the callback as they arrive, one per event; this layer does not
//! deduplicate — callers that care dedupe by address.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral, ScanFilter};
use btleplug::platform::{Adapter, Manager};
use futures_util::StreamExt;
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use crate::ble::SERVICE_UUID;
use crate::error::TransportError;

/// A responder seen while scanning.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub address: String,
    pub rssi: Option<i16>,
}

/// Live discovery callback.
#[async_trait::async_trait]
pub trait ScanCallback: Send + Sync {
    async fn on_device_found(&self, device: DiscoveredDevice);
}

pub struct BleScanner {
    adapter: Adapter,
}

impl BleScanner {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let adapter = adapters.into_iter().next().ok_or(TransportError::NoAdapter)?;
        Ok(Self { adapter })
    }

    /// Scan for responders until the wall-clock budget runs out.
    ///
    /// The returned list is deduplicated by address for convenience; the
    /// callback sees the raw event stream.
    pub async fn scan(
        &self,
        timeout: Duration,
        callback: Option<Arc<dyn ScanCallback>>,
    ) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let filter = ScanFilter {
            services: vec![SERVICE_UUID],
        };
        self.adapter
            .start_scan(filter)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        info!("Starting BLE scan for {} seconds", timeout.as_secs());

        let mut found = std::collections::HashMap::new();
        let timeout_fut = tokio::time::sleep(timeout);
        tokio::pin!(timeout_fut);

        loop {
            tokio::select! {
                () = &mut timeout_fut => break,
                event = events.next() => {
                    match event {
                        Some(CentralEvent::DeviceDiscovered(id)
                            | CentralEvent::DeviceUpdated(id)) => {
                            let Ok(peripheral) = self.adapter.peripheral(&id).await else {
                                continue;
                            };
                            let Ok(Some(props)) = peripheral.properties().await else {
                                continue;
                            };
                            let device = DiscoveredDevice {
                                name: props
                                    .local_name
                                    .unwrap_or_else(|| "<unknown>".to_string()),
                                address: props.address.to_string(),
                                rssi: props.rssi,
                            };
                            debug!(
                                "Discovered device: addr={}, name='{}'",
                                device.address, device.name
                            );
                            if let Some(ref cb) = callback {
                                cb.on_device_found(device.clone()).await;
                            }
                            found.insert(device.address.clone(), device);
                        }
                        None => break,
                        _ => {}
                    }
                }
            }
        }

        let _ = self.adapter.stop_scan().await;
        info!("Scan complete: found {} device(s)", found.len());
        Ok(found.into_values().collect())
    }
}
