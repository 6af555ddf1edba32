//! Peripheral-role transport adapter over bluer (BlueZ D-Bus).
//!
//! Owns the GATT application and advertisement handles; dropping them tears
//! the service down, so cleanup happens on every exit path. Inbound writes
//! are funneled into one mpsc channel so the state machine sees a single
//! serialized event stream.

use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
    CharacteristicWriteMethod, Service,
};
use futures_util::FutureExt;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

use crate::error::TransportError;
use crate::transport::{AttributeSpec, InboundWrite, PeripheralTransport};

pub struct BlePeripheral {
    _session: bluer::Session,
    adapter: bluer::Adapter,
    write_tx: mpsc::Sender<InboundWrite>,
    write_rx: Option<mpsc::Receiver<InboundWrite>>,
    /// Current value per readable attribute; polled by centrals whose
    /// notification channel failed.
    values: Arc<Mutex<HashMap<Uuid, Vec<u8>>>>,
    /// Live notifier per attribute, registered when a central subscribes.
    notifiers: Arc<Mutex<HashMap<Uuid, CharacteristicNotifier>>>,
    notifiable: Mutex<HashSet<Uuid>>,
    service_uuid: Mutex<Option<Uuid>>,
    app_handle: Mutex<Option<ApplicationHandle>>,
    adv_handle: Mutex<Option<AdvertisementHandle>>,
}

impl BlePeripheral {
    pub async fn new() -> Result<Self, TransportError> {
        let session = bluer::Session::new()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let adapter = session
            .default_adapter()
            .await
            .map_err(|_| TransportError::NoAdapter)?;
        adapter
            .set_powered(true)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        let (write_tx, write_rx) = mpsc::channel(32);

        Ok(Self {
            _session: session,
            adapter,
            write_tx,
            write_rx: Some(write_rx),
            values: Arc::new(Mutex::new(HashMap::new())),
            notifiers: Arc::new(Mutex::new(HashMap::new())),
            notifiable: Mutex::new(HashSet::new()),
            service_uuid: Mutex::new(None),
            app_handle: Mutex::new(None),
            adv_handle: Mutex::new(None),
        })
    }

    /// The serialized inbound-write stream. Can be taken once.
    pub fn take_write_receiver(&mut self) -> Option<mpsc::Receiver<InboundWrite>> {
        self.write_rx.take()
    }

    fn build_characteristic(&self, spec: &AttributeSpec) -> Characteristic {
        let mut characteristic = Characteristic {
            uuid: spec.uuid,
            ..Default::default()
        };

        if spec.readable {
            let values = self.values.clone();
            let uuid = spec.uuid;
            characteristic.read = Some(CharacteristicRead {
                read: true,
                fun: Box::new(move |req| {
                    let values = values.clone();
                    async move {
                        let values = values.lock().await;
                        let data = values.get(&uuid).cloned().unwrap_or_default();
                        let offset = req.offset as usize;
                        if offset >= data.len() {
                            return Ok(vec![]);
                        }
                        Ok(data[offset..].to_vec())
                    }
                    .boxed()
                }),
                ..Default::default()
            });
        }

        if spec.writable {
            let write_tx = self.write_tx.clone();
            let uuid = spec.uuid;
            characteristic.write = Some(CharacteristicWrite {
                write: true,
                write_without_response: true,
                method: CharacteristicWriteMethod::Fun(Box::new(move |data, req| {
                    let write_tx = write_tx.clone();
                    async move {
                        let event = InboundWrite {
                            peer: req.device_address.to_string(),
                            attribute: uuid,
                            payload: data,
                        };
                        // the dispatcher must see every accepted write
                        // exactly once; a closed channel means shutdown,
                        // never a GATT-level failure
                        if write_tx.send(event).await.is_err() {
                            warn!("inbound write dropped: dispatcher is gone");
                        }
                        Ok(())
                    }
                    .boxed()
                })),
                ..Default::default()
            });
        }

        if spec.notifiable {
            // BlueZ adds the client configuration descriptor (CCCD) for
            // notify characteristics itself; without it iOS and Android
            // centrals cannot enable notifications
            let notifiers = self.notifiers.clone();
            let uuid = spec.uuid;
            characteristic.notify = Some(CharacteristicNotify {
                notify: true,
                method: CharacteristicNotifyMethod::Fun(Box::new(move |notifier| {
                    let notifiers = notifiers.clone();
                    async move {
                        debug!("central subscribed to {uuid}");
                        notifiers.lock().await.insert(uuid, notifier);
                    }
                    .boxed()
                })),
                ..Default::default()
            });
        }

        characteristic
    }
}

#[async_trait::async_trait]
impl PeripheralTransport for BlePeripheral {
    async fn configure(
        &self,
        service: Uuid,
        attributes: &[AttributeSpec],
    ) -> Result<(), TransportError> {
        // re-configuration first clears any prior service; a fresh process
        // has nothing to clear, which is not an error
        if self.app_handle.lock().await.take().is_some() {
            debug!("cleared previously registered GATT application");
        }
        self.notifiers.lock().await.clear();

        let characteristics = attributes
            .iter()
            .map(|spec| self.build_characteristic(spec))
            .collect();

        let app = Application {
            services: vec![Service {
                uuid: service,
                primary: true,
                characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };

        let handle = self
            .adapter
            .serve_gatt_application(app)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        *self.app_handle.lock().await = Some(handle);
        *self.service_uuid.lock().await = Some(service);

        let mut notifiable = self.notifiable.lock().await;
        notifiable.clear();
        notifiable.extend(attributes.iter().filter(|a| a.notifiable).map(|a| a.uuid));

        debug!(
            "GATT application registered: service={service}, {} attribute(s)",
            attributes.len()
        );
        Ok(())
    }

    async fn advertise(
        &self,
        device_name: &str,
        duration: Duration,
    ) -> Result<(), TransportError> {
        let service = self
            .service_uuid
            .lock()
            .await
            .ok_or(TransportError::NotSupported("advertise before configure"))?;

        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: vec![service].into_iter().collect(),
            discoverable: Some(true),
            local_name: Some(device_name.to_string()),
            timeout: (duration > Duration::ZERO).then_some(duration),
            ..Default::default()
        };

        let handle = self
            .adapter
            .advertise(adv)
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        *self.adv_handle.lock().await = Some(handle);

        info!("BLE advertisement started as '{device_name}'");
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        // dropping the handle unregisters the advertisement; stopping an
        // already-stopped advertisement is a no-op
        if self.adv_handle.lock().await.take().is_some() {
            info!("BLE advertisement stopped");
        }
        Ok(())
    }

    async fn notify(&self, attribute: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        if !self.notifiable.lock().await.contains(&attribute) {
            return Err(TransportError::NotSupported(
                "attribute lacks the notify property",
            ));
        }

        // keep the readable value current so polling centrals see the push
        self.values
            .lock()
            .await
            .insert(attribute, payload.to_vec());

        let mut notifiers = self.notifiers.lock().await;
        let Some(notifier) = notifiers.get_mut(&attribute) else {
            return Err(TransportError::Subscription(
                "no peer subscribed to this attribute".to_string(),
            ));
        };

        if let Err(e) = notifier.notify(payload.to_vec()).await {
            notifiers.remove(&attribute);
            return Err(TransportError::Subscription(e.to_string()));
        }
        Ok(())
    }
}
