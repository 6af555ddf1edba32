//! End-to-end handshake tests over an in-memory transport pair.
//!
//! `MemoryCentral` and `MemoryPeripheral` wire the two state machines
//! together the way the BLE adapters would: central writes land on the
//! responder's inbound channel, responder pushes land on the central's
//! subscription channel, and pushed values stay readable for the polling
//! fallback.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use blepair_core::codec::{self, PayloadKind};
use blepair_core::pairing::{Responder, ResponderEvent, SimpleResponderCallback};
use blepair_core::{
    AttributeSpec, CentralTransport, ConfirmationHook, FragmentScheme, InboundWrite, Initiator,
    InitiatorEvents, InitiatorOutcome, InitiatorState, MockIssuer, PairingConfig, PairingError,
    PairingRecord, PeripheralTransport, ResponderEvents, TransportError,
};

/// State shared by both ends of the in-memory link.
struct Link {
    /// Central-side subscriptions per attribute.
    subscribers: Mutex<HashMap<Uuid, mpsc::Sender<Vec<u8>>>>,
    /// Last pushed value per attribute, for polling reads.
    values: Mutex<HashMap<Uuid, Vec<u8>>>,
    /// Every successful notify, in order.
    pushes: Mutex<Vec<(Uuid, Vec<u8>)>>,
    writes_seen: AtomicU32,
    /// When set, the Nth write (1-based) fails.
    fail_write_at: Option<u32>,
}

impl Link {
    fn with_failure_at(fail_write_at: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            values: Mutex::new(HashMap::new()),
            pushes: Mutex::new(Vec::new()),
            writes_seen: AtomicU32::new(0),
            fail_write_at,
        })
    }

    fn new() -> Arc<Self> {
        Self::with_failure_at(None)
    }

    fn failing_at(n: u32) -> Arc<Self> {
        Self::with_failure_at(Some(n))
    }
}

struct MemoryCentral {
    link: Arc<Link>,
    inbound: mpsc::Sender<InboundWrite>,
    /// When false, `subscribe` fails and the initiator must poll.
    subscriptions_work: bool,
}

#[async_trait::async_trait]
impl CentralTransport for MemoryCentral {
    async fn connect(&self, _peer: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn write(&self, attribute: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        let n = self.link.writes_seen.fetch_add(1, Ordering::SeqCst) + 1;
        if self.link.fail_write_at == Some(n) {
            return Err(TransportError::Connection("link dropped".to_string()));
        }
        let event = InboundWrite {
            peer: "initiator-1".to_string(),
            attribute,
            payload: payload.to_vec(),
        };
        self.inbound
            .send(event)
            .await
            .map_err(|_| TransportError::Connection("responder gone".to_string()))
    }

    async fn subscribe(
        &self,
        attribute: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
        if !self.subscriptions_work {
            return Err(TransportError::Subscription(
                "notifications unavailable".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(8);
        self.link.subscribers.lock().unwrap().insert(attribute, tx);
        Ok(rx)
    }

    async fn read(&self, attribute: Uuid) -> Result<Vec<u8>, TransportError> {
        Ok(self
            .link
            .values
            .lock()
            .unwrap()
            .get(&attribute)
            .cloned()
            .unwrap_or_default())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

struct MemoryPeripheral {
    link: Arc<Link>,
}

#[async_trait::async_trait]
impl PeripheralTransport for MemoryPeripheral {
    async fn configure(
        &self,
        _service: Uuid,
        _attributes: &[AttributeSpec],
    ) -> Result<(), TransportError> {
        Ok(())
    }

    async fn advertise(&self, _name: &str, _duration: Duration) -> Result<(), TransportError> {
        Ok(())
    }

    async fn stop_advertising(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn notify(&self, attribute: Uuid, payload: &[u8]) -> Result<(), TransportError> {
        // the value stays readable even when nobody is subscribed, so
        // polling centrals still see the push
        self.link
            .values
            .lock()
            .unwrap()
            .insert(attribute, payload.to_vec());

        let subscriber = self.link.subscribers.lock().unwrap().get(&attribute).cloned();
        let Some(tx) = subscriber else {
            return Err(TransportError::Subscription(
                "no peer subscribed".to_string(),
            ));
        };
        tx.send(payload.to_vec())
            .await
            .map_err(|_| TransportError::Subscription("subscriber gone".to_string()))?;
        self.link
            .pushes
            .lock()
            .unwrap()
            .push((attribute, payload.to_vec()));
        Ok(())
    }
}

/// Timings shortened so the full handshake runs in milliseconds.
fn test_config() -> PairingConfig {
    PairingConfig {
        settle_after_connect: false,
        poll_interval: Duration::from_millis(2),
        poll_attempts: 200,
        notify_wait: Duration::from_secs(2),
        confirmation_timeout: Duration::from_millis(100),
        inter_fragment_delay: Duration::from_millis(1),
        ..PairingConfig::default()
    }
}

struct QuietInitiator;
impl InitiatorEvents for QuietInitiator {
    fn on_status(&self, _status: &str) {}
}

struct QuietResponder;
impl ResponderEvents for QuietResponder {
    fn on_status(&self, _status: &str) {}
}

struct AlwaysConfirm;
#[async_trait::async_trait]
impl ConfirmationHook for AlwaysConfirm {
    async fn confirm(&self, _code: &str) -> bool {
        true
    }
}

struct NeverAnswers;
#[async_trait::async_trait]
impl ConfirmationHook for NeverAnswers {
    async fn confirm(&self, _code: &str) -> bool {
        std::future::pending().await
    }
}

struct AlwaysDecline;
#[async_trait::async_trait]
impl ConfirmationHook for AlwaysDecline {
    async fn confirm(&self, _code: &str) -> bool {
        false
    }
}

/// Run both roles to completion over one link and return both ends' view.
async fn run_handshake(
    link: Arc<Link>,
    config: PairingConfig,
    subscriptions_work: bool,
) -> (
    Result<InitiatorOutcome, PairingError>,
    Option<PairingRecord>,
    Vec<ResponderEvent>,
) {
    let (inbound_tx, inbound_rx) = mpsc::channel(32);

    let peripheral = Arc::new(MemoryPeripheral { link: link.clone() });
    let mut responder = Responder::new(
        peripheral,
        "TAB-000123".to_string(),
        config.clone(),
    );
    let (responder_cb, mut events_rx) = SimpleResponderCallback::new();
    let responder_task =
        tokio::spawn(async move { responder.run(inbound_rx, &responder_cb).await });

    let central = Arc::new(MemoryCentral {
        link,
        inbound: inbound_tx,
        subscriptions_work,
    });
    let issuer = Arc::new(MockIssuer::with_latency(Duration::ZERO));
    let mut initiator = Initiator::new(central, issuer, config);
    let outcome = initiator
        .pair_with_code("responder", "AB12CD", &QuietInitiator)
        .await;

    // dropping the initiator's transport closes the inbound channel and
    // ends the responder loop
    drop(initiator);
    let record = responder_task.await.unwrap().unwrap();

    let mut events = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        events.push(event);
    }
    (outcome, record, events)
}

#[tokio::test]
async fn full_handshake_over_notifications() {
    let (outcome, record, events) = run_handshake(Link::new(), test_config(), true).await;

    let outcome = outcome.expect("initiator should complete");
    assert_eq!(outcome.identity, "TAB-000123");
    assert_eq!(codec::classify(&outcome.credential), PayloadKind::Credential);

    let record = record.expect("responder should record the pairing");
    assert_eq!(record.connection_code, "AB12CD");
    assert_eq!(record.serial_number, "TAB-000123");
    assert_eq!(record.jwt_token, outcome.credential);

    let paired = events
        .iter()
        .filter(|e| matches!(e, ResponderEvent::Paired(_)))
        .count();
    assert_eq!(paired, 1);
}

#[tokio::test]
async fn full_handshake_falls_back_to_polling() {
    // subscriptions refused on purpose: the identity must still arrive,
    // exactly once, through polled reads
    let (outcome, record, _) = run_handshake(Link::new(), test_config(), false).await;

    let outcome = outcome.expect("polling fallback should complete the handshake");
    assert_eq!(outcome.identity, "TAB-000123");
    assert!(record.is_some());
}

#[tokio::test]
async fn full_handshake_with_sentinel_framing() {
    let config = PairingConfig {
        fragment_scheme: FragmentScheme::Sentinel,
        ..test_config()
    };
    let (outcome, record, _) = run_handshake(Link::new(), config, true).await;

    let outcome = outcome.expect("sentinel framing should still complete");
    let record = record.expect("responder should reassemble the sentinel stream");
    assert_eq!(record.jwt_token, outcome.credential);
}

#[tokio::test]
async fn confirmed_handshake_completes() {
    let link = Link::new();
    let (inbound_tx, inbound_rx) = mpsc::channel(32);

    let peripheral = Arc::new(MemoryPeripheral { link: link.clone() });
    let mut responder = Responder::new(peripheral, "DEV-000007".to_string(), test_config())
        .with_confirmation(Arc::new(AlwaysConfirm));
    let responder_task =
        tokio::spawn(async move { responder.run(inbound_rx, &QuietResponder).await });

    let central = Arc::new(MemoryCentral {
        link,
        inbound: inbound_tx,
        subscriptions_work: true,
    });
    let issuer = Arc::new(MockIssuer::with_latency(Duration::ZERO));
    let mut initiator = Initiator::new(central, issuer, test_config());
    let outcome = initiator.pair("responder", &QuietInitiator).await;

    drop(initiator);
    let record = responder_task.await.unwrap().unwrap();
    assert_eq!(outcome.unwrap().identity, "DEV-000007");
    assert!(record.is_some());
}

#[tokio::test]
async fn malformed_code_creates_no_session() {
    let link = Link::new();
    let peripheral = Arc::new(MemoryPeripheral { link: link.clone() });
    let mut responder = Responder::new(peripheral, "TAB-000123".to_string(), test_config());

    let write = InboundWrite {
        peer: "stranger".to_string(),
        attribute: blepair_core::CODE_CHAR_UUID,
        payload: b"abc".to_vec(),
    };
    let result = responder.handle_write(&write, &QuietResponder).await;

    assert!(matches!(result, Ok(None)));
    assert!(responder.sessions().code("stranger").await.is_none());
    // no identity went out for a rejected code
    assert!(link.pushes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn stray_fragment_before_any_code_is_dropped() {
    let link = Link::new();
    let peripheral = Arc::new(MemoryPeripheral { link });
    let mut responder = Responder::new(peripheral, "TAB-000123".to_string(), test_config());

    let write = InboundWrite {
        peer: "stranger".to_string(),
        attribute: blepair_core::CREDENTIAL_CHAR_UUID,
        payload: vec![0, 3, 1, 2, 3],
    };
    let result = responder.handle_write(&write, &QuietResponder).await;

    assert!(matches!(result, Ok(None)));
    assert!(responder.sessions().is_empty().await);
}

#[tokio::test]
async fn unanswered_confirmation_times_out_without_sending_identity() {
    let link = Link::new();
    let peripheral = Arc::new(MemoryPeripheral { link: link.clone() });
    let mut responder = Responder::new(peripheral, "TAB-000123".to_string(), test_config())
        .with_confirmation(Arc::new(NeverAnswers));

    let write = InboundWrite {
        peer: "initiator-1".to_string(),
        attribute: blepair_core::CODE_CHAR_UUID,
        payload: b"AB12CD".to_vec(),
    };
    let result = responder.handle_write(&write, &QuietResponder).await;

    assert!(matches!(result, Err(PairingError::Timeout(_))));
    assert!(link.pushes.lock().unwrap().is_empty());

    // the lapsed attempt left no session, so a credential written anyway
    // cannot complete the pairing
    assert!(responder.sessions().is_empty().await);
    let delivery = InboundWrite {
        peer: "initiator-1".to_string(),
        attribute: blepair_core::CREDENTIAL_CHAR_UUID,
        payload: b"eyJhbGc.eyJzdWI.c2ln".to_vec(),
    };
    let result = responder.handle_write(&delivery, &QuietResponder).await;
    assert!(matches!(result, Err(PairingError::Validation(_))));
}

#[tokio::test]
async fn declined_confirmation_clears_the_session() {
    let link = Link::new();
    let peripheral = Arc::new(MemoryPeripheral { link: link.clone() });
    let mut responder = Responder::new(peripheral, "TAB-000123".to_string(), test_config())
        .with_confirmation(Arc::new(AlwaysDecline));

    let write = InboundWrite {
        peer: "initiator-1".to_string(),
        attribute: blepair_core::CODE_CHAR_UUID,
        payload: b"AB12CD".to_vec(),
    };
    let result = responder.handle_write(&write, &QuietResponder).await;

    assert!(matches!(result, Err(PairingError::Cancelled)));
    assert!(responder.sessions().is_empty().await);
    assert!(link.pushes.lock().unwrap().is_empty());
}

#[tokio::test]
async fn code_attribute_never_carries_credentials() {
    let link = Link::new();
    let peripheral = Arc::new(MemoryPeripheral { link });
    let mut responder = Responder::new(peripheral, "TAB-000123".to_string(), test_config());

    // a credential-shaped payload on the code attribute is a malformed
    // code, not a completion
    let write = InboundWrite {
        peer: "initiator-1".to_string(),
        attribute: blepair_core::CODE_CHAR_UUID,
        payload: b"eyJhbGc.eyJzdWI.c2ln".to_vec(),
    };
    let result = responder.handle_write(&write, &QuietResponder).await;

    assert!(matches!(result, Ok(None)));
    assert!(responder.sessions().is_empty().await);
}

#[tokio::test]
async fn unrecognized_attribute_falls_back_to_classification() {
    let link = Link::new();
    let peripheral = Arc::new(MemoryPeripheral { link });
    let mut responder = Responder::new(peripheral, "TAB-000123".to_string(), test_config());

    // single-attribute peers write codes wherever they can; the shape
    // still identifies them
    let write = InboundWrite {
        peer: "initiator-1".to_string(),
        attribute: blepair_core::STATUS_CHAR_UUID,
        payload: b"AB12CD".to_vec(),
    };
    // the identity push fails (nobody subscribed) but the code is stored
    let _ = responder.handle_write(&write, &QuietResponder).await;

    assert_eq!(
        responder.sessions().code("initiator-1").await.as_deref(),
        Some("AB12CD")
    );
}

#[tokio::test]
async fn malformed_code_errors_the_initiator() {
    let link = Link::new();
    let (inbound_tx, _inbound_rx) = mpsc::channel(32);
    let central = Arc::new(MemoryCentral {
        link,
        inbound: inbound_tx,
        subscriptions_work: true,
    });
    let issuer = Arc::new(MockIssuer::with_latency(Duration::ZERO));
    let mut initiator = Initiator::new(central, issuer, test_config());

    let result = initiator
        .pair_with_code("responder", "bad!", &QuietInitiator)
        .await;

    assert!(matches!(result, Err(PairingError::Validation(_))));
    assert_eq!(initiator.state(), InitiatorState::Errored);
}

#[tokio::test]
async fn failed_fragment_write_aborts_the_transfer() {
    // write 1 is the code; failing write 4 kills the third credential
    // fragment mid-transfer
    let link = Link::failing_at(4);
    let (outcome, record, _) = run_handshake(link.clone(), test_config(), true).await;

    match outcome {
        Err(PairingError::Transport(TransportError::Connection(_))) => {}
        other => panic!("expected a transport failure, got {other:?}"),
    }
    // nothing was written after the failed fragment
    assert_eq!(link.writes_seen.load(Ordering::SeqCst), 4);
    assert!(record.is_none());
}

#[tokio::test]
async fn duplicate_credential_delivery_pairs_once() {
    let link = Link::new();
    let peripheral = Arc::new(MemoryPeripheral { link });
    let mut responder = Responder::new(peripheral, "TAB-000123".to_string(), test_config());

    let issuer = MockIssuer::with_latency(Duration::ZERO);
    let credential = {
        use blepair_core::CredentialIssuer;
        issuer.issue("TAB-000123").await.unwrap()
    };

    let code = InboundWrite {
        peer: "initiator-1".to_string(),
        attribute: blepair_core::CODE_CHAR_UUID,
        payload: b"AB12CD".to_vec(),
    };
    // identity notify fails (nobody subscribed) but the session survives
    let _ = responder.handle_write(&code, &QuietResponder).await;

    let delivery = InboundWrite {
        peer: "initiator-1".to_string(),
        attribute: blepair_core::CREDENTIAL_CHAR_UUID,
        payload: credential.clone().into_bytes(),
    };
    let first = responder
        .handle_write(&delivery, &QuietResponder)
        .await
        .unwrap();
    let second = responder
        .handle_write(&delivery, &QuietResponder)
        .await
        .unwrap();

    assert_eq!(first.unwrap().jwt_token, credential);
    assert!(second.is_none());
}
