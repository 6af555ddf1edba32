//! Notification channel with a polling fallback.
//!
//! The push path is the primary strategy: a subscription receiver fed by
//! the transport. On platforms where the notification channel fails to
//! establish, [`NotificationChannel::open`] degrades to active polling:
//! read the attribute on a fixed interval up to a bounded attempt count,
//! comparing each read against both the last-seen value and the value whose
//! write triggered the wait, so the poller never re-processes its own
//! trigger.

use log::{debug, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time;
use uuid::Uuid;

use crate::config::PairingConfig;
use crate::error::PairingError;
use crate::transport::CentralTransport;

enum Strategy {
    Push(mpsc::Receiver<Vec<u8>>),
    Poll {
        transport: Arc<dyn CentralTransport>,
        attribute: Uuid,
        interval: Duration,
        attempts: u32,
        last_seen: Option<Vec<u8>>,
    },
}

/// One-attribute update stream, push-based when the platform cooperates and
/// poll-based when it does not.
pub struct NotificationChannel {
    strategy: Strategy,
    /// The value whose write prompted this wait; polling skips it.
    trigger: Option<Vec<u8>>,
}

impl NotificationChannel {
    /// Subscribe to an attribute, degrading to polling if the notification
    /// channel cannot be established.
    pub async fn open(
        transport: Arc<dyn CentralTransport>,
        attribute: Uuid,
        trigger: Option<Vec<u8>>,
        config: &PairingConfig,
    ) -> Self {
        let strategy = match transport.subscribe(attribute).await {
            Ok(rx) => Strategy::Push(rx),
            Err(e) => {
                warn!("subscribe failed ({e}), falling back to polling reads");
                Strategy::Poll {
                    transport,
                    attribute,
                    interval: config.poll_interval,
                    attempts: config.poll_attempts,
                    last_seen: None,
                }
            }
        };
        Self { strategy, trigger }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self.strategy, Strategy::Poll { .. })
    }

    /// Wait for the next genuinely new value.
    ///
    /// Push mode waits up to `wait` for one notification. Poll mode ignores
    /// `wait` and uses its own interval-times-attempts budget; each value is
    /// delivered at most once even if notifications later recover, because
    /// the channel never mixes strategies after `open`.
    pub async fn next(&mut self, wait: Duration) -> Result<Vec<u8>, PairingError> {
        match &mut self.strategy {
            Strategy::Push(rx) => match time::timeout(wait, rx.recv()).await {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(PairingError::Transport(
                    crate::error::TransportError::Subscription(
                        "notification stream closed".to_string(),
                    ),
                )),
                Err(_) => Err(PairingError::Timeout("notification")),
            },
            Strategy::Poll {
                transport,
                attribute,
                interval,
                attempts,
                last_seen,
            } => {
                for attempt in 1..=*attempts {
                    time::sleep(*interval).await;
                    let value = transport.read(*attribute).await?;
                    if value.is_empty() {
                        continue;
                    }
                    let is_trigger = self.trigger.as_deref() == Some(value.as_slice());
                    let is_stale = last_seen.as_deref() == Some(value.as_slice());
                    if is_trigger || is_stale {
                        continue;
                    }
                    debug!("poll attempt {attempt} found a new value");
                    *last_seen = Some(value.clone());
                    return Ok(value);
                }
                Err(PairingError::Timeout("poll budget exhausted"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Transport whose subscribe always fails and whose reads replay a
    /// scripted sequence of values.
    struct ScriptedReads {
        reads: Mutex<Vec<Vec<u8>>>,
        read_count: AtomicU32,
    }

    impl ScriptedReads {
        fn new(reads: Vec<Vec<u8>>) -> Self {
            Self {
                reads: Mutex::new(reads),
                read_count: AtomicU32::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl CentralTransport for ScriptedReads {
        async fn connect(&self, _peer: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn write(&self, _attribute: Uuid, _payload: &[u8]) -> Result<(), TransportError> {
            Ok(())
        }

        async fn subscribe(
            &self,
            _attribute: Uuid,
        ) -> Result<mpsc::Receiver<Vec<u8>>, TransportError> {
            Err(TransportError::Subscription("unsupported".to_string()))
        }

        async fn read(&self, _attribute: Uuid) -> Result<Vec<u8>, TransportError> {
            self.read_count.fetch_add(1, Ordering::SeqCst);
            let mut reads = self.reads.lock().unwrap();
            if reads.len() > 1 {
                Ok(reads.remove(0))
            } else {
                Ok(reads.first().cloned().unwrap_or_default())
            }
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn fast_config() -> PairingConfig {
        PairingConfig {
            poll_interval: Duration::from_millis(1),
            poll_attempts: 40,
            ..PairingConfig::default()
        }
    }

    #[tokio::test]
    async fn falls_back_to_polling_and_skips_the_trigger_value() {
        // attempts 1-2 echo the triggering write, 3-4 are empty, 5 is new
        let transport = Arc::new(ScriptedReads::new(vec![
            b"AB12CD".to_vec(),
            b"AB12CD".to_vec(),
            vec![],
            vec![],
            b"TAB-000123".to_vec(),
        ]));
        let config = fast_config();

        let mut channel = NotificationChannel::open(
            transport.clone(),
            crate::ble::IDENTITY_CHAR_UUID,
            Some(b"AB12CD".to_vec()),
            &config,
        )
        .await;
        assert!(channel.is_polling());

        let value = channel.next(Duration::from_secs(1)).await.unwrap();
        assert_eq!(value, b"TAB-000123");
        assert_eq!(transport.read_count.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn repeated_values_are_delivered_once() {
        // after the new value arrives, every later read repeats it
        let transport = Arc::new(ScriptedReads::new(vec![
            vec![],
            b"TAB-000123".to_vec(),
        ]));
        let config = PairingConfig {
            poll_attempts: 5,
            ..fast_config()
        };

        let mut channel = NotificationChannel::open(
            transport,
            crate::ble::IDENTITY_CHAR_UUID,
            None,
            &config,
        )
        .await;

        let first = channel.next(Duration::from_secs(1)).await.unwrap();
        assert_eq!(first, b"TAB-000123");

        // the same value again is stale, so the budget runs out
        let second = channel.next(Duration::from_secs(1)).await;
        assert!(matches!(second, Err(PairingError::Timeout(_))));
    }

    #[tokio::test]
    async fn poll_budget_exhaustion_times_out() {
        let transport = Arc::new(ScriptedReads::new(vec![vec![]]));
        let config = PairingConfig {
            poll_attempts: 3,
            ..fast_config()
        };

        let mut channel = NotificationChannel::open(
            transport.clone(),
            crate::ble::IDENTITY_CHAR_UUID,
            None,
            &config,
        )
        .await;

        let result = channel.next(Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PairingError::Timeout(_))));
        assert_eq!(transport.read_count.load(Ordering::SeqCst), 3);
    }
}
