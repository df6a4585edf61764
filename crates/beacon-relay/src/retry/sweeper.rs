//! Background sweep task.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use super::manager::{RetryManager, Transmit};

impl RetryManager {
    /// Spawn the periodic sweep.
    ///
    /// The first sweep runs one full interval after start. A sweep that
    /// overruns the interval delays the next tick rather than bursting.
    /// Each tick first drops registrations whose connection is already
    /// gone, so their deliveries wait as offline.
    pub fn start_sweeper(self: &Arc<Self>, sink: Arc<dyn Transmit>) -> SweeperHandle {
        let manager = Arc::clone(self);
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let period = self.config().sweep_interval;

        let handle = tokio::spawn(
            async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                info!(interval_ms = period.as_millis() as u64, "Retry sweeper started");

                loop {
                    tokio::select! {
                        _ = cancelled.cancelled() => break,
                        _ = ticker.tick() => {
                            manager.registry().cleanup_stale();
                            let report = manager.sweep(sink.as_ref());
                            if !report.is_idle() {
                                debug!(
                                    resent = report.resent,
                                    exhausted = report.exhausted,
                                    skipped_offline = report.skipped_offline,
                                    pending = manager.len(),
                                    "Retry sweep finished"
                                );
                            }
                        }
                    }
                }

                debug!("Retry sweeper stopped");
            }
            .instrument(info_span!("beacon.retry.sweeper")),
        );

        SweeperHandle {
            token,
            handle: Some(handle),
        }
    }
}

/// Handle for the background sweep task.
///
/// Dropping the handle stops the sweep.
#[derive(Debug)]
pub struct SweeperHandle {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Signal the sweep to stop after the current pass.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Stop the sweep and wait for the task to finish.
    pub async fn join(mut self) -> Result<(), tokio::task::JoinError> {
        self.token.cancel();
        match self.handle.take() {
            Some(handle) => handle.await,
            None => Ok(()),
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::registry::{ConnectionHandle, ConnectionRegistry, SendResult};
    use crate::retry::RetryConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct CountingSink {
        sends: AtomicUsize,
    }

    impl Transmit for CountingSink {
        fn transmit(&self, _recipient: &str, _message: &Message) -> SendResult {
            self.sends.fetch_add(1, Ordering::SeqCst);
            SendResult::Sent
        }
    }

    fn setup() -> (Arc<RetryManager>, Arc<CountingSink>, mpsc::Receiver<bytes::Bytes>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, rx) = mpsc::channel(8);
        registry.register(
            "alice",
            ConnectionHandle::new(
                registry.next_connection_id(),
                "127.0.0.1:40000".parse().unwrap(),
                tx,
                CancellationToken::new(),
            ),
        );
        let config = RetryConfig {
            sweep_interval: Duration::from_secs(5),
            max_retries: 3,
            min_retry_delay: Duration::from_secs(2),
        };
        let manager = Arc::new(RetryManager::new(config, registry));
        (manager, Arc::new(CountingSink::default()), rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_resends_on_each_tick() {
        let (manager, sink, _rx) = setup();
        let msg = Message::chat("hi", "alice");
        manager.add("alice", &msg).unwrap();

        let handle = manager.start_sweeper(Arc::clone(&sink) as Arc<dyn Transmit>);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(sink.sends.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.sends.load(Ordering::SeqCst), 2);
        assert_eq!(manager.retry_count("alice", &msg.message_id), Some(2));

        handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_drops_stale_registrations() {
        let (manager, sink, rx) = setup();
        let msg = Message::chat("hi", "alice");
        manager.add("alice", &msg).unwrap();

        // Connection task gone without unregistering.
        drop(rx);
        let handle = manager.start_sweeper(Arc::clone(&sink) as Arc<dyn Transmit>);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert!(!manager.registry().is_online("alice"));
        assert_eq!(sink.sends.load(Ordering::SeqCst), 0);
        assert_eq!(manager.retry_count("alice", &msg.message_id), Some(0));

        handle.join().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_sweeper_sends_nothing() {
        let (manager, sink, _rx) = setup();
        manager.add("alice", &Message::chat("hi", "alice")).unwrap();

        let handle = manager.start_sweeper(Arc::clone(&sink) as Arc<dyn Transmit>);
        handle.stop();
        assert!(handle.is_stopped());
        handle.join().await.unwrap();

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(sink.sends.load(Ordering::SeqCst), 0);
        assert_eq!(manager.len(), 1);
    }
}
