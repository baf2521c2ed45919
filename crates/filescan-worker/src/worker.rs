//! Scan worker process wiring

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use filescan_core::ScanConfig;
use filescan_db::FileRecordStore;
use filescan_services::{Classifier, ContentFetcher};

use crate::channel::Connector;
use crate::consumer::{Consumer, ConsumerConfig, ConsumerStats};
use crate::dispatcher::{DispatcherConfig, ScanDispatcher};
use crate::manager::{ChannelManager, QueueTopology};

/// One scan worker: a channel to the broker, a consumer loop and the dispatcher
/// it feeds. Several workers may consume the same queue.
pub struct ScanWorker {
    consumer: Consumer,
}

impl ScanWorker {
    pub fn new(
        config: &ScanConfig,
        connector: Arc<dyn Connector>,
        store: Arc<dyn FileRecordStore>,
        fetcher: Arc<dyn ContentFetcher>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let channels = Arc::new(ChannelManager::new(connector, QueueTopology::from(config)));
        let dispatcher = Arc::new(ScanDispatcher::new(
            store,
            fetcher,
            classifier,
            DispatcherConfig::from(config),
        ));
        let consumer = Consumer::new(channels, dispatcher, ConsumerConfig::from(config));
        Self { consumer }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.consumer.stats()
    }

    /// Consume until `shutdown` is cancelled. The message in progress, if any, is
    /// settled before this returns.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.consumer.run(shutdown).await;
    }
}

/// Retry `attempt` at a fixed interval until it succeeds. Returns `None` if
/// `shutdown` is cancelled first.
pub async fn retry_until_ready<T, E, F, Fut>(
    what: &str,
    interval: Duration,
    shutdown: &CancellationToken,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        match attempt().await {
            Ok(value) => {
                if attempts > 1 {
                    tracing::info!(what, attempts, "Connected after retrying");
                }
                return Some(value);
            }
            Err(e) => {
                tracing::warn!(
                    what,
                    error = %e,
                    attempts,
                    retry_in_ms = interval.as_millis() as u64,
                    "Startup dependency unavailable, retrying"
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_at_fixed_interval_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let start = tokio::time::Instant::now();

        let value = retry_until_ready(
            "record store",
            Duration::from_secs(5),
            &CancellationToken::new(),
            move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err("connection refused")
                } else {
                    Ok(42)
                }
            },
        )
        .await;

        assert_eq!(value, Some(42));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retrying() {
        let shutdown = CancellationToken::new();
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(7)).await;
            cancel.cancel();
        });

        let value: Option<()> = retry_until_ready(
            "record store",
            Duration::from_secs(5),
            &shutdown,
            || async { Err::<(), _>("down") },
        )
        .await;

        assert!(value.is_none());
    }
}
