//! Consume loop
//!
//! Pulls one delivery at a time from the scan queue through the shared
//! [`ChannelManager`], hands it to a [`DeliveryHandler`] and settles it with the
//! returned [`Resolution`]. When the broker is unreachable or the channel drops,
//! the loop waits a fixed interval and reconnects; queue setup is replayed by the
//! manager. Idle waits end on a broker notification or the poll interval,
//! whichever comes first.
//!
//! Shutdown is only observed between deliveries: a delivery already handed to the
//! handler always runs to ack or reject.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use filescan_core::ScanConfig;

use crate::channel::{Delivery, DeliveryHandler, MessageChannel, Resolution};
use crate::manager::ChannelManager;

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    pub reconnect_interval: Duration,
    pub poll_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(1000),
        }
    }
}

impl From<&ScanConfig> for ConsumerConfig {
    fn from(config: &ScanConfig) -> Self {
        Self {
            reconnect_interval: config.reconnect_interval(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// Counters kept across the life of a consumer.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    acked: AtomicU64,
    rejected: AtomicU64,
    reconnects: AtomicU64,
}

impl ConsumerStats {
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn settled(&self) -> u64 {
        self.acked() + self.rejected()
    }
}

pub struct Consumer {
    channels: Arc<ChannelManager>,
    handler: Arc<dyn DeliveryHandler>,
    config: ConsumerConfig,
    stats: Arc<ConsumerStats>,
}

enum Step {
    Handled,
    /// Nothing to receive; wait on the channel's notifier.
    Idle(Arc<Notify>),
    Reconnect,
    Retry,
}

async fn pause(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = sleep(duration) => {}
    }
}

impl Consumer {
    pub fn new(
        channels: Arc<ChannelManager>,
        handler: Arc<dyn DeliveryHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            channels,
            handler,
            config,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.stats.clone()
    }

    /// Consume until `shutdown` is cancelled, then close the channel.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            queue = %self.channels.queue_name(),
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            reconnect_interval_ms = self.config.reconnect_interval.as_millis() as u64,
            "Scan consumer started"
        );

        while !shutdown.is_cancelled() {
            match self.step().await {
                Step::Handled => {}
                Step::Idle(notify) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => {}
                        _ = notify.notified() => {}
                        _ = sleep(self.config.poll_interval) => {}
                    }
                }
                Step::Reconnect => {
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    pause(&shutdown, self.config.reconnect_interval).await;
                }
                Step::Retry => pause(&shutdown, self.config.poll_interval).await,
            }
        }

        self.channels.shutdown().await;
        tracing::info!(
            acked = self.stats.acked(),
            rejected = self.stats.rejected(),
            "Scan consumer stopped"
        );
    }

    async fn step(&self) -> Step {
        let channel = match self.channels.channel().await {
            Ok(channel) => channel,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    retry_in_ms = self.config.reconnect_interval.as_millis() as u64,
                    "Broker unavailable, will reconnect"
                );
                return Step::Reconnect;
            }
        };

        match channel.next_delivery(self.channels.queue_name()).await {
            Ok(Some(delivery)) => {
                self.settle(channel.as_ref(), delivery).await;
                Step::Handled
            }
            Ok(None) => Step::Idle(channel.notifier()),
            Err(e) if e.is_connection_error() => {
                tracing::warn!(error = %e, "Lost broker channel while waiting for messages");
                self.channels.invalidate().await;
                Step::Reconnect
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to receive scan message");
                Step::Retry
            }
        }
    }

    async fn settle(&self, channel: &dyn MessageChannel, delivery: Delivery) {
        let resolution = self.handler.handle(&delivery).await;

        let settled = match resolution {
            Resolution::Ack => channel.ack(delivery.tag).await,
            Resolution::Reject { requeue } => channel.reject(delivery.tag, requeue).await,
        };

        match settled {
            Ok(()) => {
                let counter = match resolution {
                    Resolution::Ack => &self.stats.acked,
                    Resolution::Reject { .. } => &self.stats.rejected,
                };
                counter.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                // The broker redelivers the message once the channel is gone.
                tracing::error!(
                    error = %e,
                    tag = delivery.tag,
                    resolution = ?resolution,
                    "Failed to settle scan message"
                );
                if e.is_connection_error() {
                    self.channels.invalidate().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{Connector, MemoryBroker, PublishOptions};
    use crate::manager::QueueTopology;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Acks everything except bodies starting with `bad`, recording what it saw.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    #[async_trait]
    impl DeliveryHandler for Recorder {
        async fn handle(&self, delivery: &Delivery) -> Resolution {
            self.seen
                .lock()
                .unwrap()
                .push((delivery.body.clone(), delivery.redelivered));
            if delivery.body.starts_with(b"bad") {
                Resolution::discard()
            } else {
                Resolution::Ack
            }
        }
    }

    fn consumer(broker: &MemoryBroker, handler: Arc<Recorder>) -> (Arc<ChannelManager>, Consumer) {
        let channels = Arc::new(ChannelManager::new(
            Arc::new(broker.connector()),
            QueueTopology::new("scan").with_dead_letter("scan.dead"),
        ));
        let consumer = Consumer::new(channels.clone(), handler, ConsumerConfig::default());
        (channels, consumer)
    }

    async fn wait_for(stats: &ConsumerStats, settled: u64) {
        while stats.settled() < settled {
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settles_messages_in_order_and_survives_rejects() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Recorder::default());
        let (channels, consumer) = consumer(&broker, handler.clone());
        let channel = channels.channel().await.unwrap();
        for body in [&b"one"[..], b"bad body", b"two"] {
            channel
                .publish("scan", body, PublishOptions::default())
                .await
                .unwrap();
        }

        let stats = consumer.stats();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { consumer.run(shutdown).await }
        });
        wait_for(&stats, 3).await;
        shutdown.cancel();
        run.await.unwrap();

        let seen: Vec<Vec<u8>> = handler.seen.lock().unwrap().iter().map(|(b, _)| b.clone()).collect();
        assert_eq!(seen, vec![b"one".to_vec(), b"bad body".to_vec(), b"two".to_vec()]);
        assert_eq!(stats.acked(), 2);
        assert_eq!(stats.rejected(), 1);
        assert_eq!(broker.queue_len("scan"), 0);
        assert_eq!(broker.messages("scan.dead"), vec![b"bad body".to_vec()]);
        assert_eq!(broker.open_channels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_broker_restart() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Recorder::default());
        let (channels, consumer) = consumer(&broker, handler.clone());
        channels.channel().await.unwrap();

        let stats = consumer.stats();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { consumer.run(shutdown).await }
        });

        broker.set_reachable(false);
        sleep(Duration::from_secs(12)).await;
        broker.set_reachable(true);
        broker.push_raw("scan", b"after outage").unwrap();
        wait_for(&stats, 1).await;

        shutdown.cancel();
        run.await.unwrap();

        assert!(stats.reconnects() >= 1);
        assert_eq!(stats.acked(), 1);
        assert!(broker.connections_opened() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_consumer_wakes_on_publish() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Recorder::default());
        let (channels, consumer) = consumer(&broker, handler.clone());
        let publisher_channel = broker.connector().connect().await.unwrap();
        channels.channel().await.unwrap();

        let stats = consumer.stats();
        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { consumer.run(shutdown).await }
        });
        sleep(Duration::from_millis(1500)).await;

        publisher_channel
            .publish("scan", b"late", PublishOptions::default())
            .await
            .unwrap();
        wait_for(&stats, 1).await;
        shutdown.cancel();
        run.await.unwrap();

        assert_eq!(stats.acked(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_without_work_closes_channel() {
        let broker = MemoryBroker::new();
        let handler = Arc::new(Recorder::default());
        let (_channels, consumer) = consumer(&broker, handler);

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        consumer.run(shutdown).await;

        assert_eq!(broker.open_channels(), 0);
    }
}
