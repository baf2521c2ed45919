//! Scan request publisher
//!
//! Turns a new file into a persistent [`ScanMessage`] on the scan queue. Transient
//! failures (no channel, broker refused the message, connection dropped) are
//! retried a fixed number of times with a fixed delay between attempts. The
//! publisher never writes the record store; the caller marks the record `failed`
//! when [`ScanPublisher::enqueue`] returns an error.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use filescan_core::models::{FileId, ScanMessage};
use filescan_core::{ChannelError, QueueError, ScanConfig};

use crate::channel::PublishOptions;
use crate::manager::ChannelManager;

#[derive(Clone, Debug)]
pub struct PublisherConfig {
    /// Total publish attempts, including the first.
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_millis(2000),
        }
    }
}

impl From<&ScanConfig> for PublisherConfig {
    fn from(config: &ScanConfig) -> Self {
        Self {
            max_attempts: config.publish_max_attempts.max(1),
            retry_delay: config.publish_retry_delay(),
        }
    }
}

#[derive(Clone)]
pub struct ScanPublisher {
    channels: Arc<ChannelManager>,
    config: PublisherConfig,
}

impl ScanPublisher {
    pub fn new(channels: Arc<ChannelManager>, config: PublisherConfig) -> Self {
        Self { channels, config }
    }

    /// Publish a scan request for `file_id`.
    ///
    /// Blocks for up to `(max_attempts - 1) * retry_delay` plus the publish calls
    /// themselves. Do not hold locks across it.
    #[tracing::instrument(skip(self), fields(file.id = %file_id))]
    pub async fn enqueue(&self, file_id: &FileId, locator: &str) -> Result<(), QueueError> {
        let body = ScanMessage::new(file_id.clone(), locator).to_vec()?;
        let max_attempts = self.config.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            match self.publish_once(&body).await {
                Ok(()) => {
                    tracing::info!(
                        attempt,
                        queue = %self.channels.queue_name(),
                        "Scan request queued"
                    );
                    return Ok(());
                }
                Err(e) => {
                    if e.is_connection_error() {
                        self.channels.invalidate().await;
                    }

                    if attempt >= max_attempts {
                        tracing::error!(
                            error = %e,
                            attempts = attempt,
                            "Giving up on scan request"
                        );
                        return Err(QueueError::Exhausted {
                            file_id: file_id.clone(),
                            attempts: attempt,
                            source: e,
                        });
                    }

                    tracing::warn!(
                        error = %e,
                        attempt,
                        max_attempts,
                        retry_in_ms = self.config.retry_delay.as_millis() as u64,
                        "Scan request publish failed, retrying"
                    );
                    sleep(self.config.retry_delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn publish_once(&self, body: &[u8]) -> Result<(), ChannelError> {
        let channel = self.channels.channel().await?;
        let accepted = channel
            .publish(self.channels.queue_name(), body, PublishOptions::default())
            .await?;
        if accepted {
            Ok(())
        } else {
            Err(ChannelError::NotSent)
        }
    }
}
