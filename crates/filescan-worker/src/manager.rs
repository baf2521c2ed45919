//! Process-wide broker channel
//!
//! [`ChannelManager`] owns the single channel a process uses. It is opened on first
//! use, reused by every caller afterwards and replaced only after it has been
//! invalidated or found closed. Opening a channel always runs the queue setup
//! (dead-letter queue, scan queue, prefetch), which is idempotent, so a reconnect
//! restores the same topology.

use std::sync::Arc;
use tokio::sync::Mutex;

use filescan_core::{ChannelError, ScanConfig, SCAN_PREFETCH};

use crate::channel::{Connector, MessageChannel, QueueOptions};

/// Queues and flow control a channel is set up with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueTopology {
    pub queue: String,
    pub dead_letter: Option<String>,
    pub prefetch: u16,
}

impl QueueTopology {
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            dead_letter: None,
            prefetch: SCAN_PREFETCH,
        }
    }

    pub fn with_dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter = Some(queue.into());
        self
    }
}

impl From<&ScanConfig> for QueueTopology {
    fn from(config: &ScanConfig) -> Self {
        Self {
            queue: config.queue_name.clone(),
            dead_letter: config.dead_letter_queue.clone(),
            prefetch: SCAN_PREFETCH,
        }
    }
}

pub struct ChannelManager {
    connector: Arc<dyn Connector>,
    topology: QueueTopology,
    current: Mutex<Option<Arc<dyn MessageChannel>>>,
}

impl ChannelManager {
    pub fn new(connector: Arc<dyn Connector>, topology: QueueTopology) -> Self {
        Self {
            connector,
            topology,
            current: Mutex::new(None),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.topology.queue
    }

    /// The live channel, opening and setting up a new one if needed.
    ///
    /// Concurrent callers wait for a single connection attempt instead of racing
    /// to open their own.
    pub async fn channel(&self) -> Result<Arc<dyn MessageChannel>, ChannelError> {
        let mut current = self.current.lock().await;
        if let Some(channel) = current.as_ref() {
            if channel.is_open() {
                return Ok(channel.clone());
            }
            tracing::info!(broker = %self.connector.describe(), "Broker channel closed, reconnecting");
        }

        let channel = self.connector.connect().await?;
        if let Err(e) = self.setup(channel.as_ref()).await {
            tracing::warn!(error = %e, "Queue setup failed, dropping channel");
            channel.close().await.ok();
            return Err(e);
        }

        tracing::info!(
            broker = %self.connector.describe(),
            queue = %self.topology.queue,
            dead_letter_queue = ?self.topology.dead_letter,
            prefetch = self.topology.prefetch,
            "Broker channel ready"
        );
        *current = Some(channel.clone());
        Ok(channel)
    }

    async fn setup(&self, channel: &dyn MessageChannel) -> Result<(), ChannelError> {
        let mut options = QueueOptions::durable();
        if let Some(dead_letter) = &self.topology.dead_letter {
            channel
                .declare_queue(dead_letter, &QueueOptions::durable())
                .await?;
            options = options.with_dead_letter(dead_letter.clone());
        }
        channel.declare_queue(&self.topology.queue, &options).await?;
        channel.set_prefetch(self.topology.prefetch).await
    }

    /// Drop the current channel after a connection error. The next
    /// [`channel`](Self::channel) call reconnects.
    pub async fn invalidate(&self) {
        let previous = self.current.lock().await.take();
        if let Some(channel) = previous {
            if let Err(e) = channel.close().await {
                tracing::debug!(error = %e, "Closing invalidated channel failed");
            }
        }
    }

    /// Close the channel for good. Unacknowledged deliveries return to the queue.
    pub async fn shutdown(&self) {
        let previous = self.current.lock().await.take();
        match previous {
            Some(channel) => match channel.close().await {
                Ok(()) => tracing::info!("Broker channel shut down"),
                Err(e) => tracing::warn!(error = %e, "Broker channel shutdown failed"),
            },
            None => tracing::debug!("No broker channel to shut down"),
        }
    }
}
