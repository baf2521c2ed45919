//! Message channel abstraction
//!
//! A channel is one live connection to the broker. It can declare durable queues,
//! publish persistent messages and hand out deliveries that stay reserved for it
//! until they are acknowledged or rejected. Deliveries still held when the channel
//! goes away return to their queue and are redelivered with `redelivered` set.
//!
//! Two backends implement the traits: [`postgres`] (production, messages stored in
//! Postgres) and [`memory`] (an in-process broker with restart and fault
//! simulation, used by tests).

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Notify;

use filescan_core::ChannelError;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryBroker, MemoryConnector, PublishFault};
pub use postgres::{PgChannel, PgConnector, PgConnectorConfig};

/// Per-channel identifier of a delivery.
pub type DeliveryTag = u64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Survives broker restarts.
    pub durable: bool,
    /// Where messages rejected without requeue go. `None` drops them.
    pub dead_letter: Option<String>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            dead_letter: None,
        }
    }

    pub fn with_dead_letter(mut self, queue: impl Into<String>) -> Self {
        self.dead_letter = Some(queue.into());
        self
    }

    /// Fails when `queue` already exists with options other than `self`.
    pub fn ensure_matches(&self, queue: &str, existing: &QueueOptions) -> Result<(), ChannelError> {
        let detail = if self.durable != existing.durable {
            format!("durable is {}, requested {}", existing.durable, self.durable)
        } else if self.dead_letter != existing.dead_letter {
            format!(
                "dead-letter queue is {:?}, requested {:?}",
                existing.dead_letter, self.dead_letter
            )
        } else {
            return Ok(());
        };
        Err(ChannelError::QueueMismatch {
            queue: queue.to_string(),
            detail,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Stored durably; survives broker restarts when the queue is durable.
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self { persistent: true }
    }
}

/// A message reserved for the receiving channel.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub body: Vec<u8>,
    /// The message was delivered before and not acknowledged.
    pub redelivered: bool,
}

/// How a consumer settles a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Processed; remove the message for good.
    Ack,
    /// Not processed. With `requeue` the message goes back to the queue, otherwise
    /// to the dead-letter queue (or nowhere).
    Reject { requeue: bool },
}

impl Resolution {
    pub fn discard() -> Self {
        Resolution::Reject { requeue: false }
    }
}

#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Idempotent. Re-declaring an existing queue with the same options leaves it
    /// and its messages alone; different options fail with
    /// [`ChannelError::QueueMismatch`].
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<(), ChannelError>;

    /// Maximum unacknowledged deliveries this channel may hold. `0` is unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<(), ChannelError>;

    /// `Ok(false)` means the broker refused the message; nothing was stored.
    async fn publish(
        &self,
        queue: &str,
        body: &[u8],
        options: PublishOptions,
    ) -> Result<bool, ChannelError>;

    /// Reserve the next message of `queue`. `None` if the queue is empty or the
    /// prefetch limit is reached.
    async fn next_delivery(&self, queue: &str) -> Result<Option<Delivery>, ChannelError>;

    async fn ack(&self, tag: DeliveryTag) -> Result<(), ChannelError>;

    async fn reject(&self, tag: DeliveryTag, requeue: bool) -> Result<(), ChannelError>;

    /// Signalled when new messages may be available.
    fn notifier(&self) -> Arc<Notify>;

    fn is_open(&self) -> bool;

    /// Return held deliveries to their queues and release the connection.
    async fn close(&self) -> Result<(), ChannelError>;
}

/// Opens channels to one broker address.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Fails with [`ChannelError::Connection`] when the broker is unreachable.
    async fn connect(&self) -> Result<Arc<dyn MessageChannel>, ChannelError>;

    /// Broker address without credentials, for logs.
    fn describe(&self) -> String;
}

/// Settles deliveries handed out by a consumer.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Resolution;
}
