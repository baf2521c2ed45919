//! Filescan Worker Library
//!
//! The queue side of the scan pipeline:
//! - [`channel`]: message channel abstraction with Postgres and in-memory brokers
//! - [`manager`]: lazily connected, shared channel with idempotent queue setup
//! - [`publisher`]: enqueue scan requests with bounded retry
//! - [`dispatcher`]: per-message fetch, classify and record
//! - [`consumer`]: the receive loop that feeds the dispatcher
//! - [`projector`]: forward-only status writes to the record store
//! - [`submission`]: create a record and queue its scan in one step
//! - [`worker`]: wiring for the `filescan-worker` binary

pub mod channel;
pub mod consumer;
pub mod dispatcher;
pub mod manager;
pub mod projector;
pub mod publisher;
pub mod submission;
pub mod worker;

pub use channel::{
    Connector, Delivery, DeliveryHandler, MemoryBroker, MessageChannel, PgConnector,
    PgConnectorConfig, PublishOptions, QueueOptions, Resolution,
};
pub use consumer::{Consumer, ConsumerConfig, ConsumerStats};
pub use dispatcher::{DispatcherConfig, ScanDispatcher};
pub use manager::{ChannelManager, QueueTopology};
pub use projector::StatusProjector;
pub use publisher::{PublisherConfig, ScanPublisher};
pub use submission::{FileSubmission, RepublishError, RepublishReport};
pub use worker::{retry_until_ready, ScanWorker};
