//! Filescan DB Library
//!
//! Persistence for the scan pipeline: the record store (file metadata and scan
//! status) and the Postgres tables backing the durable scan queue.

pub mod db;
pub mod setup;

pub use db::{
    FileRecordStore, InMemoryFileRepository, PgFileRepository, QueueDeclaration, QueueMessage,
    ScanQueueRepository, StoreResult, UpdateOutcome, QUEUE_NOTIFY_CHANNEL,
};
pub use setup::{run_migrations, setup_database};
