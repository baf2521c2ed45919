//! Database repositories
//!
//! `file` holds the record store trait and its Postgres implementation, `memory`
//! an in-process store with the same semantics, and `scan_queue` the message
//! table operations used by the Postgres message channel.

pub mod file;
pub mod memory;
pub mod scan_queue;

pub use file::{FileRecordStore, PgFileRepository, StoreResult, UpdateOutcome};
pub use memory::InMemoryFileRepository;
pub use scan_queue::{QueueDeclaration, QueueMessage, ScanQueueRepository, QUEUE_NOTIFY_CHANNEL};
