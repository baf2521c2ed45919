//! Filescan Core Library
//!
//! This crate provides the domain models, error taxonomy and process configuration
//! shared by every filescan component: the record store, the message channel, the
//! publisher and the scan worker.

pub mod config;
pub mod error;
pub mod models;

// Re-export commonly used types
pub use config::{LogFormat, ScanConfig, SCAN_PREFETCH, SCAN_QUEUE_NAME};
pub use error::{
    ChannelError, ClassifyError, FetchError, MessageError, QueueError, ScanError, StoreError,
};
pub use models::{FileId, FileRecord, FileStatus, ScanMessage, StatusUpdate, Verdict};
