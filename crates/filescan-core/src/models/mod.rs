mod file;
mod message;

pub use file::{FileId, FileRecord, FileStatus, StatusUpdate, Verdict};
pub use message::ScanMessage;
