//! Submission path
//!
//! Creates the record for a new file and queues its scan. The record store write
//! on the failure path happens here, not in the publisher: if the scan request
//! cannot be queued the record is moved to `failed` right away.

use std::sync::Arc;
use std::time::Duration;

use filescan_core::models::{FileId, FileRecord};
use filescan_core::{QueueError, StoreError};
use filescan_db::FileRecordStore;

use crate::projector::StatusProjector;
use crate::publisher::ScanPublisher;

/// Result of re-queueing stale `pending` records.
#[derive(Debug, Default)]
pub struct RepublishReport {
    pub republished: Vec<FileId>,
    pub failed: Vec<(FileId, String)>,
}

#[derive(Clone)]
pub struct FileSubmission {
    store: Arc<dyn FileRecordStore>,
    publisher: ScanPublisher,
    projector: StatusProjector,
}

impl FileSubmission {
    pub fn new(store: Arc<dyn FileRecordStore>, publisher: ScanPublisher) -> Self {
        Self {
            projector: StatusProjector::new(store.clone()),
            store,
            publisher,
        }
    }

    /// Record a new file and queue it for scanning.
    ///
    /// Returns the record as it stands afterwards: `pending` when the scan request
    /// was queued, `failed` when publishing gave up.
    #[tracing::instrument(skip(self))]
    pub async fn submit(&self, name: &str, locator: &str) -> Result<FileRecord, StoreError> {
        let record = self.store.create_record(name, locator).await?;

        match self.publisher.enqueue(&record.id, &record.locator).await {
            Ok(()) => Ok(record),
            Err(e) => {
                tracing::error!(
                    file.id = %record.id,
                    error = %e,
                    "Could not queue scan request, marking file failed"
                );
                let outcome = self.projector.record_publish_failure(&record.id).await?;
                Ok(outcome.record().clone())
            }
        }
    }

    /// Queue a scan request for `file_id` again, without touching its status.
    pub async fn republish(&self, file_id: &FileId) -> Result<(), RepublishError> {
        let record = self.store.get(file_id).await?;
        if record.is_terminal() {
            return Err(RepublishError::AlreadyTerminal(record));
        }
        self.publisher.enqueue(&record.id, &record.locator).await?;
        Ok(())
    }

    /// Queue every record that has been `pending` for longer than `older_than`.
    ///
    /// Publish failures are collected rather than projected: these records may
    /// still have a message in flight, so they stay `pending`.
    pub async fn republish_stale(&self, older_than: Duration) -> Result<RepublishReport, StoreError> {
        let stale = self.store.list_stale_pending(older_than).await?;
        tracing::info!(
            count = stale.len(),
            older_than_secs = older_than.as_secs(),
            "Re-queueing stale pending files"
        );

        let mut report = RepublishReport::default();
        for record in stale {
            match self.publisher.enqueue(&record.id, &record.locator).await {
                Ok(()) => report.republished.push(record.id),
                Err(e) => {
                    tracing::warn!(file.id = %record.id, error = %e, "Re-queue failed");
                    report.failed.push((record.id, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RepublishError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("File {} is already {}", .0.id, .0.status)]
    AlreadyTerminal(FileRecord),
}
