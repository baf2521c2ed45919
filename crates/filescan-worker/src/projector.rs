use std::sync::Arc;

use filescan_core::models::{FileId, StatusUpdate, Verdict};
use filescan_core::StoreError;
use filescan_db::{FileRecordStore, UpdateOutcome};

/// Writes lifecycle transitions to the record store.
///
/// ```text
/// pending --publish failure--> failed
/// pending --scan complete-->   scanned (with result)
/// ```
///
/// Both transitions are forward-only. Writing against a record that is already
/// terminal is not an error: the record is left untouched and the outcome says so.
#[derive(Clone)]
pub struct StatusProjector {
    store: Arc<dyn FileRecordStore>,
}

impl StatusProjector {
    pub fn new(store: Arc<dyn FileRecordStore>) -> Self {
        Self { store }
    }

    pub async fn record_scan(
        &self,
        file_id: &FileId,
        verdict: Verdict,
    ) -> Result<UpdateOutcome, StoreError> {
        let outcome = self
            .store
            .update_status(file_id, StatusUpdate::scanned(verdict))
            .await?;
        log_outcome(file_id, &outcome, "scanned");
        Ok(outcome)
    }

    pub async fn record_publish_failure(
        &self,
        file_id: &FileId,
    ) -> Result<UpdateOutcome, StoreError> {
        let outcome = self
            .store
            .update_status(file_id, StatusUpdate::Failed)
            .await?;
        log_outcome(file_id, &outcome, "failed");
        Ok(outcome)
    }
}

fn log_outcome(file_id: &FileId, outcome: &UpdateOutcome, requested: &str) {
    match outcome {
        UpdateOutcome::Applied(record) => tracing::info!(
            file.id = %file_id,
            status = %record.status,
            result = ?record.result,
            "File status updated"
        ),
        UpdateOutcome::AlreadyTerminal(record) => tracing::info!(
            file.id = %file_id,
            status = %record.status,
            requested,
            "File already terminal, status left unchanged"
        ),
    }
}
