//! In-process record store
//!
//! Same contract as [`PgFileRepository`](super::PgFileRepository), backed by a
//! mutex-guarded map. Used by tests and by local runs without a database. Update
//! failures can be injected to exercise the worker's store-error path.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use filescan_core::models::{FileId, FileRecord, FileStatus, StatusUpdate};
use filescan_core::StoreError;

use super::file::{FileRecordStore, StoreResult, UpdateOutcome};

#[derive(Default)]
struct Entries {
    records: HashMap<FileId, (u64, FileRecord)>,
    next_revision: u64,
}

impl Entries {
    fn bump(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }
}

#[derive(Clone, Default)]
pub struct InMemoryFileRepository {
    entries: Arc<Mutex<Entries>>,
    failing_updates: Arc<AtomicU32>,
}

impl InMemoryFileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record as-is, e.g. to seed a known id.
    pub fn insert(&self, record: FileRecord) {
        let mut entries = self.lock();
        let revision = entries.bump();
        entries.records.insert(record.id.clone(), (revision, record));
    }

    /// Make the next `count` calls to `update_status` fail with
    /// [`StoreError::Unavailable`] without touching any record.
    pub fn fail_next_updates(&self, count: u32) {
        self.failing_updates.store(count, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Vec<FileRecord> {
        self.lock()
            .records
            .values()
            .map(|(_, record)| record.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        // A poisoned lock only means a test panicked mid-write; the map is still usable.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_updates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl FileRecordStore for InMemoryFileRepository {
    async fn create_record(&self, name: &str, locator: &str) -> StoreResult<FileRecord> {
        let record = FileRecord::new_pending(FileId::generate(), name, locator);
        self.insert(record.clone());
        Ok(record)
    }

    async fn update_status(
        &self,
        id: &FileId,
        update: StatusUpdate,
    ) -> StoreResult<UpdateOutcome> {
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable(
                "injected record store failure".to_string(),
            ));
        }

        let mut entries = self.lock();
        let revision = entries.bump();
        let (stored_revision, record) = entries
            .records
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.clone()))?;

        if record.apply(&update, Utc::now()) {
            *stored_revision = revision;
            Ok(UpdateOutcome::Applied(record.clone()))
        } else {
            Ok(UpdateOutcome::AlreadyTerminal(record.clone()))
        }
    }

    async fn get(&self, id: &FileId) -> StoreResult<FileRecord> {
        self.lock()
            .records
            .get(id)
            .map(|(_, record)| record.clone())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list_all(&self) -> StoreResult<Vec<FileRecord>> {
        let entries = self.lock();
        let mut records: Vec<&(u64, FileRecord)> = entries.records.values().collect();
        records.sort_by(|(rev_a, a), (rev_b, b)| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| rev_b.cmp(rev_a))
        });
        Ok(records.into_iter().map(|(_, record)| record.clone()).collect())
    }

    async fn list_stale_pending(&self, older_than: Duration) -> StoreResult<Vec<FileRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|e| StoreError::Corrupt(format!("invalid age threshold: {}", e)))?;
        let mut records: Vec<FileRecord> = self
            .lock()
            .records
            .values()
            .filter(|(_, r)| r.status == FileStatus::Pending && r.created_at < cutoff)
            .map(|(_, r)| r.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filescan_core::models::Verdict;

    #[tokio::test]
    async fn created_records_start_pending() {
        let repo = InMemoryFileRepository::new();
        let record = repo.create_record("doc.pdf", "http://x/doc.pdf").await.unwrap();

        let stored = repo.get(&record.id).await.unwrap();
        assert_eq!(stored.status, FileStatus::Pending);
        assert_eq!(stored.result, None);
        assert_eq!(stored.scanned_at, None);
        assert_eq!(stored.name, "doc.pdf");
    }

    #[tokio::test]
    async fn scanned_write_is_applied_once() {
        let repo = InMemoryFileRepository::new();
        let record = repo.create_record("doc.pdf", "http://x/doc.pdf").await.unwrap();

        let first = repo
            .update_status(&record.id, StatusUpdate::scanned(Verdict::Infected))
            .await
            .unwrap();
        assert!(first.was_applied());
        let scanned_at = first.record().scanned_at;

        let second = repo
            .update_status(&record.id, StatusUpdate::scanned(Verdict::Clean))
            .await
            .unwrap();
        assert!(!second.was_applied());
        assert_eq!(second.record().result, Some(Verdict::Infected));
        assert_eq!(second.record().scanned_at, scanned_at);
    }

    #[tokio::test]
    async fn failed_records_stay_failed() {
        let repo = InMemoryFileRepository::new();
        let record = repo.create_record("a.png", "http://x/a.png").await.unwrap();

        repo.update_status(&record.id, StatusUpdate::Failed).await.unwrap();
        let outcome = repo
            .update_status(&record.id, StatusUpdate::scanned(Verdict::Clean))
            .await
            .unwrap();

        assert!(!outcome.was_applied());
        let stored = repo.get(&record.id).await.unwrap();
        assert_eq!(stored.status, FileStatus::Failed);
        assert_eq!(stored.result, None);
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let repo = InMemoryFileRepository::new();
        let missing = FileId::new("missing");

        assert!(matches!(repo.get(&missing).await, Err(StoreError::NotFound(_))));
        assert!(matches!(
            repo.update_status(&missing, StatusUpdate::Failed).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn injected_failures_leave_record_pending() {
        let repo = InMemoryFileRepository::new();
        let record = repo.create_record("doc.pdf", "http://x/doc.pdf").await.unwrap();
        repo.fail_next_updates(1);

        let err = repo
            .update_status(&record.id, StatusUpdate::scanned(Verdict::Clean))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(repo.get(&record.id).await.unwrap().status, FileStatus::Pending);

        // Only one failure was armed.
        assert!(repo
            .update_status(&record.id, StatusUpdate::scanned(Verdict::Clean))
            .await
            .unwrap()
            .was_applied());
    }

    #[tokio::test]
    async fn list_all_orders_by_last_update() {
        let repo = InMemoryFileRepository::new();
        let first = repo.create_record("first.pdf", "http://x/1").await.unwrap();
        let second = repo.create_record("second.pdf", "http://x/2").await.unwrap();

        let listed = repo.list_all().await.unwrap();
        assert_eq!(listed[0].id, second.id);

        repo.update_status(&first.id, StatusUpdate::scanned(Verdict::Clean))
            .await
            .unwrap();
        let listed = repo.list_all().await.unwrap();
        assert_eq!(listed[0].id, first.id);
        assert_eq!(listed[1].id, second.id);
    }

    #[tokio::test]
    async fn stale_pending_filters_by_age_and_status() {
        let repo = InMemoryFileRepository::new();
        let mut old = FileRecord::new_pending(FileId::new("old"), "old.pdf", "http://x/old");
        old.created_at = Utc::now() - chrono::Duration::hours(2);
        repo.insert(old);
        let mut old_scanned =
            FileRecord::new_pending(FileId::new("old-scanned"), "s.pdf", "http://x/s");
        old_scanned.created_at = Utc::now() - chrono::Duration::hours(2);
        repo.insert(old_scanned);
        repo.update_status(&FileId::new("old-scanned"), StatusUpdate::scanned(Verdict::Clean))
            .await
            .unwrap();
        repo.create_record("fresh.pdf", "http://x/fresh").await.unwrap();

        let stale = repo
            .list_stale_pending(Duration::from_secs(3600))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, FileId::new("old"));
    }

    #[tokio::test]
    async fn every_stored_record_keeps_result_invariant() {
        let repo = InMemoryFileRepository::new();
        let pending = repo.create_record("p.pdf", "http://x/p").await.unwrap();
        let scanned = repo.create_record("s.pdf", "http://x/s").await.unwrap();
        let failed = repo.create_record("f.pdf", "http://x/f").await.unwrap();
        repo.update_status(&scanned.id, StatusUpdate::scanned(Verdict::Infected))
            .await
            .unwrap();
        repo.update_status(&failed.id, StatusUpdate::Failed).await.unwrap();

        for record in repo.snapshot() {
            assert!(record.is_consistent(), "inconsistent record {:?}", record);
            if record.result.is_some() {
                assert_eq!(record.status, FileStatus::Scanned);
            }
        }
        assert_eq!(repo.get(&pending.id).await.unwrap().result, None);
    }
}
