use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};
use std::time::Duration;

use filescan_core::models::{FileId, FileRecord, FileStatus, StatusUpdate, Verdict};
use filescan_core::StoreError;

pub type StoreResult<T> = Result<T, StoreError>;

/// Result of a status write.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The record was `pending` and now holds the new state.
    Applied(FileRecord),
    /// The record was already terminal; it was left exactly as it was.
    AlreadyTerminal(FileRecord),
}

impl UpdateOutcome {
    pub fn record(&self) -> &FileRecord {
        match self {
            UpdateOutcome::Applied(record) | UpdateOutcome::AlreadyTerminal(record) => record,
        }
    }

    pub fn was_applied(&self) -> bool {
        matches!(self, UpdateOutcome::Applied(_))
    }
}

/// Ledger of submitted files and their scan state.
///
/// Implementations must make `update_status` atomic per record and forward-only:
/// a record leaves `pending` at most once, and writes against a terminal record
/// report [`UpdateOutcome::AlreadyTerminal`] instead of failing. This is what makes
/// redelivered scan messages safe.
#[async_trait]
pub trait FileRecordStore: Send + Sync {
    /// Create a `pending` record with a freshly generated id.
    async fn create_record(&self, name: &str, locator: &str) -> StoreResult<FileRecord>;

    async fn update_status(&self, id: &FileId, update: StatusUpdate)
        -> StoreResult<UpdateOutcome>;

    async fn get(&self, id: &FileId) -> StoreResult<FileRecord>;

    /// All records, most recently updated first.
    async fn list_all(&self) -> StoreResult<Vec<FileRecord>>;

    /// `pending` records created more than `older_than` ago, oldest first.
    async fn list_stale_pending(&self, older_than: Duration) -> StoreResult<Vec<FileRecord>>;
}

#[derive(Debug, sqlx::FromRow)]
struct FileRow {
    id: String,
    name: String,
    locator: String,
    status: String,
    result: Option<String>,
    scanned_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FileRow> for FileRecord {
    type Error = StoreError;

    fn try_from(row: FileRow) -> Result<Self, Self::Error> {
        let status: FileStatus = row
            .status
            .parse()
            .map_err(|e: anyhow::Error| StoreError::Corrupt(e.to_string()))?;
        let result: Option<Verdict> = row
            .result
            .as_deref()
            .map(str::parse::<Verdict>)
            .transpose()
            .map_err(|e: anyhow::Error| StoreError::Corrupt(e.to_string()))?;

        Ok(FileRecord {
            id: FileId::new(row.id),
            name: row.name,
            locator: row.locator,
            status,
            result,
            scanned_at: row.scanned_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Clone)]
pub struct PgFileRepository {
    pool: PgPool,
}

impl PgFileRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_optional(&self, id: &FileId) -> StoreResult<Option<FileRecord>> {
        let row: Option<FileRow> = sqlx::query_as::<Postgres, FileRow>(
            r#"
            SELECT id, name, locator, status, result, scanned_at, created_at, updated_at
            FROM files
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(FileRecord::try_from).transpose()
    }
}

#[async_trait]
impl FileRecordStore for PgFileRepository {
    #[tracing::instrument(skip(self))]
    async fn create_record(&self, name: &str, locator: &str) -> StoreResult<FileRecord> {
        let id = FileId::generate();
        let row: FileRow = sqlx::query_as::<Postgres, FileRow>(
            r#"
            INSERT INTO files (id, name, locator, status)
            VALUES ($1, $2, $3, 'pending')
            RETURNING id, name, locator, status, result, scanned_at, created_at, updated_at
            "#,
        )
        .bind(id.as_str())
        .bind(name)
        .bind(locator)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, file.name = %name, "Failed to insert file record");
            StoreError::from(e)
        })?;

        tracing::info!(file.id = %row.id, file.name = %name, "File record created");

        row.try_into()
    }

    /// Forward-only status write. The `status = 'pending'` guard makes the
    /// transition atomic; zero affected rows means the record is terminal or absent.
    #[tracing::instrument(skip(self), fields(file.id = %id))]
    async fn update_status(
        &self,
        id: &FileId,
        update: StatusUpdate,
    ) -> StoreResult<UpdateOutcome> {
        let target = update.target_status();
        let row: Option<FileRow> = sqlx::query_as::<Postgres, FileRow>(
            r#"
            UPDATE files
            SET status = $2,
                result = $3,
                scanned_at = $4,
                updated_at = NOW()
            WHERE id = $1
                AND status = 'pending'
            RETURNING id, name, locator, status, result, scanned_at, created_at, updated_at
            "#,
        )
        .bind(id.as_str())
        .bind(target.as_str())
        .bind(update.result().map(|r| r.as_str()))
        .bind(update.scanned_at())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = row {
            let record: FileRecord = row.try_into()?;
            tracing::debug!(status = %record.status, "File status updated");
            return Ok(UpdateOutcome::Applied(record));
        }

        match self.fetch_optional(id).await? {
            Some(existing) => {
                tracing::debug!(
                    current_status = %existing.status,
                    requested_status = %target,
                    "File record already terminal, leaving it unchanged"
                );
                Ok(UpdateOutcome::AlreadyTerminal(existing))
            }
            None => Err(StoreError::NotFound(id.clone())),
        }
    }

    #[tracing::instrument(skip(self), fields(file.id = %id))]
    async fn get(&self, id: &FileId) -> StoreResult<FileRecord> {
        self.fetch_optional(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    #[tracing::instrument(skip(self))]
    async fn list_all(&self) -> StoreResult<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as::<Postgres, FileRow>(
            r#"
            SELECT id, name, locator, status, result, scanned_at, created_at, updated_at
            FROM files
            ORDER BY updated_at DESC, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }

    #[tracing::instrument(skip(self))]
    async fn list_stale_pending(&self, older_than: Duration) -> StoreResult<Vec<FileRecord>> {
        let rows: Vec<FileRow> = sqlx::query_as::<Postgres, FileRow>(
            r#"
            SELECT id, name, locator, status, result, scanned_at, created_at, updated_at
            FROM files
            WHERE status = 'pending'
                AND created_at < NOW() - ($1 * interval '1 second')
            ORDER BY created_at ASC
            "#,
        )
        .bind(older_than.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(FileRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(status: &str, result: Option<&str>) -> FileRow {
        let now = Utc::now();
        FileRow {
            id: "f1".to_string(),
            name: "doc.pdf".to_string(),
            locator: "http://x/doc.pdf".to_string(),
            status: status.to_string(),
            result: result.map(str::to_string),
            scanned_at: result.map(|_| now),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn row_conversion_parses_status_and_result() {
        let record = FileRecord::try_from(row("scanned", Some("infected"))).unwrap();
        assert_eq!(record.status, FileStatus::Scanned);
        assert_eq!(record.result, Some(Verdict::Infected));
        assert!(record.is_consistent());

        let record = FileRecord::try_from(row("pending", None)).unwrap();
        assert_eq!(record.result, None);
    }

    #[test]
    fn row_conversion_rejects_unknown_values() {
        assert!(matches!(
            FileRecord::try_from(row("archived", None)),
            Err(StoreError::Corrupt(_))
        ));
        assert!(matches!(
            FileRecord::try_from(row("scanned", Some("suspicious"))),
            Err(StoreError::Corrupt(_))
        ));
    }
}
