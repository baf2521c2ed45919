use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::str::FromStr;
use uuid::Uuid;

/// Opaque identifier of a submitted file.
///
/// Generated by the record store at creation time. Identifiers arriving on the
/// wire are not validated here; the worker checks them against the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(String);

impl FileId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier (UUID v4, hyphenated).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FileId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(&self.0)
    }
}

impl From<&str> for FileId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for FileId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Lifecycle state of a file record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Scanned,
    Failed,
}

impl FileStatus {
    /// `scanned` and `failed` are terminal; nothing moves a record out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Scanned | FileStatus::Failed)
    }

    pub fn can_transition_to(&self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Pending, FileStatus::Scanned) | (FileStatus::Pending, FileStatus::Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Scanned => "scanned",
            FileStatus::Failed => "failed",
        }
    }
}

impl Display for FileStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for FileStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(FileStatus::Pending),
            "scanned" => Ok(FileStatus::Scanned),
            "failed" => Ok(FileStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid file status: {}", s)),
        }
    }
}

/// Outcome of classifying a file's content.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Clean,
    Infected,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Clean => "clean",
            Verdict::Infected => "infected",
        }
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl FromStr for Verdict {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "clean" => Ok(Verdict::Clean),
            "infected" => Ok(Verdict::Infected),
            _ => Err(anyhow::anyhow!("Invalid scan result: {}", s)),
        }
    }
}

/// Metadata and scan state of one submitted file.
///
/// `result` is `None` until the record is `scanned`; it is serialized as `null`
/// in that case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: FileId,
    pub name: String,
    pub locator: String,
    pub status: FileStatus,
    pub result: Option<Verdict>,
    pub scanned_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// A freshly created record: `pending`, no result, never scanned.
    pub fn new_pending(id: FileId, name: impl Into<String>, locator: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: name.into(),
            locator: locator.into(),
            status: FileStatus::Pending,
            result: None,
            scanned_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// `result` and `scanned_at` are present exactly when the status is `scanned`.
    pub fn is_consistent(&self) -> bool {
        let scanned = self.status == FileStatus::Scanned;
        scanned == self.result.is_some() && scanned == self.scanned_at.is_some()
    }

    /// Applies `update` if the state machine allows it. Returns `false` and leaves
    /// the record untouched otherwise.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(update.target_status()) {
            return false;
        }
        match update {
            StatusUpdate::Scanned { result, scanned_at } => {
                self.status = FileStatus::Scanned;
                self.result = Some(*result);
                self.scanned_at = Some(*scanned_at);
            }
            StatusUpdate::Failed => {
                self.status = FileStatus::Failed;
            }
        }
        self.updated_at = now;
        true
    }
}

/// A forward transition out of `pending`.
///
/// A result can only be recorded together with the `scanned` status, which keeps
/// the result/status invariant out of the callers' hands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusUpdate {
    Scanned {
        result: Verdict,
        scanned_at: DateTime<Utc>,
    },
    Failed,
}

impl StatusUpdate {
    pub fn scanned(result: Verdict) -> Self {
        StatusUpdate::Scanned {
            result,
            scanned_at: Utc::now(),
        }
    }

    pub fn target_status(&self) -> FileStatus {
        match self {
            StatusUpdate::Scanned { .. } => FileStatus::Scanned,
            StatusUpdate::Failed => FileStatus::Failed,
        }
    }

    pub fn result(&self) -> Option<Verdict> {
        match self {
            StatusUpdate::Scanned { result, .. } => Some(*result),
            StatusUpdate::Failed => None,
        }
    }

    pub fn scanned_at(&self) -> Option<DateTime<Utc>> {
        match self {
            StatusUpdate::Scanned { scanned_at, .. } => Some(*scanned_at),
            StatusUpdate::Failed => None,
        }
    }
}
