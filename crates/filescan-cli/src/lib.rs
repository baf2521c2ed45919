//! Shared pieces of the `filescan` operator CLI.

use chrono::{DateTime, Utc};
use serde::Serialize;

use filescan_core::models::{FileRecord, FileStatus};
use filescan_worker::RepublishReport;

/// Initialize tracing for CLI binaries. Logs go to stderr so stdout stays JSON.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// One line of `filescan list`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub id: String,
    pub name: String,
    pub status: FileStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&FileRecord> for FileSummary {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id.to_string(),
            name: truncate_string(&record.name, 48),
            status: record.status,
            result: record.result.map(|v| v.to_string()),
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct RescanSummary {
    pub republished: Vec<String>,
    pub failed: Vec<RescanFailure>,
}

#[derive(Debug, Serialize)]
pub struct RescanFailure {
    pub id: String,
    pub error: String,
}

impl From<RepublishReport> for RescanSummary {
    fn from(report: RepublishReport) -> Self {
        Self {
            republished: report.republished.iter().map(ToString::to_string).collect(),
            failed: report
                .failed
                .into_iter()
                .map(|(id, error)| RescanFailure {
                    id: id.to_string(),
                    error,
                })
                .collect(),
        }
    }
}

/// Truncate a string to max_len characters, appending "..." if truncated.
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filescan_core::models::{FileId, Verdict};

    #[test]
    fn truncate_string_short() {
        assert_eq!(truncate_string("hello", 10), "hello");
        assert_eq!(truncate_string("", 5), "");
    }

    #[test]
    fn truncate_string_long() {
        assert_eq!(truncate_string("hello world", 8), "hello...");
        assert_eq!(truncate_string("abc", 2), "...");
    }

    #[test]
    fn truncate_string_counts_characters() {
        assert_eq!(truncate_string("résumé.pdf", 10), "résumé.pdf");
        assert_eq!(truncate_string("résumé-final.pdf", 9), "résumé...");
    }

    #[test]
    fn summary_omits_missing_result() {
        let record = FileRecord::new_pending(FileId::new("f1"), "doc.pdf", "http://x/doc.pdf");
        let json = serde_json::to_value(FileSummary::from(&record)).unwrap();
        assert_eq!(json["id"], "f1");
        assert_eq!(json["status"], "pending");
        assert!(json.get("result").is_none());
    }

    #[test]
    fn summary_shows_verdict() {
        let mut record = FileRecord::new_pending(FileId::new("f1"), "doc.pdf", "http://x/doc.pdf");
        record.status = FileStatus::Scanned;
        record.result = Some(Verdict::Infected);
        record.scanned_at = Some(Utc::now());
        let json = serde_json::to_value(FileSummary::from(&record)).unwrap();
        assert_eq!(json["result"], "infected");
    }

    #[test]
    fn rescan_summary_flattens_failures() {
        let report = RepublishReport {
            republished: vec![FileId::new("a")],
            failed: vec![(FileId::new("b"), "broker down".to_string())],
        };
        let summary = RescanSummary::from(report);
        assert_eq!(summary.republished, vec!["a".to_string()]);
        assert_eq!(summary.failed[0].id, "b");
        assert_eq!(summary.failed[0].error, "broker down");
    }
}
