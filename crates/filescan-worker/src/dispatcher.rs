//! Per-message scan handling
//!
//! For each delivery: decode the [`ScanMessage`], fetch the content (bounded by the
//! fetch timeout), classify it (bounded by the classify timeout), wait the settle delay, record the verdict, then
//! acknowledge. Every failure rejects the message without requeue, so nothing loops
//! forever; a record whose scan failed after dequeue stays `pending`.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};

use filescan_core::models::{FileId, ScanMessage, Verdict};
use filescan_core::{ClassifyError, FetchError, ScanConfig, ScanError, StoreError};
use filescan_db::{FileRecordStore, UpdateOutcome};
use filescan_services::{Classifier, ContentFetcher};

use crate::channel::{Delivery, DeliveryHandler, Resolution};
use crate::projector::StatusProjector;

#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub fetch_timeout: Duration,
    pub classify_timeout: Duration,
    pub settle_delay: Duration,
    /// Content that cannot be fetched counts as clean. When off, the delivery is
    /// rejected and the record stays `pending`.
    pub fail_open_on_fetch_error: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_millis(10_000),
            classify_timeout: Duration::from_millis(10_000),
            settle_delay: Duration::ZERO,
            fail_open_on_fetch_error: true,
        }
    }
}

impl From<&ScanConfig> for DispatcherConfig {
    fn from(config: &ScanConfig) -> Self {
        Self {
            fetch_timeout: config.fetch_timeout(),
            classify_timeout: config.classify_timeout(),
            settle_delay: config.settle_delay(),
            fail_open_on_fetch_error: config.fail_open_on_fetch_error,
        }
    }
}

pub struct ScanDispatcher {
    store: Arc<dyn FileRecordStore>,
    fetcher: Arc<dyn ContentFetcher>,
    classifier: Arc<dyn Classifier>,
    projector: StatusProjector,
    config: DispatcherConfig,
}

impl ScanDispatcher {
    pub fn new(
        store: Arc<dyn FileRecordStore>,
        fetcher: Arc<dyn ContentFetcher>,
        classifier: Arc<dyn Classifier>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            projector: StatusProjector::new(store.clone()),
            store,
            fetcher,
            classifier,
            config,
        }
    }

    /// Runs one scan. `Ok` means the record is terminal and the message can go.
    pub async fn process(&self, body: &[u8]) -> Result<UpdateOutcome, ScanError> {
        let message = ScanMessage::from_slice(body)?;
        let file_id = &message.file_id;

        // A redelivery for a finished record: nothing to do, and rescanning could
        // only produce a write the store would ignore.
        match self.store.get(file_id).await {
            Ok(record) if record.is_terminal() => {
                tracing::info!(
                    file.id = %file_id,
                    status = %record.status,
                    "File already terminal, skipping scan"
                );
                return Ok(UpdateOutcome::AlreadyTerminal(record));
            }
            Ok(_) => {}
            Err(StoreError::NotFound(id)) => return Err(StoreError::NotFound(id).into()),
            Err(e) => {
                tracing::warn!(file.id = %file_id, error = %e, "Record lookup failed, scanning anyway");
            }
        }

        let verdict = match self.fetch(file_id, &message.locator).await {
            Ok(content) => tokio::time::timeout(
                self.config.classify_timeout,
                self.classifier.classify(&content),
            )
            .await
            .map_err(|_| ClassifyError::Timeout)??,
            Err(e) if self.config.fail_open_on_fetch_error => {
                tracing::warn!(
                    file.id = %file_id,
                    locator = %message.locator,
                    error = %e,
                    "Content unavailable, treating file as clean (fail-open)"
                );
                Verdict::Clean
            }
            Err(e) => return Err(e.into()),
        };

        if !self.config.settle_delay.is_zero() {
            tokio::time::sleep(self.config.settle_delay).await;
        }

        Ok(self.projector.record_scan(file_id, verdict).await?)
    }

    async fn fetch(&self, file_id: &FileId, locator: &str) -> Result<bytes::Bytes, FetchError> {
        let timeout = self.config.fetch_timeout;
        let start = Instant::now();
        // The outer bound holds even for fetchers that ignore their timeout argument.
        let content = tokio::time::timeout(timeout, self.fetcher.fetch(locator, timeout))
            .await
            .map_err(|_| FetchError::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })??;
        tracing::debug!(
            file.id = %file_id,
            content_len = content.len(),
            duration_ms = start.elapsed().as_millis(),
            "Content fetched"
        );
        Ok(content)
    }
}

#[async_trait]
impl DeliveryHandler for ScanDispatcher {
    #[tracing::instrument(skip(self, delivery), fields(tag = delivery.tag, redelivered = delivery.redelivered))]
    async fn handle(&self, delivery: &Delivery) -> Resolution {
        if delivery.redelivered {
            tracing::info!("Handling redelivered scan message");
        }

        match self.process(&delivery.body).await {
            Ok(outcome) => {
                let record = outcome.record();
                tracing::info!(
                    file.id = %record.id,
                    status = %record.status,
                    result = ?record.result,
                    applied = outcome.was_applied(),
                    "Scan message processed"
                );
                Resolution::Ack
            }
            Err(e) if e.is_poison() => {
                tracing::warn!(
                    error = %e,
                    body_len = delivery.body.len(),
                    "Discarding malformed scan message"
                );
                Resolution::discard()
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    "Scan failed, rejecting message; record stays pending"
                );
                Resolution::discard()
            }
        }
    }
}
