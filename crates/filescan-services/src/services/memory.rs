//! In-process content source
//!
//! Serves canned content per locator, for tests and local runs without an HTTP
//! server. Locators can also be set to hang (until the caller's timeout) or to
//! fail with a network error.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use filescan_core::FetchError;

use super::fetch::ContentFetcher;

#[derive(Clone, Debug)]
enum Source {
    Content(Bytes),
    Hang,
    Unreachable,
}

#[derive(Default)]
struct State {
    sources: HashMap<String, Source>,
    fetches: HashMap<String, usize>,
}

#[derive(Clone, Default)]
pub struct InMemoryContentFetcher {
    state: Arc<Mutex<State>>,
}

impl InMemoryContentFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, locator: impl Into<String>, content: impl Into<Bytes>) {
        self.lock()
            .sources
            .insert(locator.into(), Source::Content(content.into()));
    }

    /// Never answer `locator`; the fetch ends with the caller's timeout.
    pub fn hang(&self, locator: impl Into<String>) {
        self.lock().sources.insert(locator.into(), Source::Hang);
    }

    pub fn unreachable(&self, locator: impl Into<String>) {
        self.lock()
            .sources
            .insert(locator.into(), Source::Unreachable);
    }

    /// Fetch attempts made for `locator`, successful or not.
    pub fn fetch_count(&self, locator: &str) -> usize {
        self.lock().fetches.get(locator).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ContentFetcher for InMemoryContentFetcher {
    async fn fetch(&self, locator: &str, timeout: Duration) -> Result<Bytes, FetchError> {
        let source = {
            let mut state = self.lock();
            *state.fetches.entry(locator.to_string()).or_insert(0) += 1;
            state.sources.get(locator).cloned()
        };

        match source {
            Some(Source::Content(content)) => Ok(content),
            Some(Source::Hang) => {
                tokio::time::sleep(timeout).await;
                Err(FetchError::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })
            }
            Some(Source::Unreachable) => Err(FetchError::Network(format!(
                "connection refused: {}",
                locator
            ))),
            None => Err(FetchError::Status(404)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn serves_registered_content() {
        let fetcher = InMemoryContentFetcher::new();
        fetcher.serve("http://x/doc.pdf", "hello");

        let body = fetcher
            .fetch("http://x/doc.pdf", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(&body[..], b"hello");
        assert_eq!(fetcher.fetch_count("http://x/doc.pdf"), 1);
    }

    #[tokio::test]
    async fn unknown_locator_is_not_found() {
        let fetcher = InMemoryContentFetcher::new();
        let err = fetcher
            .fetch("http://x/missing", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(404)));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_locator_waits_for_the_timeout() {
        let fetcher = InMemoryContentFetcher::new();
        fetcher.hang("http://x/slow");
        let start = tokio::time::Instant::now();

        let err = fetcher
            .fetch("http://x/slow", Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Timeout { timeout_ms: 10_000 }));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }
}
