use async_trait::async_trait;
use std::time::Instant;

use filescan_core::models::Verdict;
use filescan_core::ClassifyError;

/// Substrings that mark content as infected.
pub const DEFAULT_SIGNATURES: &[&str] = &["rm -rf", "eval", "bitcoin"];

/// Decides whether file content is clean or infected.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, content: &[u8]) -> Result<Verdict, ClassifyError>;
}

/// Keyword matcher over the content decoded as (lossy) UTF-8.
///
/// Matching is case-insensitive: signatures are lowercased once at construction
/// and compared against the lowercased text.
#[derive(Clone, Debug)]
pub struct KeywordClassifier {
    signatures: Vec<String>,
}

impl KeywordClassifier {
    pub fn new<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            signatures: signatures
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn signatures(&self) -> &[String] {
        &self.signatures
    }

    /// First signature found in `content`, if any.
    pub fn matched_signature(&self, content: &[u8]) -> Option<&str> {
        let text = String::from_utf8_lossy(content).to_lowercase();
        self.signatures
            .iter()
            .find(|signature| text.contains(signature.as_str()))
            .map(String::as_str)
    }
}

impl Default for KeywordClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_SIGNATURES.iter().copied())
    }
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, content: &[u8]) -> Result<Verdict, ClassifyError> {
        let start = Instant::now();
        let verdict = match self.matched_signature(content) {
            Some(signature) => {
                tracing::warn!(
                    signature = %signature,
                    content_len = content.len(),
                    duration_ms = start.elapsed().as_millis(),
                    "Content matched a disallowed signature"
                );
                Verdict::Infected
            }
            None => {
                tracing::debug!(
                    content_len = content.len(),
                    duration_ms = start.elapsed().as_millis(),
                    "Content classified clean"
                );
                Verdict::Clean
            }
        };
        Ok(verdict)
    }
}
