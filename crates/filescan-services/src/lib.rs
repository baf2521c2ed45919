//! Filescan Services Layer
//!
//! External capabilities the scan worker depends on: retrieving a file's content
//! from its locator and classifying that content. Both sit behind traits so the
//! worker can run against the in-memory content source in tests.

pub mod services;

pub use services::classifier::{Classifier, KeywordClassifier, DEFAULT_SIGNATURES};
pub use services::fetch::{ContentFetcher, HttpContentFetcher};
pub use services::memory::InMemoryContentFetcher;
