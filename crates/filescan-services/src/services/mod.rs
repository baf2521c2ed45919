pub mod classifier;
pub mod fetch;
pub mod memory;

pub use classifier::{Classifier, KeywordClassifier};
pub use fetch::{ContentFetcher, HttpContentFetcher};
pub use memory::InMemoryContentFetcher;
