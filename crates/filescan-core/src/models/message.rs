use serde::{Deserialize, Serialize};

use crate::error::MessageError;
use crate::models::FileId;

/// Scan request carried by the message channel.
///
/// Wire format is the JSON object `{"fileId": "...", "filePath": "..."}`. Both
/// fields are required and unknown fields are rejected, so producer and consumer
/// cannot silently drift apart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScanMessage {
    #[serde(rename = "fileId")]
    pub file_id: FileId,
    /// Copy of the record's locator at publish time.
    #[serde(rename = "filePath")]
    pub locator: String,
}

impl ScanMessage {
    pub fn new(file_id: FileId, locator: impl Into<String>) -> Self {
        Self {
            file_id,
            locator: locator.into(),
        }
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, MessageError> {
        serde_json::to_vec(self).map_err(MessageError::Encode)
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(body).map_err(MessageError::Malformed)
    }
}
