use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PayloadError {
    #[error("document_text must not be empty")]
    EmptyDocumentText,
    #[error("metadata key must not be empty")]
    EmptyMetadataKey,
}

/// Binary attachment accompanying a submission; text is extracted from it
/// when possible, with `document_text` as the fallback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BinaryAttachment {
    pub filename: String,
    pub content: Vec<u8>,
    pub mime_type: String,
}

/// Canonical ingestion request consumed by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestionRequest {
    pub document_text: String,
    pub metadata: HashMap<String, String>,
    pub binary: Option<BinaryAttachment>,
}

impl IngestionRequest {
    pub fn text(document_text: impl Into<String>, metadata: HashMap<String, String>) -> Self {
        Self {
            document_text: document_text.into(),
            metadata,
            binary: None,
        }
    }

    pub fn document_name(&self) -> String {
        self.metadata
            .get("document_name")
            .cloned()
            .or_else(|| self.binary.as_ref().map(|binary| binary.filename.clone()))
            .unwrap_or_else(|| "documento".to_string())
    }
}

/// JSON body of the sync-jobs submission endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncJobPayload {
    pub document_text: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl SyncJobPayload {
    /// Synchronous validation: rejected payloads never reach the queue.
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.document_text.trim().is_empty() {
            return Err(PayloadError::EmptyDocumentText);
        }
        if self.metadata.keys().any(|key| key.trim().is_empty()) {
            return Err(PayloadError::EmptyMetadataKey);
        }
        Ok(())
    }

    pub fn into_request(self) -> IngestionRequest {
        IngestionRequest::text(self.document_text, self.metadata)
    }
}

/// Multipart upload: file bytes plus optional pre-extracted text.
#[derive(Debug, Clone)]
pub struct MultipartJobPayload {
    pub filename: String,
    pub content: Vec<u8>,
    pub mime_type: String,
    pub fallback_text: String,
    pub metadata: HashMap<String, String>,
}

impl MultipartJobPayload {
    pub fn into_request(self) -> IngestionRequest {
        let mut metadata = self.metadata;
        metadata
            .entry("document_name".to_string())
            .or_insert_with(|| self.filename.clone());

        IngestionRequest {
            document_text: self.fallback_text,
            metadata,
            binary: Some(BinaryAttachment {
                filename: self.filename,
                content: self.content,
                mime_type: self.mime_type,
            }),
        }
    }
}
