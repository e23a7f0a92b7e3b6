use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use uuid::Uuid;

/// Metadata keys shared between the ingestion pipeline and the store.
pub mod chunk_meta {
    pub const DOCUMENT_ID: &str = "document_id";
    pub const DOCUMENT_NAME: &str = "document_name";
    pub const SEQUENCE_NUMBER: &str = "sequence_number";
    pub const CHUNKING_STRATEGY: &str = "chunking_strategy";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Error => "error",
        }
    }

    /// Legal transitions of the ingestion status machine.
    /// `completed -> processing` is the re-ingest path.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        matches!(
            (self, next),
            (DocumentStatus::Pending, DocumentStatus::Processing)
                | (DocumentStatus::Processing, DocumentStatus::Completed)
                | (DocumentStatus::Processing, DocumentStatus::Error)
                | (DocumentStatus::Completed, DocumentStatus::Processing)
                | (DocumentStatus::Error, DocumentStatus::Processing)
        )
    }
}

/// Chunking strategy as a tagged variant. The tag string is what gets
/// persisted on the Document row and into every chunk's metadata, so the
/// behavior that produced a chunk is auditable after the fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChunkingStrategy {
    Recursive { max_chars: usize, overlap: usize },
    Semantic { breakpoint: f32 },
    Tabular,
}

impl ChunkingStrategy {
    pub fn recursive_default() -> Self {
        ChunkingStrategy::Recursive {
            max_chars: 1000,
            overlap: 200,
        }
    }

    pub fn tag(&self) -> String {
        match self {
            ChunkingStrategy::Recursive { max_chars, overlap } => {
                format!("recursive::{}/{}", max_chars, overlap)
            }
            ChunkingStrategy::Semantic { breakpoint } => {
                format!("semantic::{:.2}", breakpoint)
            }
            ChunkingStrategy::Tabular => "tabular".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub file_name: String,
    pub file_path: String,
    pub file_hash: String,
    pub status: DocumentStatus,
    pub chunking_strategy: ChunkingStrategy,
    pub metadata: HashMap<String, String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl Document {
    pub fn new(
        file_name: impl Into<String>,
        file_path: impl Into<String>,
        file_hash: impl Into<String>,
        chunking_strategy: ChunkingStrategy,
        metadata: HashMap<String, String>,
    ) -> Self {
        let file_hash = file_hash.into();
        let now = now_ms();
        Self {
            id: document_id_for_hash(&file_hash),
            file_name: file_name.into(),
            file_path: file_path.into(),
            file_hash,
            status: DocumentStatus::Processing,
            chunking_strategy,
            metadata,
            created_at_ms: now,
            updated_at_ms: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub embedding: Option<Vec<f32>>,
    pub metadata: HashMap<String, String>,
    pub created_at_ms: i64,
}

impl DocumentChunk {
    pub fn sequence_number(&self) -> Option<u32> {
        self.metadata
            .get(chunk_meta::SEQUENCE_NUMBER)
            .and_then(|raw| raw.parse::<u32>().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    /// Empty when the message cites nothing.
    pub source_chunk_ids: Vec<Uuid>,
    pub metadata: HashMap<String, String>,
    pub idempotency_key: String,
    pub created_at_ms: i64,
}

impl ChatMessage {
    pub fn new(
        session_id: impl Into<String>,
        role: MessageRole,
        content: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
            role,
            content: content.into(),
            source_chunk_ids: Vec::new(),
            metadata: HashMap::new(),
            idempotency_key: idempotency_key.into(),
            created_at_ms: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Vote {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub session_id: String,
    pub message_id: Uuid,
    pub vote: Vote,
    pub created_at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStructure {
    Narrative,
    Tabular,
    Mixed,
}

/// Output of the document classifier. `version` tracks the classifier
/// schema so cached results from older versions read as misses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub domain: String,
    pub structure: DocumentStructure,
    pub confidence: f32,
    pub version: u32,
}

/// Domain tag applied when classification confidence is below threshold.
pub const FALLBACK_DOMAIN: &str = "tecnico_generico";

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Derive the Document UUID from its file hash. Re-ingesting identical
/// bytes therefore resolves to the same document identity.
pub fn document_id_for_hash(file_hash: &str) -> Uuid {
    derive_uuid(&[b"document", file_hash.as_bytes()])
}

/// Derive a chunk UUID from the parent file hash and sequence number, so a
/// re-ingest produces the same chunk identities in the same order.
pub fn chunk_id_for_sequence(file_hash: &str, sequence_number: u32) -> Uuid {
    derive_uuid(&[
        b"chunk",
        file_hash.as_bytes(),
        &sequence_number.to_le_bytes(),
    ])
}

/// Deterministic idempotency key for a chat turn: one row per
/// (session, timestamp, content digest) regardless of delivery retries.
pub fn message_idempotency_key(session_id: &str, created_at_ms: i64, content: &str) -> String {
    let content_digest = sha256_hex(content.as_bytes());
    let mut hasher = Sha256::new();
    hasher.update(session_id.as_bytes());
    hasher.update(created_at_ms.to_le_bytes());
    hasher.update(content_digest.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn derive_uuid(parts: &[&[u8]]) -> Uuid {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_is_stable_for_same_hash() {
        let a = document_id_for_hash("abc123");
        let b = document_id_for_hash("abc123");
        assert_eq!(a, b);
        assert_ne!(a, document_id_for_hash("abc124"));
    }

    #[test]
    fn chunk_ids_differ_by_sequence() {
        let a = chunk_id_for_sequence("abc123", 0);
        let b = chunk_id_for_sequence("abc123", 1);
        assert_ne!(a, b);
        assert_eq!(a, chunk_id_for_sequence("abc123", 0));
    }

    #[test]
    fn status_machine_permits_reingest_only() {
        use DocumentStatus::*;
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Error));
        assert!(Completed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Error));
        assert!(!Error.can_transition_to(Completed));
    }

    #[test]
    fn idempotency_key_is_deterministic() {
        let a = message_idempotency_key("session-1", 1_700_000_000_000, "ciao");
        let b = message_idempotency_key("session-1", 1_700_000_000_000, "ciao");
        assert_eq!(a, b);
        assert_ne!(a, message_idempotency_key("session-2", 1_700_000_000_000, "ciao"));
    }

    #[test]
    fn strategy_tag_encodes_params() {
        assert_eq!(
            ChunkingStrategy::recursive_default().tag(),
            "recursive::1000/200"
        );
        assert_eq!(ChunkingStrategy::Tabular.tag(), "tabular");
    }
}
