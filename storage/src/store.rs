use crate::index::{VectorIndex, VectorIndexError};
use crate::wal::{Wal, WalError};
use fisiorag_core::error::{ErrorCode, FisioError};
use fisiorag_core::model::{
    now_ms, ChatMessage, ChunkingStrategy, Document, DocumentChunk, DocumentStatus, Feedback,
    MessageRole, Vote,
};
use rkyv::ser::{serializers::AllocSerializer, Serializer};
use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),
    #[error("vector index error: {0}")]
    Index(#[from] VectorIndexError),
    #[error("Serialization error")]
    Serialization,
    #[error("Not found")]
    NotFound,
    #[error("foreign key violation: document {document_id} does not exist")]
    ForeignKey { document_id: Uuid },
    #[error("partial chunk insert, missing sequence numbers {missing_sequences:?}")]
    PartialInsert { missing_sequences: Vec<u32> },
    #[error("chunk at sequence {sequence} has no embedding")]
    MissingEmbedding { sequence: u32 },
    #[error("chunk metadata is missing a sequence number")]
    MissingSequence,
    #[error("invalid status transition {from:?} -> {to:?}")]
    InvalidTransition {
        from: DocumentStatus,
        to: DocumentStatus,
    },
}

impl FisioError for StoreError {
    fn error_code(&self) -> ErrorCode {
        match self {
            StoreError::NotFound => ErrorCode::NotFound,
            StoreError::ForeignKey { .. }
            | StoreError::InvalidTransition { .. }
            | StoreError::MissingEmbedding { .. }
            | StoreError::MissingSequence => ErrorCode::FailedPrecondition,
            StoreError::Index(VectorIndexError::DimensionMismatch { .. }) => {
                ErrorCode::FailedPrecondition
            }
            _ => ErrorCode::Internal,
        }
    }
}

// ---------------------------------------------------------------------------
// Durable record types. UUIDs cross the rkyv boundary as u128; enums as u8.
// ---------------------------------------------------------------------------

#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
#[archive(check_bytes)]
struct DocumentRecord {
    id: u128,
    file_name: String,
    file_path: String,
    file_hash: String,
    status: u8,
    strategy_json: String,
    metadata: HashMap<String, String>,
    created_at_ms: i64,
    updated_at_ms: i64,
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
#[archive(check_bytes)]
struct ChunkRecord {
    id: u128,
    document_id: u128,
    sequence: u32,
    content: String,
    embedding: Vec<f32>,
    metadata: HashMap<String, String>,
    created_at_ms: i64,
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
#[archive(check_bytes)]
struct MessageRecord {
    id: u128,
    session_id: String,
    role: u8,
    content: String,
    source_chunk_ids: Vec<u128>,
    metadata: HashMap<String, String>,
    idempotency_key: String,
    created_at_ms: i64,
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
#[archive(check_bytes)]
struct FeedbackRecord {
    session_id: String,
    message_id: u128,
    vote: u8,
    created_at_ms: i64,
}

#[derive(Archive, RkyvSerialize, RkyvDeserialize, Debug, Clone)]
#[archive(check_bytes)]
enum WalEntry {
    UpsertDocument(DocumentRecord),
    SetDocumentStatus {
        id: u128,
        status: u8,
        error: Option<String>,
        updated_at_ms: i64,
    },
    InsertChunks(Vec<ChunkRecord>),
    DeleteDocument(u128),
    AppendMessage(MessageRecord),
    UpsertFeedback(FeedbackRecord),
}

fn status_to_u8(status: DocumentStatus) -> u8 {
    match status {
        DocumentStatus::Pending => 0,
        DocumentStatus::Processing => 1,
        DocumentStatus::Completed => 2,
        DocumentStatus::Error => 3,
    }
}

fn status_from_u8(raw: u8) -> DocumentStatus {
    match raw {
        0 => DocumentStatus::Pending,
        1 => DocumentStatus::Processing,
        2 => DocumentStatus::Completed,
        _ => DocumentStatus::Error,
    }
}

fn role_to_u8(role: MessageRole) -> u8 {
    match role {
        MessageRole::User => 0,
        MessageRole::Assistant => 1,
        MessageRole::System => 2,
    }
}

fn role_from_u8(raw: u8) -> MessageRole {
    match raw {
        0 => MessageRole::User,
        1 => MessageRole::Assistant,
        _ => MessageRole::System,
    }
}

fn vote_to_u8(vote: Vote) -> u8 {
    match vote {
        Vote::Up => 0,
        Vote::Down => 1,
    }
}

fn vote_from_u8(raw: u8) -> Vote {
    if raw == 0 {
        Vote::Up
    } else {
        Vote::Down
    }
}

fn document_to_record(doc: &Document) -> Result<DocumentRecord, StoreError> {
    let strategy_json =
        serde_json::to_string(&doc.chunking_strategy).map_err(|_| StoreError::Serialization)?;
    Ok(DocumentRecord {
        id: doc.id.as_u128(),
        file_name: doc.file_name.clone(),
        file_path: doc.file_path.clone(),
        file_hash: doc.file_hash.clone(),
        status: status_to_u8(doc.status),
        strategy_json,
        metadata: doc.metadata.clone(),
        created_at_ms: doc.created_at_ms,
        updated_at_ms: doc.updated_at_ms,
    })
}

fn document_from_record(record: &DocumentRecord) -> Document {
    let chunking_strategy = serde_json::from_str(&record.strategy_json).unwrap_or_else(|_| {
        tracing::warn!(file_hash = %record.file_hash, "unreadable strategy tag, using default");
        ChunkingStrategy::recursive_default()
    });
    Document {
        id: Uuid::from_u128(record.id),
        file_name: record.file_name.clone(),
        file_path: record.file_path.clone(),
        file_hash: record.file_hash.clone(),
        status: status_from_u8(record.status),
        chunking_strategy,
        metadata: record.metadata.clone(),
        created_at_ms: record.created_at_ms,
        updated_at_ms: record.updated_at_ms,
    }
}

fn chunk_from_record(record: &ChunkRecord) -> DocumentChunk {
    DocumentChunk {
        id: Uuid::from_u128(record.id),
        document_id: Uuid::from_u128(record.document_id),
        content: record.content.clone(),
        embedding: Some(record.embedding.clone()),
        metadata: record.metadata.clone(),
        created_at_ms: record.created_at_ms,
    }
}

fn message_to_record(msg: &ChatMessage) -> MessageRecord {
    MessageRecord {
        id: msg.id.as_u128(),
        session_id: msg.session_id.clone(),
        role: role_to_u8(msg.role),
        content: msg.content.clone(),
        source_chunk_ids: msg.source_chunk_ids.iter().map(|id| id.as_u128()).collect(),
        metadata: msg.metadata.clone(),
        idempotency_key: msg.idempotency_key.clone(),
        created_at_ms: msg.created_at_ms,
    }
}

fn message_from_record(record: &MessageRecord) -> ChatMessage {
    ChatMessage {
        id: Uuid::from_u128(record.id),
        session_id: record.session_id.clone(),
        role: role_from_u8(record.role),
        content: record.content.clone(),
        source_chunk_ids: record
            .source_chunk_ids
            .iter()
            .map(|id| Uuid::from_u128(*id))
            .collect(),
        metadata: record.metadata.clone(),
        idempotency_key: record.idempotency_key.clone(),
        created_at_ms: record.created_at_ms,
    }
}

// ---------------------------------------------------------------------------
// Materialized state and read models
// ---------------------------------------------------------------------------

/// Similarity search hit, in descending similarity order.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChunkHit {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub similarity: f32,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HistoryPage {
    pub messages: Vec<ChatMessage>,
    pub total: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AppendedMessage {
    pub message: ChatMessage,
    /// True when the idempotency key matched an existing row and no new
    /// write happened.
    pub deduplicated: bool,
}

struct StoreState {
    documents: HashMap<Uuid, Document>,
    doc_by_hash: HashMap<String, Uuid>,
    chunks: HashMap<Uuid, DocumentChunk>,
    doc_chunks: HashMap<Uuid, BTreeMap<u32, Uuid>>,
    vector: VectorIndex,
    key_by_chunk: HashMap<Uuid, u64>,
    chunk_by_key: HashMap<u64, Uuid>,
    next_vector_key: u64,
    messages: HashMap<Uuid, ChatMessage>,
    session_log: HashMap<String, Vec<Uuid>>,
    message_by_idem: HashMap<String, Uuid>,
    feedback: HashMap<(String, Uuid), Feedback>,
}

impl StoreState {
    fn new(vector: VectorIndex) -> Self {
        Self {
            documents: HashMap::new(),
            doc_by_hash: HashMap::new(),
            chunks: HashMap::new(),
            doc_chunks: HashMap::new(),
            vector,
            key_by_chunk: HashMap::new(),
            chunk_by_key: HashMap::new(),
            next_vector_key: 1,
            messages: HashMap::new(),
            session_log: HashMap::new(),
            message_by_idem: HashMap::new(),
            feedback: HashMap::new(),
        }
    }

    fn apply(&mut self, entry: &WalEntry) {
        match entry {
            WalEntry::UpsertDocument(record) => {
                let doc = document_from_record(record);
                self.doc_by_hash.insert(doc.file_hash.clone(), doc.id);
                self.documents.insert(doc.id, doc);
            }
            WalEntry::SetDocumentStatus {
                id,
                status,
                error,
                updated_at_ms,
            } => {
                if let Some(doc) = self.documents.get_mut(&Uuid::from_u128(*id)) {
                    doc.status = status_from_u8(*status);
                    doc.updated_at_ms = *updated_at_ms;
                    match error {
                        Some(message) => {
                            doc.metadata.insert("error".to_string(), message.clone());
                        }
                        None => {
                            doc.metadata.remove("error");
                        }
                    }
                }
            }
            WalEntry::InsertChunks(records) => {
                for record in records {
                    self.upsert_chunk(record);
                }
            }
            WalEntry::DeleteDocument(id) => {
                let document_id = Uuid::from_u128(*id);
                if let Some(doc) = self.documents.remove(&document_id) {
                    self.doc_by_hash.remove(&doc.file_hash);
                }
                if let Some(sequences) = self.doc_chunks.remove(&document_id) {
                    for chunk_id in sequences.values() {
                        self.chunks.remove(chunk_id);
                        self.drop_vector_key(*chunk_id);
                    }
                }
            }
            WalEntry::AppendMessage(record) => {
                if self.message_by_idem.contains_key(&record.idempotency_key) {
                    return;
                }
                let msg = message_from_record(record);
                self.message_by_idem
                    .insert(msg.idempotency_key.clone(), msg.id);
                self.session_log
                    .entry(msg.session_id.clone())
                    .or_default()
                    .push(msg.id);
                self.messages.insert(msg.id, msg);
            }
            WalEntry::UpsertFeedback(record) => {
                let feedback = Feedback {
                    session_id: record.session_id.clone(),
                    message_id: Uuid::from_u128(record.message_id),
                    vote: vote_from_u8(record.vote),
                    created_at_ms: record.created_at_ms,
                };
                self.feedback.insert(
                    (feedback.session_id.clone(), feedback.message_id),
                    feedback,
                );
            }
        }
    }

    fn upsert_chunk(&mut self, record: &ChunkRecord) {
        let chunk = chunk_from_record(record);
        let document_id = chunk.document_id;

        let sequences = self.doc_chunks.entry(document_id).or_default();
        if let Some(previous) = sequences.insert(record.sequence, chunk.id) {
            if previous != chunk.id {
                self.chunks.remove(&previous);
                self.drop_vector_key(previous);
            }
        }

        let key = match self.key_by_chunk.get(&chunk.id) {
            Some(existing) => *existing,
            None => {
                let key = self.next_vector_key;
                self.next_vector_key += 1;
                self.key_by_chunk.insert(chunk.id, key);
                self.chunk_by_key.insert(key, chunk.id);
                key
            }
        };

        if let Err(err) = self.vector.insert(key, &record.embedding) {
            tracing::warn!(chunk_id = %chunk.id, error = %err, "chunk skipped by vector index");
        }

        self.chunks.insert(chunk.id, chunk);
    }

    fn drop_vector_key(&mut self, chunk_id: Uuid) {
        if let Some(key) = self.key_by_chunk.remove(&chunk_id) {
            self.chunk_by_key.remove(&key);
            self.vector.remove(key);
        }
    }
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Durable store for documents, chunks (with vector search), chat messages
/// and feedback. All mutations are framed WAL records applied to an
/// in-memory materialized state; replay on open restores it.
pub struct Repository {
    wal: Arc<Mutex<Wal>>,
    tx_lock: Arc<Mutex<()>>,
    state: Arc<RwLock<StoreState>>,
    embedding_dims: usize,
}

impl Repository {
    /// Open the repository, replaying the WAL at `wal_path`. The embedding
    /// dimension is fixed here and enforced on every chunk insert.
    pub async fn open(
        wal_path: impl AsRef<Path>,
        embedding_dims: usize,
    ) -> Result<Self, StoreError> {
        let mut wal = Wal::open(wal_path).await?;
        let vector = VectorIndex::new(embedding_dims)?;
        let mut state = StoreState::new(vector);

        wal.replay(|_lsn, data| {
            let archived = rkyv::check_archived_root::<WalEntry>(&data[..])
                .map_err(|_| WalError::CorruptEntry)?;
            let entry: WalEntry = archived.deserialize(&mut rkyv::Infallible).unwrap();
            state.apply(&entry);
            Ok(())
        })
        .await?;

        Ok(Self {
            wal: Arc::new(Mutex::new(wal)),
            tx_lock: Arc::new(Mutex::new(())),
            state: Arc::new(RwLock::new(state)),
            embedding_dims,
        })
    }

    pub fn embedding_dims(&self) -> usize {
        self.embedding_dims
    }

    async fn commit(&self, entry: WalEntry) -> Result<(), StoreError> {
        let bytes = serialize_wal_entry(&entry)?;

        // Durability first, then the in-memory apply under the write lock so
        // readers never observe a state the WAL does not contain.
        {
            let mut wal = self.wal.lock().await;
            wal.append(&bytes).await?;
            wal.flush().await?;
        }

        let mut state = self.state.write().await;
        state.apply(&entry);
        Ok(())
    }

    // -- documents ---------------------------------------------------------

    /// Insert or update a document keyed by `file_hash`. A matching hash
    /// keeps the existing id and created_at, moves the row back to
    /// `processing` and advances `updated_at`.
    pub async fn upsert_document(&self, incoming: Document) -> Result<Document, StoreError> {
        let _tx = self.tx_lock.lock().await;

        let effective = {
            let state = self.state.read().await;
            match state
                .doc_by_hash
                .get(&incoming.file_hash)
                .and_then(|id| state.documents.get(id))
            {
                Some(existing) => {
                    if existing.status != DocumentStatus::Processing
                        && !existing.status.can_transition_to(DocumentStatus::Processing)
                    {
                        return Err(StoreError::InvalidTransition {
                            from: existing.status,
                            to: DocumentStatus::Processing,
                        });
                    }
                    Document {
                        id: existing.id,
                        created_at_ms: existing.created_at_ms,
                        updated_at_ms: now_ms().max(existing.updated_at_ms + 1),
                        status: DocumentStatus::Processing,
                        ..incoming
                    }
                }
                None => Document {
                    status: DocumentStatus::Processing,
                    ..incoming
                },
            }
        };

        let record = document_to_record(&effective)?;
        self.commit(WalEntry::UpsertDocument(record)).await?;
        Ok(effective)
    }

    pub async fn document(&self, id: Uuid) -> Result<Document, StoreError> {
        let state = self.state.read().await;
        state.documents.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    pub async fn document_by_hash(&self, file_hash: &str) -> Option<Document> {
        let state = self.state.read().await;
        state
            .doc_by_hash
            .get(file_hash)
            .and_then(|id| state.documents.get(id))
            .cloned()
    }

    pub async fn set_document_status(
        &self,
        id: Uuid,
        status: DocumentStatus,
        error: Option<String>,
    ) -> Result<(), StoreError> {
        let _tx = self.tx_lock.lock().await;

        let updated_at_ms = {
            let state = self.state.read().await;
            let doc = state.documents.get(&id).ok_or(StoreError::NotFound)?;
            if doc.status != status && !doc.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    from: doc.status,
                    to: status,
                });
            }
            now_ms().max(doc.updated_at_ms + 1)
        };

        self.commit(WalEntry::SetDocumentStatus {
            id: id.as_u128(),
            status: status_to_u8(status),
            error,
            updated_at_ms,
        })
        .await
    }

    pub async fn delete_document(&self, id: Uuid) -> Result<(), StoreError> {
        let _tx = self.tx_lock.lock().await;

        {
            let state = self.state.read().await;
            if !state.documents.contains_key(&id) {
                return Err(StoreError::NotFound);
            }
        }

        self.commit(WalEntry::DeleteDocument(id.as_u128())).await
    }

    // -- chunks ------------------------------------------------------------

    /// Insert a batch of chunks for `document_id` as one transaction.
    /// Upserts by (document_id, sequence_number). Validates the parent row,
    /// backfills a nil document_id from chunk metadata, and requires a full
    /// embedding of the configured dimension on every chunk.
    pub async fn insert_chunks(
        &self,
        document_id: Uuid,
        chunks: Vec<DocumentChunk>,
    ) -> Result<usize, StoreError> {
        if chunks.is_empty() {
            return Ok(0);
        }

        let _tx = self.tx_lock.lock().await;

        {
            let state = self.state.read().await;
            if !state.documents.contains_key(&document_id) {
                return Err(StoreError::ForeignKey { document_id });
            }
        }

        let expected = chunks.len();
        let mut records = Vec::with_capacity(expected);
        let mut seen_sequences = HashSet::new();
        let mut duplicate_sequences = Vec::new();

        for chunk in &chunks {
            let sequence = chunk.sequence_number().ok_or(StoreError::MissingSequence)?;

            // Backfill: a nil document_id is recovered from the denormalized
            // copy the ingestion pipeline writes into chunk metadata.
            let owner = if chunk.document_id.is_nil() {
                chunk
                    .metadata
                    .get(fisiorag_core::model::chunk_meta::DOCUMENT_ID)
                    .and_then(|raw| Uuid::parse_str(raw).ok())
                    .ok_or(StoreError::ForeignKey { document_id })?
            } else {
                chunk.document_id
            };
            if owner != document_id {
                return Err(StoreError::ForeignKey { document_id: owner });
            }

            let embedding = chunk
                .embedding
                .as_ref()
                .ok_or(StoreError::MissingEmbedding { sequence })?;
            if embedding.len() != self.embedding_dims {
                return Err(StoreError::Index(VectorIndexError::DimensionMismatch {
                    expected: self.embedding_dims,
                    actual: embedding.len(),
                }));
            }

            if !seen_sequences.insert(sequence) {
                duplicate_sequences.push(sequence);
                continue;
            }

            records.push(ChunkRecord {
                id: chunk.id.as_u128(),
                document_id: owner.as_u128(),
                sequence,
                content: chunk.content.clone(),
                embedding: embedding.clone(),
                metadata: chunk.metadata.clone(),
                created_at_ms: chunk.created_at_ms,
            });
        }

        if !duplicate_sequences.is_empty() {
            duplicate_sequences.sort_unstable();
            return Err(StoreError::PartialInsert {
                missing_sequences: duplicate_sequences,
            });
        }

        self.commit(WalEntry::InsertChunks(records)).await?;
        Ok(expected)
    }

    pub async fn chunk_count(&self, document_id: Uuid) -> usize {
        let state = self.state.read().await;
        state
            .doc_chunks
            .get(&document_id)
            .map(|sequences| sequences.len())
            .unwrap_or(0)
    }

    /// All chunks of a document in sequence order.
    pub async fn chunks_for_document(&self, document_id: Uuid) -> Vec<DocumentChunk> {
        let state = self.state.read().await;
        state
            .doc_chunks
            .get(&document_id)
            .map(|sequences| {
                sequences
                    .values()
                    .filter_map(|chunk_id| state.chunks.get(chunk_id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn get_chunks(&self, ids: &[Uuid]) -> Vec<DocumentChunk> {
        let state = self.state.read().await;
        ids.iter()
            .filter_map(|id| state.chunks.get(id).cloned())
            .collect()
    }

    /// Cosine-similarity search over all indexed chunks. Results are
    /// ordered by descending similarity, keep only `similarity > threshold`,
    /// and are truncated to `k`.
    pub async fn search_chunks(
        &self,
        query_embedding: &[f32],
        threshold: f32,
        k: usize,
    ) -> Result<Vec<ChunkHit>, StoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let state = self.state.read().await;
        if state.vector.is_empty() {
            return Ok(Vec::new());
        }

        let hits = state.vector.search(query_embedding, threshold, k)?;
        Ok(hits
            .into_iter()
            .filter_map(|(key, similarity)| {
                let chunk_id = state.chunk_by_key.get(&key)?;
                let chunk = state.chunks.get(chunk_id)?;
                Some(ChunkHit {
                    chunk_id: chunk.id,
                    document_id: chunk.document_id,
                    content: chunk.content.clone(),
                    similarity,
                })
            })
            .collect())
    }

    // -- chat messages -----------------------------------------------------

    /// Append a chat message. A duplicate idempotency key is not an error:
    /// the previously persisted row is returned with `deduplicated = true`.
    pub async fn append_message(&self, message: ChatMessage) -> Result<AppendedMessage, StoreError> {
        let _tx = self.tx_lock.lock().await;

        {
            let state = self.state.read().await;
            if let Some(existing_id) = state.message_by_idem.get(&message.idempotency_key) {
                let existing = state
                    .messages
                    .get(existing_id)
                    .cloned()
                    .ok_or(StoreError::NotFound)?;
                return Ok(AppendedMessage {
                    message: existing,
                    deduplicated: true,
                });
            }
        }

        let record = message_to_record(&message);
        self.commit(WalEntry::AppendMessage(record)).await?;
        Ok(AppendedMessage {
            message,
            deduplicated: false,
        })
    }

    pub async fn message(&self, id: Uuid) -> Result<ChatMessage, StoreError> {
        let state = self.state.read().await;
        state.messages.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    pub async fn message_by_idempotency_key(&self, key: &str) -> Option<ChatMessage> {
        let state = self.state.read().await;
        state
            .message_by_idem
            .get(key)
            .and_then(|id| state.messages.get(id))
            .cloned()
    }

    /// Chronological page of a session's messages. Unknown sessions produce
    /// an empty page with `has_more = false`.
    pub async fn session_history(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> HistoryPage {
        let state = self.state.read().await;
        let Some(log) = state.session_log.get(session_id) else {
            return HistoryPage {
                messages: Vec::new(),
                total: 0,
                has_more: false,
            };
        };

        let total = log.len();
        let start = offset.min(total);
        let end = start.saturating_add(limit).min(total);
        let messages = log[start..end]
            .iter()
            .filter_map(|id| state.messages.get(id).cloned())
            .collect();

        HistoryPage {
            messages,
            total,
            has_more: end < total,
        }
    }

    /// Most recent `limit` messages of a session in chronological order.
    pub async fn recent_messages(&self, session_id: &str, limit: usize) -> Vec<ChatMessage> {
        let state = self.state.read().await;
        let Some(log) = state.session_log.get(session_id) else {
            return Vec::new();
        };
        let start = log.len().saturating_sub(limit);
        log[start..]
            .iter()
            .filter_map(|id| state.messages.get(id).cloned())
            .collect()
    }

    // -- feedback ----------------------------------------------------------

    /// Record a vote; unique on (session_id, message_id), a second
    /// submission overwrites the vote.
    pub async fn upsert_feedback(&self, feedback: Feedback) -> Result<Feedback, StoreError> {
        let _tx = self.tx_lock.lock().await;

        {
            let state = self.state.read().await;
            if !state.messages.contains_key(&feedback.message_id) {
                return Err(StoreError::NotFound);
            }
        }

        let record = FeedbackRecord {
            session_id: feedback.session_id.clone(),
            message_id: feedback.message_id.as_u128(),
            vote: vote_to_u8(feedback.vote),
            created_at_ms: feedback.created_at_ms,
        };
        self.commit(WalEntry::UpsertFeedback(record)).await?;
        Ok(feedback)
    }

    pub async fn feedback_for(&self, session_id: &str, message_id: Uuid) -> Option<Feedback> {
        let state = self.state.read().await;
        state
            .feedback
            .get(&(session_id.to_string(), message_id))
            .cloned()
    }
}

fn serialize_wal_entry(entry: &WalEntry) -> Result<Vec<u8>, StoreError> {
    let mut serializer = AllocSerializer::<4096>::default();
    serializer
        .serialize_value(entry)
        .map_err(|_| StoreError::Serialization)?;
    Ok(serializer.into_serializer().into_inner().to_vec())
}
