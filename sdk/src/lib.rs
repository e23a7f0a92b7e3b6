use dashmap::DashMap;
use fisiorag_core::config::AppConfig;
use fisiorag_core::error::{ErrorCode, FisioError};
use fisiorag_core::flags::FeatureFlags;
use fisiorag_core::model::{now_ms, ChatMessage, Feedback, Vote};
use fisiorag_core::telemetry::EventSink;
use ingestion::api::SyncJobPayload;
use ingestion::cache::{CacheError, CacheMetrics, ClassificationCache};
use ingestion::processor::IngestionPipeline;
use jobs::queue::{ChannelJobQueue, Job, JobQueue};
use jobs::status::{JobState, JobStatusStore};
use jobs::worker::Worker;
use models::chat::ChatModel;
use models::classifier::KeywordClassifier;
use models::cross_encoder::{LexicalCrossEncoder, StaticCrossEncoderProvider};
use models::embedder::EmbeddingGateway;
use query::answer::{AnswerEngine, AnswerError, Citation};
use query::memory::SessionMemory;
use query::rerank::Reranker;
use query::retrieval::RetrievalEngine;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{Repository, StoreError};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("ingestion rejected: {0}")]
    IngestionRejected(String),
    #[error("invalid request: {0}")]
    Invalid(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("session rate limit exceeded")]
    SessionRateLimited,
    #[error("language model rate limited")]
    AgRateLimited,
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl FisioError for ServiceError {
    fn error_code(&self) -> ErrorCode {
        match self {
            ServiceError::IngestionRejected(_) | ServiceError::Invalid(_) => {
                ErrorCode::InvalidArgument
            }
            ServiceError::NotFound(_) => ErrorCode::NotFound,
            ServiceError::SessionRateLimited | ServiceError::AgRateLimited => {
                ErrorCode::ResourceExhausted
            }
            ServiceError::Unavailable(_) => ErrorCode::Unavailable,
            ServiceError::Internal(_) => ErrorCode::Internal,
        }
    }

    fn safe_message(&self) -> String {
        match self {
            ServiceError::Internal(_) => "internal error".to_string(),
            ServiceError::Unavailable(_) => "service unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<AnswerError> for ServiceError {
    fn from(err: AnswerError) -> Self {
        match err {
            AnswerError::RateLimited => ServiceError::AgRateLimited,
            AnswerError::Unavailable(message) => ServiceError::Unavailable(message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    /// Chunks persisted at response time; always 0 on the async path.
    pub inserted: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub status: JobState,
    pub inserted: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatTurnResponse {
    pub message_id: Uuid,
    pub content: String,
    pub citations: Vec<Citation>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub messages: Vec<ChatMessage>,
    pub total_count: usize,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackResponse {
    pub ok: bool,
}

/// Fixed-window per-session limiter for the chat surface.
struct SessionRateLimiter {
    windows: DashMap<String, (i64, u32)>,
    limit_per_minute: u32,
}

impl SessionRateLimiter {
    fn new(limit_per_minute: u32) -> Self {
        Self {
            windows: DashMap::new(),
            limit_per_minute: limit_per_minute.max(1),
        }
    }

    fn allow(&self, session_id: &str) -> bool {
        let now = now_ms();
        let mut entry = self
            .windows
            .entry(session_id.to_string())
            .or_insert((now, 0));
        let (window_start, count) = *entry;
        if now - window_start >= 60_000 {
            *entry = (now, 1);
            return true;
        }
        if count >= self.limit_per_minute {
            return false;
        }
        *entry = (window_start, count + 1);
        true
    }
}

/// The service facade: every operation the core exposes to its outer HTTP
/// shell, with the transport left to the caller.
pub struct FisioRag {
    config: AppConfig,
    repo: Arc<Repository>,
    queue: Arc<dyn JobQueue>,
    statuses: Arc<JobStatusStore>,
    answer: Arc<AnswerEngine>,
    memory: Arc<SessionMemory>,
    cache: Arc<ClassificationCache>,
    rate_limiter: SessionRateLimiter,
}

impl FisioRag {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        repo: Arc<Repository>,
        queue: Arc<dyn JobQueue>,
        statuses: Arc<JobStatusStore>,
        answer: Arc<AnswerEngine>,
        memory: Arc<SessionMemory>,
        cache: Arc<ClassificationCache>,
    ) -> Self {
        let rate_limiter =
            SessionRateLimiter::new(config.generation.session_rate_limit_per_minute);
        Self {
            config,
            repo,
            queue,
            statuses,
            answer,
            memory,
            cache,
            rate_limiter,
        }
    }

    /// Wire a complete in-process stack: WAL-backed repository, channel
    /// queue, deterministic embedder, keyword classifier and lexical
    /// reranker. The returned worker must be spawned by the caller.
    pub async fn offline(
        config: AppConfig,
        wal_path: impl AsRef<Path>,
        chat: Arc<dyn ChatModel>,
        sink: Arc<dyn EventSink>,
    ) -> Result<(Self, Worker), ServiceError> {
        let dims = config.embedding.embedding_model_dim;
        let repo = Arc::new(
            Repository::open(wal_path, dims)
                .await
                .map_err(|err| ServiceError::Internal(err.to_string()))?,
        );

        let gateway = Arc::new(EmbeddingGateway::deterministic(dims));
        let cache = Arc::new(
            ClassificationCache::in_memory(
                config.ingestion.classification_cache_enabled,
                config.ingestion.classification_cache_ttl_seconds,
            )
            .with_event_sink(sink.clone()),
        );
        let pipeline = Arc::new(
            IngestionPipeline::with_components(
                repo.clone(),
                Arc::new(KeywordClassifier),
                cache.clone(),
                gateway.clone(),
                sink.clone(),
            )
            .with_confidence_floor(config.ingestion.classification_confidence_floor)
            .with_cache_ttl_seconds(config.ingestion.classification_cache_ttl_seconds),
        );

        let (tx, rx) = mpsc::channel(64);
        let queue = Arc::new(ChannelJobQueue::new(tx));
        let statuses = Arc::new(JobStatusStore::new());
        let worker = Worker::new(rx, pipeline, statuses.clone()).with_retry_policy(
            config.ingestion.max_retries,
            config.ingestion.retry_base_delay_ms,
        );

        let reranker = Arc::new(Reranker::new(
            Arc::new(StaticCrossEncoderProvider::new(Arc::new(LexicalCrossEncoder))),
            config.retrieval.breaker_latency_threshold_ms,
            Duration::from_millis(config.retrieval.breaker_cooldown_ms),
            config.retrieval.cross_encoder_concurrency,
        ));
        let retrieval = Arc::new(
            RetrievalEngine::new(
                repo.clone(),
                gateway,
                config.retrieval.clone(),
                sink.clone(),
            )
            .with_reranker(reranker),
        );
        let memory = Arc::new(SessionMemory::new(
            repo.clone(),
            64,
            config.generation.history_turns,
        ));
        let answer = Arc::new(AnswerEngine::new(
            retrieval,
            chat,
            memory.clone(),
            repo.clone(),
            sink,
            config.generation.clone(),
        ));

        Ok((
            Self::new(config, repo, queue, statuses, answer, memory, cache),
            worker,
        ))
    }

    // -- ingestion ---------------------------------------------------------

    /// Submit a document for asynchronous ingestion. The job id equals the
    /// document UUID the content will resolve to.
    pub async fn submit_sync_job(
        &self,
        payload: SyncJobPayload,
    ) -> Result<SubmitResponse, ServiceError> {
        payload
            .validate()
            .map_err(|err| ServiceError::IngestionRejected(err.to_string()))?;

        let request = payload.into_request();
        let job_id = IngestionPipeline::document_id_for(&request);
        self.statuses.mark_pending(job_id);

        self.queue
            .enqueue(Job::IngestDocument { job_id, request })
            .await
            .map_err(|err| ServiceError::Unavailable(err.to_string()))?;

        tracing::info!(%job_id, "ingestion job enqueued");
        Ok(SubmitResponse {
            job_id,
            inserted: 0,
        })
    }

    pub fn sync_job_status(&self, job_id: Uuid) -> Result<JobStatusResponse, ServiceError> {
        let status = self
            .statuses
            .get(job_id)
            .ok_or_else(|| ServiceError::NotFound(format!("job {job_id}")))?;
        Ok(JobStatusResponse {
            job_id: status.job_id,
            status: status.state,
            inserted: status.inserted,
            error: status.error,
        })
    }

    // -- chat --------------------------------------------------------------

    /// Handle one chat turn. `idempotency_key` is the retry handle: a
    /// client resubmitting with the same key and content gets the first
    /// persisted response back instead of a second message pair. Without a
    /// key every call is a fresh turn.
    pub async fn post_message(
        &self,
        session_id: &str,
        content: &str,
        idempotency_key: Option<&str>,
    ) -> Result<ChatTurnResponse, ServiceError> {
        if session_id.trim().is_empty() {
            return Err(ServiceError::Invalid("session_id must not be empty".to_string()));
        }
        if content.trim().is_empty() {
            return Err(ServiceError::Invalid("content must not be empty".to_string()));
        }
        if !self.rate_limiter.allow(session_id) {
            return Err(ServiceError::SessionRateLimited);
        }

        // Flags are snapshotted here and stay fixed for the whole turn.
        let flags = FeatureFlags::from_config(&self.config.retrieval);
        let turn_key = idempotency_key.map(|key| key.to_string());
        let response = self
            .answer
            .answer(session_id, content, flags, turn_key)
            .await?;

        Ok(ChatTurnResponse {
            message_id: response.message_id,
            content: response.content,
            citations: response.citations,
            latency_ms: response.latency_ms,
        })
    }

    pub async fn session_history(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> HistoryResponse {
        let page = self.memory.get_history(session_id, limit, offset).await;
        HistoryResponse {
            messages: page.messages,
            total_count: page.total,
            has_more: page.has_more,
        }
    }

    // -- feedback ----------------------------------------------------------

    pub async fn post_feedback(
        &self,
        message_id: Uuid,
        session_id: &str,
        vote: Vote,
    ) -> Result<FeedbackResponse, ServiceError> {
        let feedback = Feedback {
            session_id: session_id.to_string(),
            message_id,
            vote,
            created_at_ms: now_ms(),
        };

        match self.repo.upsert_feedback(feedback).await {
            Ok(_) => Ok(FeedbackResponse { ok: true }),
            Err(StoreError::NotFound) => {
                Err(ServiceError::NotFound(format!("message {message_id}")))
            }
            Err(err) => Err(ServiceError::Internal(err.to_string())),
        }
    }

    // -- classification cache admin ---------------------------------------

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    pub fn cache_invalidate(&self, digest: &str) -> Result<bool, ServiceError> {
        self.cache
            .invalidate(digest)
            .map_err(|err: CacheError| ServiceError::Unavailable(err.to_string()))
    }

    pub fn cache_invalidate_all(&self) -> Result<usize, ServiceError> {
        self.cache
            .invalidate_all()
            .map_err(|err: CacheError| ServiceError::Unavailable(err.to_string()))
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }
}
