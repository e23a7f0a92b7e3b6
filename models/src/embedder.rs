use fisiorag_core::error::{ErrorCode, FisioError};
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

pub const DEFAULT_EMBEDDING_DIMS: usize = 1536;
pub const DEFAULT_EMBEDDING_MODEL: &str = "embed-clinical-v1";

#[derive(Error, Debug, Clone)]
pub enum EmbeddingError {
    #[error("embedding credentials rejected")]
    Auth,
    #[error("embedding rate limit exceeded")]
    RateLimited,
    #[error("transient embedding failure: {0}")]
    Transient(String),
    #[error("embedding failure: {0}")]
    Fatal(String),
}

impl EmbeddingError {
    /// Rate limits and connection/5xx failures are worth another attempt;
    /// credential failures never are.
    pub fn is_retriable(&self) -> bool {
        matches!(self, EmbeddingError::RateLimited | EmbeddingError::Transient(_))
    }
}

impl FisioError for EmbeddingError {
    fn error_code(&self) -> ErrorCode {
        match self {
            EmbeddingError::Auth => ErrorCode::FailedPrecondition,
            EmbeddingError::RateLimited => ErrorCode::ResourceExhausted,
            EmbeddingError::Transient(_) => ErrorCode::Unavailable,
            EmbeddingError::Fatal(_) => ErrorCode::Internal,
        }
    }

    fn safe_message(&self) -> String {
        match self {
            EmbeddingError::Auth => "embedding provider rejected credentials".to_string(),
            EmbeddingError::RateLimited => "embedding provider rate limited".to_string(),
            _ => "embedding provider unavailable".to_string(),
        }
    }
}

/// Raw transport to the embedding model: one call, one batch, no policy.
/// The gateway layers batching, retry and concurrency control on top.
#[async_trait::async_trait]
pub trait EmbeddingTransport: Send + Sync {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
    fn dims(&self) -> usize;
}

/// Hash-seeded transport for tests and offline runs. Same text, same vector.
pub struct DeterministicEmbedder {
    dims: usize,
    model_id: String,
}

impl DeterministicEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims: dims.max(1),
            model_id: DEFAULT_EMBEDDING_MODEL.to_string(),
        }
    }
}

impl Default for DeterministicEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_EMBEDDING_DIMS)
    }
}

#[async_trait::async_trait]
impl EmbeddingTransport for DeterministicEmbedder {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                fisiorag_core::embedding::deterministic_embedding(text, &self.model_id, self.dims)
            })
            .collect())
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

#[derive(Deserialize)]
struct EmbeddingResponseItem {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingResponseItem>,
}

/// OpenAI-style HTTP embedding endpoint.
pub struct HttpEmbeddingTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    dims: usize,
}

impl HttpEmbeddingTransport {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dims: usize,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            dims,
        }
    }
}

#[async_trait::async_trait]
impl EmbeddingTransport for HttpEmbeddingTransport {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let url = format!("{}/embeddings", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| EmbeddingError::Transient(err.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(EmbeddingError::Auth);
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(EmbeddingError::RateLimited);
        }
        if status.is_server_error() {
            return Err(EmbeddingError::Transient(format!("status {status}")));
        }
        if !status.is_success() {
            return Err(EmbeddingError::Fatal(format!("status {status}")));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|err| EmbeddingError::Fatal(err.to_string()))?;

        let mut out = vec![Vec::new(); texts.len()];
        for item in parsed.data {
            if item.index >= out.len() {
                return Err(EmbeddingError::Fatal("response index out of range".to_string()));
            }
            out[item.index] = item.embedding;
        }
        Ok(out)
    }

    fn dims(&self) -> usize {
        self.dims
    }
}

/// The Embedding Gateway: ordered batch embedding with a batch size cap,
/// bounded exponential backoff with jitter for retriable failures,
/// split-and-retry halving to isolate poisonous inputs, and a semaphore
/// bounding concurrent calls to the provider.
pub struct EmbeddingGateway {
    transport: Arc<dyn EmbeddingTransport>,
    batch_size: usize,
    max_retries: usize,
    semaphore: Arc<Semaphore>,
}

impl EmbeddingGateway {
    pub fn new(
        transport: Arc<dyn EmbeddingTransport>,
        batch_size: usize,
        max_retries: usize,
        max_concurrency: usize,
    ) -> Self {
        Self {
            transport,
            batch_size: batch_size.max(1),
            max_retries,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Gateway over the deterministic transport with default limits.
    pub fn deterministic(dims: usize) -> Self {
        Self::new(Arc::new(DeterministicEmbedder::new(dims)), 100, 3, 8)
    }

    pub fn dims(&self) -> usize {
        self.transport.dims()
    }

    /// Embed an ordered sequence of texts. The output has the same length
    /// and ordering as the input.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let started = Instant::now();
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self.embed_with_split(batch).await?;
            out.extend(vectors);
        }

        if out.len() != texts.len() {
            return Err(EmbeddingError::Fatal(format!(
                "embedding count mismatch: {} texts, {} vectors",
                texts.len(),
                out.len()
            )));
        }

        tracing::debug!(
            texts = texts.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "embedding batch complete"
        );
        Ok(out)
    }

    pub async fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| EmbeddingError::Fatal("empty embedding response".to_string()))
    }

    async fn embed_once(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| EmbeddingError::Fatal("gateway closed".to_string()))?;

        let strategy = ExponentialBackoff::from_millis(2)
            .factor(100)
            .max_delay(Duration::from_secs(10))
            .map(jitter)
            .take(self.max_retries);

        RetryIf::spawn(
            strategy,
            || self.transport.embed(batch),
            |err: &EmbeddingError| err.is_retriable(),
        )
        .await
    }

    /// On batch failure, halve and retry each side independently so a single
    /// poisonous input fails alone rather than sinking its whole batch.
    fn embed_with_split<'a>(
        &'a self,
        batch: &'a [String],
    ) -> BoxFuture<'a, Result<Vec<Vec<f32>>, EmbeddingError>> {
        Box::pin(async move {
            match self.embed_once(batch).await {
                Ok(vectors) => Ok(vectors),
                Err(EmbeddingError::Auth) => Err(EmbeddingError::Auth),
                Err(err) if batch.len() <= 1 => Err(err),
                Err(err) => {
                    tracing::warn!(
                        batch = batch.len(),
                        error = %err,
                        "embedding batch failed, splitting"
                    );
                    let mid = batch.len() / 2;
                    let mut left = self.embed_with_split(&batch[..mid]).await?;
                    let right = self.embed_with_split(&batch[mid..]).await?;
                    left.extend(right);
                    Ok(left)
                }
            }
        })
    }
}
