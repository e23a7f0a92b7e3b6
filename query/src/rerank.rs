use fisiorag_core::telemetry::LatencyWindow;
use models::cross_encoder::{CrossEncoder, CrossEncoderProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{OnceCell, Semaphore};

const RERANK_BATCH_SIZE: usize = 16;
const BREAKER_MIN_SAMPLES: usize = 5;

/// Why re-ranking was skipped for a request. Every variant degrades to the
/// similarity ordering rather than failing the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerankBypass {
    LoadInProgress,
    LoadFailed(String),
    Inference(String),
    BreakerOpen,
}

impl RerankBypass {
    pub fn reason(&self) -> &'static str {
        match self {
            RerankBypass::LoadInProgress => "model_loading",
            RerankBypass::LoadFailed(_) => "model_load_failed",
            RerankBypass::Inference(_) => "inference_failed",
            RerankBypass::BreakerOpen => "breaker_open",
        }
    }
}

/// Trips when the rolling p95 of end-to-end retrieval latency exceeds the
/// threshold; re-ranking stays off until the cool-down expires.
pub struct CircuitBreaker {
    latency: LatencyWindow,
    threshold_ms: u64,
    cooldown: Duration,
    open_until: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(threshold_ms: u64, cooldown: Duration, window: usize) -> Self {
        Self {
            latency: LatencyWindow::new(window),
            threshold_ms,
            cooldown,
            open_until: Mutex::new(None),
        }
    }

    pub fn record_latency(&self, latency_ms: u64) {
        self.latency.record(latency_ms);
        if self.latency.window_len() >= BREAKER_MIN_SAMPLES && self.latency.p95() > self.threshold_ms
        {
            let mut open_until = self.open_until.lock().unwrap();
            if open_until.is_none() {
                tracing::warn!(
                    p95_ms = self.latency.p95(),
                    threshold_ms = self.threshold_ms,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "retrieval latency breaker opened, re-ranking disabled"
                );
            }
            *open_until = Some(Instant::now() + self.cooldown);
        }
    }

    pub fn is_open(&self) -> bool {
        let mut open_until = self.open_until.lock().unwrap();
        match *open_until {
            Some(deadline) if Instant::now() < deadline => true,
            Some(_) => {
                *open_until = None;
                false
            }
            None => false,
        }
    }

    pub fn p95(&self) -> u64 {
        self.latency.p95()
    }
}

/// Cross-encoder wrapper owning lazy load, batching, the concurrency cap
/// and the latency breaker. The first request pays the model load; while it
/// is in flight every other request bypasses instead of queueing behind it.
pub struct Reranker {
    provider: Arc<dyn CrossEncoderProvider>,
    encoder: OnceCell<Arc<dyn CrossEncoder>>,
    loading: AtomicBool,
    breaker: CircuitBreaker,
    semaphore: Semaphore,
}

impl Reranker {
    pub fn new(
        provider: Arc<dyn CrossEncoderProvider>,
        breaker_threshold_ms: u64,
        breaker_cooldown: Duration,
        max_concurrency: usize,
    ) -> Self {
        Self {
            provider,
            encoder: OnceCell::new(),
            loading: AtomicBool::new(false),
            breaker: CircuitBreaker::new(breaker_threshold_ms, breaker_cooldown, 100),
            semaphore: Semaphore::new(max_concurrency.max(1)),
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Called by the retrieval engine with the request's end-to-end latency.
    pub fn record_latency(&self, latency_ms: u64) {
        self.breaker.record_latency(latency_ms);
    }

    /// Score (query, passage) pairs. Returns one score per passage, in
    /// input order.
    pub async fn score(&self, query: &str, passages: &[String]) -> Result<Vec<f32>, RerankBypass> {
        if self.breaker.is_open() {
            return Err(RerankBypass::BreakerOpen);
        }

        let encoder = self.encoder_or_bypass().await?;

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| RerankBypass::Inference("reranker closed".to_string()))?;

        let mut scores = Vec::with_capacity(passages.len());
        for batch in passages.chunks(RERANK_BATCH_SIZE) {
            let pairs: Vec<(String, String)> = batch
                .iter()
                .map(|passage| (query.to_string(), passage.clone()))
                .collect();
            let batch_scores = encoder
                .predict(&pairs)
                .await
                .map_err(|err| RerankBypass::Inference(err.to_string()))?;
            if batch_scores.len() != pairs.len() {
                return Err(RerankBypass::Inference(format!(
                    "expected {} scores, got {}",
                    pairs.len(),
                    batch_scores.len()
                )));
            }
            scores.extend(batch_scores);
        }
        Ok(scores)
    }

    async fn encoder_or_bypass(&self) -> Result<Arc<dyn CrossEncoder>, RerankBypass> {
        if let Some(encoder) = self.encoder.get() {
            return Ok(encoder.clone());
        }

        // Only one request performs the load; concurrent requests degrade
        // to similarity ordering instead of stalling behind it.
        if self.loading.swap(true, Ordering::SeqCst) {
            return Err(RerankBypass::LoadInProgress);
        }

        let result = self.provider.load().await;
        self.loading.store(false, Ordering::SeqCst);

        match result {
            Ok(encoder) => {
                let _ = self.encoder.set(encoder.clone());
                Ok(encoder)
            }
            Err(err) => Err(RerankBypass::LoadFailed(err.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use models::cross_encoder::{
        FailingCrossEncoder, FailingCrossEncoderProvider, LexicalCrossEncoder,
        StaticCrossEncoderProvider,
    };

    fn passages() -> Vec<String> {
        vec![
            "trattamento conservativo della radicolopatia".to_string(),
            "anatomia del ginocchio".to_string(),
        ]
    }

    #[tokio::test]
    async fn scores_in_input_order() {
        let reranker = Reranker::new(
            Arc::new(StaticCrossEncoderProvider::new(Arc::new(LexicalCrossEncoder))),
            2000,
            Duration::from_secs(60),
            4,
        );

        let scores = reranker
            .score("trattamento radicolopatia", &passages())
            .await
            .unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[0] > scores[1]);
    }

    #[tokio::test]
    async fn load_failure_bypasses() {
        let reranker = Reranker::new(
            Arc::new(FailingCrossEncoderProvider),
            2000,
            Duration::from_secs(60),
            4,
        );

        let err = reranker.score("q", &passages()).await.unwrap_err();
        assert!(matches!(err, RerankBypass::LoadFailed(_)));
        // A later request may retry the load rather than staying broken.
        let err = reranker.score("q", &passages()).await.unwrap_err();
        assert!(matches!(err, RerankBypass::LoadFailed(_)));
    }

    #[tokio::test]
    async fn inference_failure_bypasses() {
        let reranker = Reranker::new(
            Arc::new(StaticCrossEncoderProvider::new(Arc::new(FailingCrossEncoder))),
            2000,
            Duration::from_secs(60),
            4,
        );

        let err = reranker.score("q", &passages()).await.unwrap_err();
        assert!(matches!(err, RerankBypass::Inference(_)));
    }

    #[tokio::test]
    async fn breaker_opens_on_slow_p95_and_recovers() {
        let reranker = Reranker::new(
            Arc::new(StaticCrossEncoderProvider::new(Arc::new(LexicalCrossEncoder))),
            100,
            Duration::from_millis(50),
            4,
        );

        for _ in 0..BREAKER_MIN_SAMPLES {
            reranker.record_latency(500);
        }
        let err = reranker.score("q", &passages()).await.unwrap_err();
        assert_eq!(err, RerankBypass::BreakerOpen);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(reranker.score("q", &passages()).await.is_ok());
    }
}
