use crate::queue::Job;
use crate::status::JobStatusStore;
use fisiorag_core::error::FisioError;
use ingestion::api::IngestionRequest;
use ingestion::processor::IngestionPipeline;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Ingestion worker: consumes jobs from the channel with at-least-once
/// semantics. Transient failures are retried in place with exponential
/// delay; terminal failures finalize the job as FAILURE.
pub struct Worker {
    receiver: mpsc::Receiver<Job>,
    pipeline: Arc<IngestionPipeline>,
    statuses: Arc<JobStatusStore>,
    max_retries: u32,
    base_delay_ms: u64,
}

impl Worker {
    pub fn new(
        receiver: mpsc::Receiver<Job>,
        pipeline: Arc<IngestionPipeline>,
        statuses: Arc<JobStatusStore>,
    ) -> Self {
        Self {
            receiver,
            pipeline,
            statuses,
            max_retries: 5,
            base_delay_ms: 200,
        }
    }

    pub fn with_retry_policy(mut self, max_retries: u32, base_delay_ms: u64) -> Self {
        self.max_retries = max_retries;
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub async fn run(mut self) {
        info!("ingestion worker started");
        while let Some(job) = self.receiver.recv().await {
            match job {
                Job::IngestDocument { job_id, request } => {
                    self.process_ingestion(job_id, request).await;
                }
            }
        }
        info!("ingestion worker stopped");
    }

    async fn process_ingestion(&self, job_id: Uuid, request: IngestionRequest) {
        self.statuses.mark_pending(job_id);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.statuses.record_attempt(job_id);

            match self.pipeline.ingest(&request).await {
                Ok(report) => {
                    info!(%job_id, inserted = report.inserted, "ingestion job succeeded");
                    self.statuses.mark_success(job_id, report.inserted);
                    return;
                }
                Err(err) if err.is_transient() && attempt <= self.max_retries => {
                    let delay = self.base_delay_ms.saturating_mul(1 << (attempt - 1).min(16));
                    warn!(
                        %job_id,
                        attempt,
                        delay_ms = delay,
                        error = %err,
                        "transient ingestion failure, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(err) => {
                    error!(%job_id, attempt, error = %err, "ingestion job failed");
                    self.statuses.mark_failure(job_id, err.safe_message());
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{ChannelJobQueue, JobQueue};
    use crate::status::JobState;
    use fisiorag_core::telemetry::InMemoryEventSink;
    use ingestion::cache::ClassificationCache;
    use models::classifier::KeywordClassifier;
    use models::embedder::{EmbeddingError, EmbeddingGateway, EmbeddingTransport};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use storage::Repository;
    use tempfile::tempdir;

    const DIMS: usize = 32;

    fn request(text: &str) -> IngestionRequest {
        let mut metadata = HashMap::new();
        metadata.insert("document_name".to_string(), "doc.txt".to_string());
        IngestionRequest::text(text, metadata)
    }

    struct FlakyTransport {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait::async_trait]
    impl EmbeddingTransport for FlakyTransport {
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(EmbeddingError::Transient("connection reset".to_string()));
            }
            Ok(texts
                .iter()
                .map(|text| {
                    fisiorag_core::embedding::deterministic_embedding(text, "test", DIMS)
                })
                .collect())
        }

        fn dims(&self) -> usize {
            DIMS
        }
    }

    async fn spawn_worker(
        pipeline: Arc<IngestionPipeline>,
    ) -> (Arc<ChannelJobQueue>, Arc<JobStatusStore>) {
        let (tx, rx) = mpsc::channel(16);
        let statuses = Arc::new(JobStatusStore::new());
        let worker =
            Worker::new(rx, pipeline, statuses.clone()).with_retry_policy(5, 1);
        tokio::spawn(worker.run());
        (Arc::new(ChannelJobQueue::new(tx)), statuses)
    }

    async fn wait_for_terminal(statuses: &JobStatusStore, job_id: Uuid) -> JobState {
        for _ in 0..200 {
            if let Some(status) = statuses.get(job_id) {
                if status.state != JobState::Pending {
                    return status.state;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job did not reach a terminal state");
    }

    #[tokio::test]
    async fn worker_processes_job_to_success() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(
            Repository::open(dir.path().join("worker.wal"), DIMS)
                .await
                .unwrap(),
        );
        let pipeline = Arc::new(IngestionPipeline::new(repo));
        let (queue, statuses) = spawn_worker(pipeline).await;

        let req = request("La lombalgia acuta è un dolore localizzato al rachide lombare.");
        let job_id = IngestionPipeline::document_id_for(&req);
        queue
            .enqueue(Job::IngestDocument {
                job_id,
                request: req,
            })
            .await
            .unwrap();

        assert_eq!(wait_for_terminal(&statuses, job_id).await, JobState::Success);
        let status = statuses.get(job_id).unwrap();
        assert!(status.inserted >= 1);
        assert_eq!(status.attempts, 1);
    }

    #[tokio::test]
    async fn worker_retries_transient_failures_until_success() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(
            Repository::open(dir.path().join("retry.wal"), DIMS)
                .await
                .unwrap(),
        );
        // Gateway retries are disabled so the failure reaches the worker.
        let transport = Arc::new(FlakyTransport {
            calls: AtomicUsize::new(0),
            fail_first: 2,
        });
        let gateway = Arc::new(EmbeddingGateway::new(transport, 100, 0, 4));
        let pipeline = Arc::new(IngestionPipeline::with_components(
            repo,
            Arc::new(KeywordClassifier),
            Arc::new(ClassificationCache::in_memory(true, 3600)),
            gateway,
            Arc::new(InMemoryEventSink::default()),
        ));
        let (queue, statuses) = spawn_worker(pipeline).await;

        let req = request("Il trattamento riabilitativo prevede esercizi graduali.");
        let job_id = IngestionPipeline::document_id_for(&req);
        queue
            .enqueue(Job::IngestDocument {
                job_id,
                request: req,
            })
            .await
            .unwrap();

        assert_eq!(wait_for_terminal(&statuses, job_id).await, JobState::Success);
        assert!(statuses.get(job_id).unwrap().attempts >= 2);
    }

    #[tokio::test]
    async fn worker_finalizes_terminal_failure() {
        let dir = tempdir().unwrap();
        let repo = Arc::new(
            Repository::open(dir.path().join("fail.wal"), DIMS)
                .await
                .unwrap(),
        );
        let pipeline = Arc::new(IngestionPipeline::new(repo));
        let (queue, statuses) = spawn_worker(pipeline).await;

        let req = request("   ");
        let job_id = IngestionPipeline::document_id_for(&req);
        queue
            .enqueue(Job::IngestDocument {
                job_id,
                request: req,
            })
            .await
            .unwrap();

        assert_eq!(wait_for_terminal(&statuses, job_id).await, JobState::Failure);
        let status = statuses.get(job_id).unwrap();
        assert_eq!(status.attempts, 1, "terminal failures are not retried");
        assert!(status.error.is_some());
    }
}
