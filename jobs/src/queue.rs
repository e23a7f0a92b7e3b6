use ingestion::api::IngestionRequest;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Job {
    IngestDocument {
        job_id: Uuid,
        request: IngestionRequest,
    },
}

impl Job {
    pub fn job_id(&self) -> Uuid {
        match self {
            Job::IngestDocument { job_id, .. } => *job_id,
        }
    }
}

#[async_trait::async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()>;
}

/// In-memory queue over a Tokio channel. A broker-backed queue implements
/// the same trait; redelivery semantics stay with the worker.
pub struct ChannelJobQueue {
    sender: mpsc::Sender<Job>,
}

impl ChannelJobQueue {
    pub fn new(sender: mpsc::Sender<Job>) -> Self {
        Self { sender }
    }
}

#[async_trait::async_trait]
impl JobQueue for ChannelJobQueue {
    async fn enqueue(&self, job: Job) -> anyhow::Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|e| anyhow::anyhow!("Queue send error: {}", e))
    }
}
