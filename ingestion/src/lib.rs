pub mod api;
pub mod cache;
pub mod chunker;
pub mod extract;
pub mod processor;

pub use api::{IngestionRequest, MultipartJobPayload, PayloadError, SyncJobPayload};
pub use cache::{classification_digest, CacheMetrics, ClassificationCache};
pub use processor::{IngestionError, IngestionPipeline, IngestionReport};
