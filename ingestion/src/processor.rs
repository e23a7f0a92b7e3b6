use crate::api::IngestionRequest;
use crate::cache::{classification_digest, ClassificationCache};
use crate::chunker::{ChunkRouter, ChunkingError};
use crate::extract::{
    detect_content_kind, extract_pdf_text, extract_utf8, structural_hints, ContentKind,
};
use fisiorag_core::error::{ErrorCode, FisioError};
use fisiorag_core::model::{
    sha256_hex, Classification, Document, DocumentStatus, DocumentStructure, FALLBACK_DOMAIN,
};
use fisiorag_core::telemetry::{events, Event, EventOutcome, EventSink, TracingEventSink};
use models::classifier::{DocumentClassifier, KeywordClassifier, StructuralHints};
use models::embedder::{EmbeddingError, EmbeddingGateway};
use models::CLASSIFIER_VERSION;
use std::sync::Arc;
use std::time::Duration;
use storage::{Repository, StoreError};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("chunking failed: {0}")]
    Chunking(#[from] ChunkingError),
    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
    #[error("storage failed: {0}")]
    Store(#[from] StoreError),
}

impl IngestionError {
    /// Transient failures are retried by the worker; everything else marks
    /// the document as errored.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestionError::Embedding(err) => err.is_retriable(),
            IngestionError::Chunking(ChunkingError::Embedding(err)) => err.is_retriable(),
            IngestionError::Store(StoreError::Wal(_)) => true,
            _ => false,
        }
    }
}

impl FisioError for IngestionError {
    fn error_code(&self) -> ErrorCode {
        match self {
            IngestionError::Chunking(_) => ErrorCode::FailedPrecondition,
            IngestionError::Embedding(err) => err.error_code(),
            IngestionError::Store(err) => err.error_code(),
        }
    }

    fn safe_message(&self) -> String {
        match self {
            IngestionError::Chunking(ChunkingError::Empty) => {
                "document produced no indexable content".to_string()
            }
            IngestionError::Chunking(_) => "document chunking failed".to_string(),
            IngestionError::Embedding(err) => err.safe_message(),
            IngestionError::Store(_) => "document persistence failed".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestionReport {
    pub document_id: Uuid,
    pub inserted: usize,
}

/// The ingestion orchestrator: extract → persist row → classify (cached) →
/// chunk → embed → persist chunks → finalize, with the documented
/// transient/terminal split.
pub struct IngestionPipeline {
    repo: Arc<Repository>,
    classifier: Arc<dyn DocumentClassifier>,
    cache: Arc<ClassificationCache>,
    gateway: Arc<EmbeddingGateway>,
    router: ChunkRouter,
    sink: Arc<dyn EventSink>,
    confidence_floor: f32,
    cache_ttl_seconds: u64,
    stage_deadline_ms: u64,
}

impl IngestionPipeline {
    /// Pipeline with offline defaults: deterministic embedder, keyword
    /// classifier, enabled in-memory cache.
    pub fn new(repo: Arc<Repository>) -> Self {
        let gateway = Arc::new(EmbeddingGateway::deterministic(repo.embedding_dims()));
        Self::with_components(
            repo,
            Arc::new(KeywordClassifier),
            Arc::new(ClassificationCache::in_memory(true, 604_800)),
            gateway,
            Arc::new(TracingEventSink::default()),
        )
    }

    pub fn with_components(
        repo: Arc<Repository>,
        classifier: Arc<dyn DocumentClassifier>,
        cache: Arc<ClassificationCache>,
        gateway: Arc<EmbeddingGateway>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let router = ChunkRouter::new(gateway.clone());
        Self {
            repo,
            classifier,
            cache,
            gateway,
            router,
            sink,
            confidence_floor: 0.7,
            cache_ttl_seconds: 604_800,
            stage_deadline_ms: 30_000,
        }
    }

    pub fn with_confidence_floor(mut self, floor: f32) -> Self {
        self.confidence_floor = floor;
        self
    }

    pub fn with_cache_ttl_seconds(mut self, ttl: u64) -> Self {
        self.cache_ttl_seconds = ttl.max(1);
        self
    }

    pub fn with_stage_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.stage_deadline_ms = deadline_ms.max(1);
        self
    }

    pub fn cache(&self) -> &ClassificationCache {
        &self.cache
    }

    /// The document id a request will resolve to, without side effects.
    /// Used by the submission surface so job_id equals the Document UUID.
    pub fn document_id_for(request: &IngestionRequest) -> Uuid {
        fisiorag_core::model::document_id_for_hash(&file_hash_for(request))
    }

    /// Run the full pipeline for one request. Terminal failures mark the
    /// document row as errored; transient ones leave it in `processing` so
    /// a redelivered job can resume.
    pub async fn ingest(&self, request: &IngestionRequest) -> Result<IngestionReport, IngestionError> {
        let (text, hints) = self.extract_stage(request);

        let file_hash = file_hash_for(request);
        let document = Document::new(
            request.document_name(),
            request
                .metadata
                .get("file_path")
                .cloned()
                .unwrap_or_else(|| format!("uploads/{}", request.document_name())),
            file_hash,
            fisiorag_core::model::ChunkingStrategy::recursive_default(),
            request.metadata.clone(),
        );
        let document = self.repo.upsert_document(document).await?;
        let document_id = document.id;

        match self.ingest_inner(&text, hints, document).await {
            Ok(report) => {
                tracing::info!(document_id = %report.document_id, inserted = report.inserted, "ingestion completed");
                let _ = self.sink.record(
                    Event::new(events::INGESTION_COMPLETED, EventOutcome::Succeeded)
                        .with_field("document_id", report.document_id.to_string())
                        .with_field("inserted", report.inserted.to_string()),
                );
                Ok(report)
            }
            Err(err) => {
                if !err.is_transient() {
                    let _ = self
                        .repo
                        .set_document_status(
                            document_id,
                            DocumentStatus::Error,
                            Some(err.safe_message()),
                        )
                        .await;
                }
                tracing::error!(document_id = %document_id, error = %err, "ingestion failed");
                let _ = self.sink.record(
                    Event::new(events::INGESTION_FAILED, EventOutcome::Failed)
                        .with_field("document_id", document_id.to_string())
                        .with_field("transient", err.is_transient().to_string())
                        .with_field("error", err.safe_message()),
                );
                Err(err)
            }
        }
    }

    async fn ingest_inner(
        &self,
        text: &str,
        hints: StructuralHints,
        document: Document,
    ) -> Result<IngestionReport, IngestionError> {
        let classification = self.classify_stage(text, hints).await;

        // Record the routing decision on the document row before chunking so
        // the persisted strategy always matches the chunks' tags.
        let strategy = ChunkRouter::route(&classification);
        let mut updated = document.clone();
        updated.chunking_strategy = strategy;
        updated
            .metadata
            .insert("domain".to_string(), classification.domain.clone());
        updated.metadata.insert(
            "classification_confidence".to_string(),
            format!("{:.2}", classification.confidence),
        );
        let document = self.repo.upsert_document(updated).await?;

        let mut chunks = self.router.chunk_document(text, &document).await?;

        let texts: Vec<String> = chunks.iter().map(|chunk| chunk.content.clone()).collect();
        // A stalled provider raises transient, which the worker retries.
        let embeddings = tokio::time::timeout(
            Duration::from_millis(self.stage_deadline_ms),
            self.gateway.embed_batch(&texts),
        )
        .await
        .map_err(|_| {
            IngestionError::Embedding(EmbeddingError::Transient(
                "embedding stage deadline exceeded".to_string(),
            ))
        })??;
        if embeddings.len() != chunks.len() {
            return Err(IngestionError::Embedding(EmbeddingError::Fatal(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                embeddings.len()
            ))));
        }
        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk.embedding = Some(embedding);
        }

        let expected = chunks.len();
        let inserted = self.repo.insert_chunks(document.id, chunks).await?;
        if inserted != expected {
            // insert_chunks already raises PartialInsert for every known
            // mismatch; this guards the contract itself.
            return Err(IngestionError::Store(StoreError::PartialInsert {
                missing_sequences: Vec::new(),
            }));
        }

        self.repo
            .set_document_status(document.id, DocumentStatus::Completed, None)
            .await?;

        Ok(IngestionReport {
            document_id: document.id,
            inserted,
        })
    }

    fn extract_stage(&self, request: &IngestionRequest) -> (String, StructuralHints) {
        let Some(binary) = &request.binary else {
            let hints = structural_hints(&request.document_text);
            return (request.document_text.clone(), hints);
        };

        let kind = detect_content_kind(&binary.mime_type, Some(&binary.filename));
        let extracted = match kind {
            ContentKind::Pdf => extract_pdf_text(&binary.content),
            ContentKind::Text | ContentKind::Markdown | ContentKind::Json => {
                extract_utf8(&binary.content).ok()
            }
            ContentKind::Unsupported => None,
        };

        match extracted {
            Some(text) if !text.trim().is_empty() => {
                let hints = structural_hints(&text);
                (text, hints)
            }
            _ => {
                tracing::warn!(
                    filename = %binary.filename,
                    mime_type = %binary.mime_type,
                    "extraction failed, falling back to provided text"
                );
                let _ = self.sink.record(
                    Event::new(events::EXTRACTION_FAILED_FALLBACK, EventOutcome::Degraded)
                        .with_field("filename", binary.filename.clone()),
                );
                let hints = structural_hints(&request.document_text);
                (request.document_text.clone(), hints)
            }
        }
    }

    async fn classify_stage(&self, text: &str, hints: StructuralHints) -> Classification {
        let digest = classification_digest(text, CLASSIFIER_VERSION);

        let mut classification = match self.cache.get(&digest).result {
            Some(cached) => cached,
            None => {
                let outcome = tokio::time::timeout(
                    Duration::from_millis(self.stage_deadline_ms),
                    self.classifier.classify(text, hints),
                )
                .await;
                match outcome {
                    Ok(Ok(result)) => {
                        self.cache.put(&digest, result.clone(), self.cache_ttl_seconds);
                        result
                    }
                    Ok(Err(err)) => {
                        // Classifier outage is recoverable: fall back to the
                        // generic tag and keep ingesting.
                        tracing::warn!(error = %err, "classifier unavailable, using fallback tag");
                        fallback_classification(hints)
                    }
                    Err(_) => {
                        tracing::warn!("classifier stage deadline exceeded, using fallback tag");
                        fallback_classification(hints)
                    }
                }
            }
        };

        if classification.confidence < self.confidence_floor {
            classification.domain = FALLBACK_DOMAIN.to_string();
        }
        classification
    }
}

fn fallback_classification(hints: StructuralHints) -> Classification {
    Classification {
        domain: FALLBACK_DOMAIN.to_string(),
        structure: if hints.has_tables {
            DocumentStructure::Mixed
        } else {
            DocumentStructure::Narrative
        },
        confidence: 0.0,
        version: CLASSIFIER_VERSION,
    }
}

fn file_hash_for(request: &IngestionRequest) -> String {
    match &request.binary {
        Some(binary) => sha256_hex(&binary.content),
        None => sha256_hex(request.document_text.as_bytes()),
    }
}
