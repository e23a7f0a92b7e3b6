use std::collections::HashMap;
use std::sync::Arc;

use fisiorag_core::model::DocumentStatus;
use fisiorag_core::telemetry::{events, InMemoryEventSink};
use ingestion::api::{BinaryAttachment, IngestionRequest};
use ingestion::cache::ClassificationCache;
use ingestion::processor::{IngestionError, IngestionPipeline};
use models::classifier::KeywordClassifier;
use models::embedder::{EmbeddingError, EmbeddingGateway, EmbeddingTransport};
use storage::Repository;
use tempfile::tempdir;

const DIMS: usize = 1536;

fn sample_document_text() -> String {
    "La radicolopatia lombare è una sindrome dolorosa causata dalla compressione \
     o dall'irritazione di una radice nervosa spinale a livello lombare. \
     Il quadro clinico comprende dolore irradiato lungo il territorio di \
     distribuzione della radice interessata, parestesie, ipoestesia e nei casi \
     più severi deficit di forza. Il trattamento conservativo rappresenta la \
     prima scelta terapeutica e comprende educazione del paziente, esercizio \
     terapeutico graduale, mobilizzazioni neurodinamiche e terapia manuale. \
     La revisione della letteratura suggerisce che la maggior parte dei casi \
     si risolve entro dodici settimane con un approccio conservativo ben \
     condotto. L'imaging è indicato solo in presenza di segni di allarme o di \
     deficit neurologici progressivi. La chirurgia viene riservata ai casi con \
     dolore intrattabile o deficit motori ingravescenti, dopo il fallimento di \
     un percorso conservativo adeguato per durata e intensità. Il follow-up \
     prevede la rivalutazione periodica della sintomatologia e della funzione."
        .to_string()
}

fn request_with_name(text: &str, name: &str) -> IngestionRequest {
    let mut metadata = HashMap::new();
    metadata.insert("document_name".to_string(), name.to_string());
    IngestionRequest::text(text, metadata)
}

#[tokio::test]
async fn ingest_happy_path_completes_document_with_embedded_chunks() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(
        Repository::open(dir.path().join("ingest.wal"), DIMS)
            .await
            .unwrap(),
    );
    let pipeline = IngestionPipeline::new(repo.clone());

    let request = request_with_name(&sample_document_text(), "radic.docx");
    let report = pipeline.ingest(&request).await.unwrap();

    assert!(report.inserted >= 1);

    let document = repo.document(report.document_id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Completed);
    assert_eq!(document.file_name, "radic.docx");

    let chunks = repo.chunks_for_document(report.document_id).await;
    assert_eq!(chunks.len(), report.inserted);
    for chunk in &chunks {
        let embedding = chunk.embedding.as_ref().expect("chunk must be embedded");
        assert_eq!(embedding.len(), DIMS);
        assert_eq!(chunk.document_id, report.document_id);
    }
}

#[tokio::test]
async fn reingest_same_bytes_is_idempotent() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(
        Repository::open(dir.path().join("reingest.wal"), DIMS)
            .await
            .unwrap(),
    );
    let pipeline = IngestionPipeline::new(repo.clone());

    let request = request_with_name(&sample_document_text(), "radic.docx");

    let first = pipeline.ingest(&request).await.unwrap();
    let first_doc = repo.document(first.document_id).await.unwrap();

    let second = pipeline.ingest(&request).await.unwrap();
    let second_doc = repo.document(second.document_id).await.unwrap();

    assert_eq!(first.document_id, second.document_id);
    assert_eq!(first.inserted, second.inserted);
    assert_eq!(
        repo.chunk_count(first.document_id).await,
        first.inserted,
        "no duplicate chunks on re-ingest"
    );
    assert!(second_doc.updated_at_ms > first_doc.updated_at_ms);
    assert_eq!(second_doc.status, DocumentStatus::Completed);
}

#[tokio::test]
async fn classification_cache_hits_on_reingest() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(
        Repository::open(dir.path().join("cache.wal"), DIMS)
            .await
            .unwrap(),
    );
    let sink = Arc::new(InMemoryEventSink::default());
    let cache = Arc::new(ClassificationCache::in_memory(true, 3600));
    let pipeline = IngestionPipeline::with_components(
        repo,
        Arc::new(KeywordClassifier),
        cache.clone(),
        Arc::new(EmbeddingGateway::deterministic(DIMS)),
        sink,
    );

    let request = request_with_name(&sample_document_text(), "radic.docx");
    pipeline.ingest(&request).await.unwrap();
    pipeline.ingest(&request).await.unwrap();

    let metrics = cache.metrics();
    assert!(metrics.hits >= 1, "second ingest must hit the cache");
    assert_eq!(metrics.errors, 0);
}

#[tokio::test]
async fn empty_document_marks_row_as_error() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(
        Repository::open(dir.path().join("empty.wal"), DIMS)
            .await
            .unwrap(),
    );
    let pipeline = IngestionPipeline::new(repo.clone());

    let request = request_with_name("   \n  ", "vuoto.docx");
    let document_id = IngestionPipeline::document_id_for(&request);

    let err = pipeline.ingest(&request).await.unwrap_err();
    assert!(matches!(err, IngestionError::Chunking(_)));
    assert!(!err.is_transient());

    let document = repo.document(document_id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Error);
    assert!(document.metadata.contains_key("error"));
}

#[tokio::test]
async fn extraction_failure_falls_back_to_provided_text() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(
        Repository::open(dir.path().join("fallback.wal"), DIMS)
            .await
            .unwrap(),
    );
    let sink = Arc::new(InMemoryEventSink::default());
    let pipeline = IngestionPipeline::with_components(
        repo.clone(),
        Arc::new(KeywordClassifier),
        Arc::new(ClassificationCache::in_memory(true, 3600)),
        Arc::new(EmbeddingGateway::deterministic(DIMS)),
        sink.clone(),
    );

    let mut request = request_with_name(&sample_document_text(), "scan.docx");
    request.binary = Some(BinaryAttachment {
        filename: "scan.docx".to_string(),
        content: vec![0xff, 0xfe, 0x00, 0x01],
        mime_type: "application/octet-stream".to_string(),
    });

    let report = pipeline.ingest(&request).await.unwrap();
    assert!(report.inserted >= 1);

    let fallbacks = sink
        .events_named(events::EXTRACTION_FAILED_FALLBACK)
        .unwrap();
    assert_eq!(fallbacks.len(), 1);

    let document = repo.document(report.document_id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Completed);
}

struct AuthFailTransport;

#[async_trait::async_trait]
impl EmbeddingTransport for AuthFailTransport {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Auth)
    }

    fn dims(&self) -> usize {
        DIMS
    }
}

#[tokio::test]
async fn embedding_auth_failure_is_terminal() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(
        Repository::open(dir.path().join("auth.wal"), DIMS)
            .await
            .unwrap(),
    );
    let gateway = Arc::new(EmbeddingGateway::new(Arc::new(AuthFailTransport), 100, 3, 4));
    let pipeline = IngestionPipeline::with_components(
        repo.clone(),
        Arc::new(KeywordClassifier),
        Arc::new(ClassificationCache::in_memory(true, 3600)),
        gateway,
        Arc::new(InMemoryEventSink::default()),
    );

    let request = request_with_name(&sample_document_text(), "radic.docx");
    let document_id = IngestionPipeline::document_id_for(&request);

    let err = pipeline.ingest(&request).await.unwrap_err();
    assert!(matches!(err, IngestionError::Embedding(EmbeddingError::Auth)));
    assert!(!err.is_transient());

    let document = repo.document(document_id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Error);
    assert_eq!(repo.chunk_count(document_id).await, 0);
}

struct TransientTransport;

#[async_trait::async_trait]
impl EmbeddingTransport for TransientTransport {
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::Transient("connection reset".to_string()))
    }

    fn dims(&self) -> usize {
        DIMS
    }
}

#[tokio::test]
async fn transient_embedding_failure_leaves_document_processing() {
    let dir = tempdir().unwrap();
    let repo = Arc::new(
        Repository::open(dir.path().join("transient.wal"), DIMS)
            .await
            .unwrap(),
    );
    let gateway = Arc::new(EmbeddingGateway::new(Arc::new(TransientTransport), 100, 0, 4));
    let pipeline = IngestionPipeline::with_components(
        repo.clone(),
        Arc::new(KeywordClassifier),
        Arc::new(ClassificationCache::in_memory(true, 3600)),
        gateway,
        Arc::new(InMemoryEventSink::default()),
    );

    let request = request_with_name(&sample_document_text(), "radic.docx");
    let document_id = IngestionPipeline::document_id_for(&request);

    let err = pipeline.ingest(&request).await.unwrap_err();
    assert!(err.is_transient());

    // Transient failure: the row stays in processing so a redelivered job
    // can resume where it left off.
    let document = repo.document(document_id).await.unwrap();
    assert_eq!(document.status, DocumentStatus::Processing);
}
