use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fisiorag_core::config::AppConfig;
use fisiorag_core::model::{
    chunk_id_for_sequence, sha256_hex, DocumentStatus, Vote,
};
use fisiorag_core::telemetry::InMemoryEventSink;
use fisiorag_sdk::{FisioRag, ServiceError};
use ingestion::api::SyncJobPayload;
use jobs::status::JobState;
use models::chat::MockChatModel;
use tempfile::tempdir;
use uuid::Uuid;

const DOC_TEXT: &str =
    "La radicolopatia lombare è una sindrome da compressione della radice nervosa.";

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.embedding.embedding_model_dim = 32;
    config.retrieval.enable_cross_encoder_reranking = true;
    config.retrieval.enable_dynamic_match_count = true;
    config.retrieval.enable_chunk_diversification = true;
    config.ingestion.retry_base_delay_ms = 1;
    config
}

async fn service_with_chat(
    dir: &tempfile::TempDir,
    config: AppConfig,
    chat: Arc<MockChatModel>,
) -> FisioRag {
    let sink = Arc::new(InMemoryEventSink::default());
    let (service, worker) = FisioRag::offline(
        config,
        dir.path().join("service.wal"),
        chat,
        sink,
    )
    .await
    .unwrap();
    tokio::spawn(worker.run());
    service
}

fn payload(text: &str, name: &str) -> SyncJobPayload {
    let mut metadata = HashMap::new();
    metadata.insert("document_name".to_string(), name.to_string());
    SyncJobPayload {
        document_text: text.to_string(),
        metadata,
    }
}

async fn wait_for_terminal(service: &FisioRag, job_id: Uuid) -> JobState {
    for _ in 0..300 {
        if let Ok(status) = service.sync_job_status(job_id) {
            if status.status != JobState::Pending {
                return status.status;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job did not reach a terminal state");
}

#[tokio::test]
async fn ingest_then_query_happy_path() {
    let dir = tempdir().unwrap();
    let chunk_id = chunk_id_for_sequence(&sha256_hex(DOC_TEXT.as_bytes()), 0);
    let chat = Arc::new(MockChatModel::new());
    chat.push_ok(&format!(
        r#"{{"answer_text": "È una sindrome da compressione radicolare [1].",
            "citations": [{{"chunk_id": "{chunk_id}", "position": 1}}]}}"#,
    ));
    let service = service_with_chat(&dir, test_config(), chat).await;

    let submitted = service
        .submit_sync_job(payload(DOC_TEXT, "radic.docx"))
        .await
        .unwrap();
    assert_eq!(submitted.inserted, 0, "async submission reports zero rows");

    assert_eq!(
        wait_for_terminal(&service, submitted.job_id).await,
        JobState::Success
    );
    let status = service.sync_job_status(submitted.job_id).unwrap();
    assert!(status.inserted >= 1);

    let document = service
        .repository()
        .document(submitted.job_id)
        .await
        .unwrap();
    assert_eq!(document.status, DocumentStatus::Completed);

    let turn = service
        .post_message("sessione-1", DOC_TEXT, None)
        .await
        .unwrap();
    assert!(!turn.citations.is_empty());
    assert_eq!(turn.citations[0].document_id, submitted.job_id);

    let history = service.session_history("sessione-1", 10, 0).await;
    assert_eq!(history.total_count, 2);
    assert!(!history.has_more);
}

#[tokio::test]
async fn reingest_same_content_is_idempotent() {
    let dir = tempdir().unwrap();
    let service = service_with_chat(&dir, test_config(), Arc::new(MockChatModel::new())).await;

    let first = service
        .submit_sync_job(payload(DOC_TEXT, "radic.docx"))
        .await
        .unwrap();
    assert_eq!(wait_for_terminal(&service, first.job_id).await, JobState::Success);
    let doc_before = service.repository().document(first.job_id).await.unwrap();
    let count_before = service.repository().chunk_count(first.job_id).await;

    let second = service
        .submit_sync_job(payload(DOC_TEXT, "radic.docx"))
        .await
        .unwrap();
    assert_eq!(second.job_id, first.job_id, "same bytes resolve to one document");
    assert_eq!(wait_for_terminal(&service, second.job_id).await, JobState::Success);

    let doc_after = service.repository().document(first.job_id).await.unwrap();
    assert_eq!(
        service.repository().chunk_count(first.job_id).await,
        count_before,
        "no duplicate chunks"
    );
    assert!(doc_after.updated_at_ms > doc_before.updated_at_ms);
    assert_eq!(doc_after.status, DocumentStatus::Completed);
}

#[tokio::test]
async fn empty_submission_is_rejected_synchronously() {
    let dir = tempdir().unwrap();
    let service = service_with_chat(&dir, test_config(), Arc::new(MockChatModel::new())).await;

    let err = service
        .submit_sync_job(payload("   ", "vuoto.docx"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::IngestionRejected(_)));
}

#[tokio::test]
async fn unknown_job_id_is_not_found() {
    let dir = tempdir().unwrap();
    let service = service_with_chat(&dir, test_config(), Arc::new(MockChatModel::new())).await;

    let err = service.sync_job_status(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn chat_is_rate_limited_per_session() {
    let dir = tempdir().unwrap();
    let mut config = test_config();
    config.generation.session_rate_limit_per_minute = 2;

    let chat = Arc::new(MockChatModel::with_responses(vec![
        r#"{"answer_text": "prima", "citations": []}"#,
        r#"{"answer_text": "seconda", "citations": []}"#,
    ]));
    let service = service_with_chat(&dir, config, chat).await;

    service
        .post_message("sessione-1", "prima domanda", None)
        .await
        .unwrap();
    service
        .post_message("sessione-1", "seconda domanda", None)
        .await
        .unwrap();

    let err = service
        .post_message("sessione-1", "terza domanda", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::SessionRateLimited));
}

#[tokio::test]
async fn repeated_post_message_with_same_key_replays_first_response() {
    let dir = tempdir().unwrap();
    // One scripted response: a second model call would exhaust the script
    // and fail, so a successful retry proves the turn was replayed.
    let chat = Arc::new(MockChatModel::with_responses(vec![
        r#"{"answer_text": "prima risposta", "citations": []}"#,
    ]));
    let service = service_with_chat(&dir, test_config(), chat).await;

    let first = service
        .post_message("sessione-1", "Cos'è la radicolopatia?", Some("turno-1"))
        .await
        .unwrap();
    let second = service
        .post_message("sessione-1", "Cos'è la radicolopatia?", Some("turno-1"))
        .await
        .unwrap();

    assert_eq!(second.message_id, first.message_id);
    assert_eq!(second.content, first.content);
    assert_eq!(second.citations, first.citations);

    // Exactly one user/assistant pair was persisted across both calls.
    let history = service.session_history("sessione-1", 10, 0).await;
    assert_eq!(history.total_count, 2);

    // A different key is a genuinely new turn and reaches the model again,
    // which the exhausted script turns into an error.
    let err = service
        .post_message("sessione-1", "Cos'è la radicolopatia?", Some("turno-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Unavailable(_)));
}

#[tokio::test]
async fn unknown_session_history_is_empty() {
    let dir = tempdir().unwrap();
    let service = service_with_chat(&dir, test_config(), Arc::new(MockChatModel::new())).await;

    let history = service.session_history("mai-vista", 20, 0).await;
    assert!(history.messages.is_empty());
    assert_eq!(history.total_count, 0);
    assert!(!history.has_more);
}

#[tokio::test]
async fn feedback_upserts_on_session_and_message() {
    let dir = tempdir().unwrap();
    let chat = Arc::new(MockChatModel::with_responses(vec![
        r#"{"answer_text": "risposta", "citations": []}"#,
    ]));
    let service = service_with_chat(&dir, test_config(), chat).await;

    let turn = service
        .post_message("sessione-1", "domanda qualunque", None)
        .await
        .unwrap();

    let first = service
        .post_feedback(turn.message_id, "sessione-1", Vote::Up)
        .await
        .unwrap();
    assert!(first.ok);

    let second = service
        .post_feedback(turn.message_id, "sessione-1", Vote::Down)
        .await
        .unwrap();
    assert!(second.ok);

    let stored = service
        .repository()
        .feedback_for("sessione-1", turn.message_id)
        .await
        .unwrap();
    assert_eq!(stored.vote, Vote::Down);

    let err = service
        .post_feedback(Uuid::new_v4(), "sessione-1", Vote::Up)
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn cache_admin_surface_reports_and_clears() {
    let dir = tempdir().unwrap();
    let service = service_with_chat(&dir, test_config(), Arc::new(MockChatModel::new())).await;

    let submitted = service
        .submit_sync_job(payload(DOC_TEXT, "radic.docx"))
        .await
        .unwrap();
    wait_for_terminal(&service, submitted.job_id).await;

    let metrics = service.cache_metrics();
    assert!(metrics.size >= 1, "classification result must be cached");

    let cleared = service.cache_invalidate_all().unwrap();
    assert!(cleared >= 1);
    assert_eq!(service.cache_metrics().size, 0);
}
