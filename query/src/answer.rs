use crate::memory::SessionMemory;
use crate::retrieval::{RetrievalEngine, RetrievedChunk};
use fisiorag_core::config::GenerationConfig;
use fisiorag_core::error::{ErrorCode, FisioError};
use fisiorag_core::flags::FeatureFlags;
use fisiorag_core::model::{message_idempotency_key, now_ms, ChatMessage, MessageRole};
use fisiorag_core::telemetry::{events, Event, EventOutcome, EventSink, LatencyWindow};
use models::chat::{ChatError, ChatModel, ChatOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use storage::Repository;
use thiserror::Error;
use uuid::Uuid;

const SYSTEM_PREAMBLE: &str = "Sei un assistente per studenti di fisioterapia. Rispondi in \
italiano basandoti esclusivamente sui passaggi forniti, citandoli con i loro marcatori. \
Le risposte hanno scopo didattico e non sostituiscono il giudizio clinico di un professionista.";

#[derive(Error, Debug)]
pub enum AnswerError {
    #[error("answer generation unavailable: {0}")]
    Unavailable(String),
    #[error("language model rate limited")]
    RateLimited,
}

impl FisioError for AnswerError {
    fn error_code(&self) -> ErrorCode {
        match self {
            AnswerError::Unavailable(_) => ErrorCode::Unavailable,
            AnswerError::RateLimited => ErrorCode::ResourceExhausted,
        }
    }

    fn safe_message(&self) -> String {
        match self {
            AnswerError::Unavailable(_) => "answer generation unavailable".to_string(),
            AnswerError::RateLimited => "language model rate limited".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub excerpt: String,
    pub position: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerResponse {
    pub user_message_id: Uuid,
    pub message_id: Uuid,
    pub content: String,
    pub citations: Vec<Citation>,
    pub latency_ms: u64,
    /// True when the answer carries no surviving citations.
    pub unsupported: bool,
    /// True when the turn matched a previously persisted idempotency key
    /// and the stored response was returned.
    pub deduplicated: bool,
}

/// Structured output contract expected from the model.
#[derive(Deserialize)]
struct DraftAnswer {
    answer_text: String,
    #[serde(default)]
    citations: Vec<DraftCitation>,
}

#[derive(Deserialize)]
struct DraftCitation {
    chunk_id: String,
    #[serde(default)]
    excerpt: Option<String>,
    #[serde(default)]
    position: Option<usize>,
}

/// Augmented generation: retrieval-grounded, citation-bound answers over
/// the session's conversational memory.
pub struct AnswerEngine {
    retrieval: Arc<RetrievalEngine>,
    chat: Arc<dyn ChatModel>,
    memory: Arc<SessionMemory>,
    repo: Arc<Repository>,
    sink: Arc<dyn EventSink>,
    latency: LatencyWindow,
    config: GenerationConfig,
}

impl AnswerEngine {
    pub fn new(
        retrieval: Arc<RetrievalEngine>,
        chat: Arc<dyn ChatModel>,
        memory: Arc<SessionMemory>,
        repo: Arc<Repository>,
        sink: Arc<dyn EventSink>,
        config: GenerationConfig,
    ) -> Self {
        let latency = LatencyWindow::new(config.ag_latency_max_samples);
        Self {
            retrieval,
            chat,
            memory,
            repo,
            sink,
            latency,
            config,
        }
    }

    /// Answer one user turn. `turn_key` is the idempotency seed; when None
    /// it derives from (session, time, content). A repeated key returns the
    /// first persisted response without touching retrieval or the model.
    pub async fn answer(
        &self,
        session_id: &str,
        user_message: &str,
        flags: FeatureFlags,
        turn_key: Option<String>,
    ) -> Result<AnswerResponse, AnswerError> {
        let started = Instant::now();

        let user_key = turn_key
            .unwrap_or_else(|| message_idempotency_key(session_id, now_ms(), user_message));
        let assistant_key = format!("{user_key}:assistant");

        if let Some(previous) = self.replay_turn(&user_key, &assistant_key).await {
            return Ok(previous);
        }

        let history = self
            .memory
            .recent(session_id, self.config.history_turns)
            .await;

        let retrieved = self
            .retrieval
            .retrieve(user_message, flags)
            .await
            .map_err(|err| AnswerError::Unavailable(err.to_string()))?;

        let prompt = self.build_prompt(&history, &retrieved, user_message);
        let options = ChatOptions {
            deadline_ms: self.config.llm_deadline_ms,
            ..ChatOptions::default()
        };
        let raw = self
            .chat
            .complete(&prompt, &options)
            .await
            .map_err(|err| match err {
                ChatError::RateLimited => AnswerError::RateLimited,
                other => AnswerError::Unavailable(other.to_string()),
            })?;

        let (answer_text, citations) = self.bind_citations(&raw, &retrieved);

        let unsupported = citations.is_empty();
        if unsupported {
            let reason = if retrieved.is_empty() {
                "empty_retrieval"
            } else {
                "no_valid_citations"
            };
            tracing::warn!(session_id, reason, "answer has no supporting citations");
            let _ = self.sink.record(
                Event::new(events::AG_UNSUPPORTED_ANSWER, EventOutcome::Degraded)
                    .with_field("session_id", session_id)
                    .with_field("reason", reason),
            );
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        let response = self
            .persist_turn(
                session_id,
                user_message,
                &user_key,
                &assistant_key,
                answer_text,
                citations,
                latency_ms,
                unsupported,
            )
            .await?;

        self.latency.record(latency_ms);
        let _ = self.sink.record(
            Event::new(events::AG_METRICS, EventOutcome::Succeeded)
                .with_field("session_id", session_id)
                .with_field("latency_ms", latency_ms.to_string())
                .with_field("p95_ms", self.latency.p95().to_string())
                .with_field("citations", response.citations.len().to_string()),
        );

        Ok(response)
    }

    pub fn latency_p95(&self) -> u64 {
        self.latency.p95()
    }

    /// Rebuild the response of an already-persisted turn.
    async fn replay_turn(&self, user_key: &str, assistant_key: &str) -> Option<AnswerResponse> {
        let user = self.repo.message_by_idempotency_key(user_key).await?;
        let assistant = self.repo.message_by_idempotency_key(assistant_key).await?;

        let citations = assistant
            .metadata
            .get("citations")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        let latency_ms = assistant
            .metadata
            .get("latency_ms")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let unsupported = assistant
            .metadata
            .get("unsupported")
            .map(|raw| raw == "true")
            .unwrap_or(false);

        Some(AnswerResponse {
            user_message_id: user.id,
            message_id: assistant.id,
            content: assistant.content,
            citations,
            latency_ms,
            unsupported,
            deduplicated: true,
        })
    }

    fn build_prompt(
        &self,
        history: &[ChatMessage],
        retrieved: &[RetrievedChunk],
        question: &str,
    ) -> String {
        let mut prompt = String::new();
        prompt.push_str(SYSTEM_PREAMBLE);
        prompt.push_str("\n\n");

        if !history.is_empty() {
            prompt.push_str("Conversazione precedente:\n");
            for message in history {
                prompt.push_str(message.role.as_str());
                prompt.push_str(": ");
                prompt.push_str(&message.content);
                prompt.push('\n');
            }
            prompt.push('\n');
        }

        if retrieved.is_empty() {
            prompt.push_str("Nessun passaggio rilevante disponibile.\n\n");
        } else {
            prompt.push_str("Passaggi:\n");
            for (i, chunk) in retrieved.iter().enumerate() {
                let excerpt = truncate_chars(&chunk.content, self.config.excerpt_max_chars);
                prompt.push_str(&format!("[{}] (chunk_id: {}) {}\n", i + 1, chunk.chunk_id, excerpt));
            }
            prompt.push('\n');
        }

        prompt.push_str(
            "Rispondi SOLO con JSON: {\"answer_text\": \"...\", \"citations\": \
             [{\"chunk_id\": \"...\", \"excerpt\": \"...\", \"position\": 1}]}.\n\nDomanda: ",
        );
        prompt.push_str(question);
        prompt
    }

    /// Parse the structured output and keep only citations that point at
    /// actually-retrieved chunks. Invalid citations are dropped and logged;
    /// an unparseable body degrades to a citation-less answer.
    fn bind_citations(&self, raw: &str, retrieved: &[RetrievedChunk]) -> (String, Vec<Citation>) {
        let draft: DraftAnswer = match serde_json::from_str(raw.trim()) {
            Ok(draft) => draft,
            Err(err) => {
                tracing::warn!(error = %err, "unstructured model output, treating as plain text");
                return (raw.trim().to_string(), Vec::new());
            }
        };

        let by_chunk: HashMap<Uuid, (usize, &RetrievedChunk)> = retrieved
            .iter()
            .enumerate()
            .map(|(i, chunk)| (chunk.chunk_id, (i, chunk)))
            .collect();

        let mut citations = Vec::new();
        let mut dropped = 0usize;
        for draft_citation in draft.citations {
            let Some(chunk_id) = Uuid::parse_str(draft_citation.chunk_id.trim()).ok() else {
                dropped += 1;
                continue;
            };
            let Some((index, chunk)) = by_chunk.get(&chunk_id) else {
                dropped += 1;
                continue;
            };

            let excerpt = draft_citation
                .excerpt
                .filter(|excerpt| !excerpt.trim().is_empty())
                .unwrap_or_else(|| chunk.content.clone());
            citations.push(Citation {
                chunk_id,
                document_id: chunk.document_id,
                excerpt: truncate_chars(&excerpt, self.config.excerpt_max_chars),
                position: draft_citation.position.unwrap_or(index + 1),
            });
        }

        if dropped > 0 {
            tracing::warn!(dropped, "dropped citations referencing unknown chunks");
        }

        (draft.answer_text, citations)
    }

    #[allow(clippy::too_many_arguments)]
    async fn persist_turn(
        &self,
        session_id: &str,
        user_message: &str,
        user_key: &str,
        assistant_key: &str,
        answer_text: String,
        citations: Vec<Citation>,
        latency_ms: u64,
        unsupported: bool,
    ) -> Result<AnswerResponse, AnswerError> {
        let user_row = ChatMessage::new(session_id, MessageRole::User, user_message, user_key);
        let appended_user = self
            .repo
            .append_message(user_row)
            .await
            .map_err(|err| AnswerError::Unavailable(err.to_string()))?;

        let mut assistant_row =
            ChatMessage::new(session_id, MessageRole::Assistant, answer_text, assistant_key);
        assistant_row.source_chunk_ids = citations.iter().map(|c| c.chunk_id).collect();
        assistant_row.metadata.insert(
            "citations".to_string(),
            serde_json::to_string(&citations).unwrap_or_else(|_| "[]".to_string()),
        );
        assistant_row
            .metadata
            .insert("latency_ms".to_string(), latency_ms.to_string());
        assistant_row
            .metadata
            .insert("unsupported".to_string(), unsupported.to_string());
        assistant_row
            .metadata
            .insert("in_reply_to".to_string(), appended_user.message.id.to_string());

        let appended_assistant = self
            .repo
            .append_message(assistant_row)
            .await
            .map_err(|err| AnswerError::Unavailable(err.to_string()))?;

        if !appended_user.deduplicated {
            self.memory.record(&appended_user.message).await;
        }
        if !appended_assistant.deduplicated {
            self.memory.record(&appended_assistant.message).await;
        }

        Ok(AnswerResponse {
            user_message_id: appended_user.message.id,
            message_id: appended_assistant.message.id,
            content: appended_assistant.message.content,
            citations,
            latency_ms,
            unsupported,
            deduplicated: false,
        })
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}
