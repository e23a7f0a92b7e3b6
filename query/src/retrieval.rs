use crate::heuristic::dynamic_match_count;
use crate::rerank::Reranker;
use fisiorag_core::config::RetrievalConfig;
use fisiorag_core::error::{ErrorCode, FisioError};
use fisiorag_core::flags::FeatureFlags;
use fisiorag_core::telemetry::{events, Event, EventOutcome, EventSink};
use models::embedder::EmbeddingGateway;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::Repository;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RetrievalError {
    #[error("retrieval unavailable: {0}")]
    Unavailable(String),
}

impl FisioError for RetrievalError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::Unavailable
    }

    fn safe_message(&self) -> String {
        "retrieval unavailable".to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    pub chunk_id: Uuid,
    pub document_id: Uuid,
    pub content: String,
    pub similarity: f32,
    pub rerank_score: Option<f32>,
}

/// Two-stage hybrid retrieval: similarity search with over-retrieval,
/// optional cross-encoder re-ranking with graceful degradation, optional
/// per-document diversification, then truncation to the dynamic target.
pub struct RetrievalEngine {
    repo: Arc<Repository>,
    gateway: Arc<EmbeddingGateway>,
    reranker: Option<Arc<Reranker>>,
    config: RetrievalConfig,
    sink: Arc<dyn EventSink>,
}

impl RetrievalEngine {
    pub fn new(
        repo: Arc<Repository>,
        gateway: Arc<EmbeddingGateway>,
        config: RetrievalConfig,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            repo,
            gateway,
            reranker: None,
            config,
            sink,
        }
    }

    pub fn with_reranker(mut self, reranker: Arc<Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve the ranked evidence set for `query` under the request's
    /// feature-flag snapshot. The stage order is fixed: embed, search,
    /// rerank, diversify, truncate.
    pub async fn retrieve(
        &self,
        query: &str,
        flags: FeatureFlags,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let deadline = Duration::from_millis(self.config.deadline_ms);
        let started = Instant::now();

        let result = tokio::time::timeout(deadline, self.retrieve_inner(query, flags, started))
            .await
            .map_err(|_| {
                tracing::warn!(deadline_ms = self.config.deadline_ms, "retrieval deadline exceeded");
                RetrievalError::Unavailable("deadline exceeded".to_string())
            })?;

        let total_ms = started.elapsed().as_millis() as u64;
        if let Some(reranker) = &self.reranker {
            reranker.record_latency(total_ms);
        }
        result
    }

    async fn retrieve_inner(
        &self,
        query: &str,
        flags: FeatureFlags,
        started: Instant,
    ) -> Result<Vec<RetrievedChunk>, RetrievalError> {
        let k_target = if flags.dynamic_match_count {
            dynamic_match_count(query, &self.config)
        } else {
            self.config.match_count_default.clamp(
                self.config.match_count_min,
                self.config.match_count_max,
            )
        };

        let embed_started = Instant::now();
        let query_embedding = self
            .gateway
            .embed_query(query)
            .await
            .map_err(|err| RetrievalError::Unavailable(format!("query embedding: {err}")))?;
        let embed_ms = embed_started.elapsed().as_millis() as u64;

        let rerank_requested = flags.cross_encoder_reranking && self.reranker.is_some();
        let k_fetch = if rerank_requested {
            k_target * self.config.over_retrieve_factor.max(1)
        } else {
            k_target
        };

        let search_started = Instant::now();
        let hits = self
            .repo
            .search_chunks(&query_embedding, self.config.match_threshold, k_fetch)
            .await
            .map_err(|err| RetrievalError::Unavailable(format!("vector search: {err}")))?;
        let search_ms = search_started.elapsed().as_millis() as u64;

        let mut candidates: Vec<RetrievedChunk> = hits
            .into_iter()
            .map(|hit| RetrievedChunk {
                chunk_id: hit.chunk_id,
                document_id: hit.document_id,
                content: hit.content,
                similarity: hit.similarity,
                rerank_score: None,
            })
            .collect();

        let rerank_started = Instant::now();
        let mut rerank_used = false;
        if rerank_requested && !candidates.is_empty() {
            let reranker = self.reranker.as_ref().unwrap();
            let passages: Vec<String> = candidates
                .iter()
                .map(|candidate| candidate.content.clone())
                .collect();

            match reranker.score(query, &passages).await {
                Ok(scores) => {
                    for (candidate, score) in candidates.iter_mut().zip(scores) {
                        candidate.rerank_score = Some(score);
                    }
                    candidates.retain(|candidate| {
                        candidate
                            .rerank_score
                            .map(|score| score >= self.config.rerank_threshold)
                            .unwrap_or(false)
                    });
                    candidates.sort_by(|a, b| {
                        compare_scores(b.rerank_score, a.rerank_score)
                            .then(compare_f32(b.similarity, a.similarity))
                            .then(a.chunk_id.cmp(&b.chunk_id))
                    });
                    rerank_used = true;
                }
                Err(bypass) => {
                    tracing::warn!(reason = bypass.reason(), "re-ranking bypassed");
                    let _ = self.sink.record(
                        Event::new(events::RETRIEVAL_RERANK_BYPASSED, EventOutcome::Degraded)
                            .with_field("reason", bypass.reason()),
                    );
                }
            }
        }
        let rerank_ms = rerank_started.elapsed().as_millis() as u64;

        let diversify_started = Instant::now();
        if flags.chunk_diversification {
            candidates = diversify(
                candidates,
                self.config.diversify_preserve_top_n,
                self.config.diversify_max_per_document,
            );
        }
        let diversify_ms = diversify_started.elapsed().as_millis() as u64;

        candidates.truncate(k_target);

        let distinct_documents = candidates
            .iter()
            .map(|candidate| candidate.document_id)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let diversity_score = if candidates.is_empty() {
            0.0
        } else {
            distinct_documents as f32 / candidates.len() as f32
        };

        let _ = self.sink.record(
            Event::new(events::RETRIEVAL, EventOutcome::Succeeded)
                .with_field("k_target", k_target.to_string())
                .with_field("k_fetch", k_fetch.to_string())
                .with_field("returned", candidates.len().to_string())
                .with_field("rerank_used", rerank_used.to_string())
                .with_field(
                    "flags",
                    format!(
                        "rerank={},dynamic_k={},diversify={}",
                        flags.cross_encoder_reranking,
                        flags.dynamic_match_count,
                        flags.chunk_diversification
                    ),
                )
                .with_field("diversity_score", format!("{diversity_score:.3}"))
                .with_field(
                    "chunk_ids",
                    candidates
                        .iter()
                        .map(|candidate| candidate.chunk_id.to_string())
                        .collect::<Vec<_>>()
                        .join(","),
                )
                .with_field(
                    "similarities",
                    candidates
                        .iter()
                        .map(|candidate| format!("{:.3}", candidate.similarity))
                        .collect::<Vec<_>>()
                        .join(","),
                )
                .with_field(
                    "rerank_scores",
                    candidates
                        .iter()
                        .map(|candidate| {
                            candidate
                                .rerank_score
                                .map(|score| format!("{score:.3}"))
                                .unwrap_or_else(|| "-".to_string())
                        })
                        .collect::<Vec<_>>()
                        .join(","),
                )
                .with_field("embed_ms", embed_ms.to_string())
                .with_field("search_ms", search_ms.to_string())
                .with_field("rerank_ms", rerank_ms.to_string())
                .with_field("diversify_ms", diversify_ms.to_string())
                .with_field("latency_ms", (started.elapsed().as_millis() as u64).to_string()),
        );

        Ok(candidates)
    }
}

/// Per-document diversification. The first `preserve_top_n` entries are
/// kept untouched; in the tail at most `max_per_document` entries per
/// document survive, scanned in ranking order so the highest-scoring ones
/// win. Applying this twice equals applying it once.
pub fn diversify(
    candidates: Vec<RetrievedChunk>,
    preserve_top_n: usize,
    max_per_document: usize,
) -> Vec<RetrievedChunk> {
    if candidates.len() <= preserve_top_n {
        return candidates;
    }

    let mut out: Vec<RetrievedChunk> = Vec::with_capacity(candidates.len());
    let mut tail_counts: HashMap<Uuid, usize> = HashMap::new();

    for (position, candidate) in candidates.into_iter().enumerate() {
        if position < preserve_top_n {
            out.push(candidate);
            continue;
        }
        let count = tail_counts.entry(candidate.document_id).or_insert(0);
        if *count < max_per_document {
            *count += 1;
            out.push(candidate);
        }
    }

    out
}

fn compare_scores(a: Option<f32>, b: Option<f32>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => compare_f32(a, b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn compare_f32(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(document: u128, sequence: u128, similarity: f32) -> RetrievedChunk {
        RetrievedChunk {
            chunk_id: Uuid::from_u128(document * 1000 + sequence),
            document_id: Uuid::from_u128(document),
            content: format!("chunk {document}/{sequence}"),
            similarity,
            rerank_score: None,
        }
    }

    #[test]
    fn diversify_preserves_prefix_and_caps_tail() {
        // 6 chunks of document A ahead of 2 chunks of document B.
        let mut candidates = Vec::new();
        for i in 0..6 {
            candidates.push(chunk(1, i as u128, 0.95 - i as f32 * 0.01));
        }
        candidates.push(chunk(2, 0, 0.85));
        candidates.push(chunk(2, 1, 0.84));

        let out = diversify(candidates, 3, 2);

        // Prefix untouched: three document-A chunks.
        assert!(out[..3].iter().all(|c| c.document_id == Uuid::from_u128(1)));
        // Tail holds at most two more from document A.
        let tail_a = out[3..]
            .iter()
            .filter(|c| c.document_id == Uuid::from_u128(1))
            .count();
        assert_eq!(tail_a, 2);
        // Document B survives diversification.
        assert!(out.iter().any(|c| c.document_id == Uuid::from_u128(2)));
    }

    #[test]
    fn diversify_is_idempotent() {
        let mut candidates = Vec::new();
        for i in 0..8 {
            candidates.push(chunk(1, i as u128, 0.9 - i as f32 * 0.01));
        }
        candidates.push(chunk(2, 0, 0.8));

        let once = diversify(candidates.clone(), 3, 2);
        let twice = diversify(once.clone(), 3, 2);
        assert_eq!(once, twice);
    }

    #[test]
    fn diversify_short_list_is_untouched() {
        let candidates = vec![chunk(1, 0, 0.9), chunk(1, 1, 0.8)];
        let out = diversify(candidates.clone(), 3, 2);
        assert_eq!(out, candidates);
    }
}
