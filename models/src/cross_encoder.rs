use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum CrossEncoderError {
    #[error("cross-encoder load failed: {0}")]
    Load(String),
    #[error("cross-encoder inference failed: {0}")]
    Inference(String),
}

/// Joint (query, passage) scorer. Scores from both bundled implementations
/// stay in [0, 1] so the rerank threshold reads in the same space.
#[async_trait::async_trait]
pub trait CrossEncoder: Send + Sync {
    async fn predict(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, CrossEncoderError>;
}

/// Factory for the lazily loaded cross-encoder. Loading can be slow (model
/// weights); the retrieval layer calls this at most once per process.
#[async_trait::async_trait]
pub trait CrossEncoderProvider: Send + Sync {
    async fn load(&self) -> Result<Arc<dyn CrossEncoder>, CrossEncoderError>;
}

/// Provider returning an already-built scorer.
pub struct StaticCrossEncoderProvider {
    encoder: Arc<dyn CrossEncoder>,
}

impl StaticCrossEncoderProvider {
    pub fn new(encoder: Arc<dyn CrossEncoder>) -> Self {
        Self { encoder }
    }
}

#[async_trait::async_trait]
impl CrossEncoderProvider for StaticCrossEncoderProvider {
    async fn load(&self) -> Result<Arc<dyn CrossEncoder>, CrossEncoderError> {
        Ok(self.encoder.clone())
    }
}

/// Provider that always fails to load; used to exercise degradation paths.
pub struct FailingCrossEncoderProvider;

#[async_trait::async_trait]
impl CrossEncoderProvider for FailingCrossEncoderProvider {
    async fn load(&self) -> Result<Arc<dyn CrossEncoder>, CrossEncoderError> {
        Err(CrossEncoderError::Load("model weights unavailable".to_string()))
    }
}

/// Deterministic lexical scorer: token overlap between query and passage,
/// with bigram expansion for non-ASCII tokens so Italian clinical text
/// scores sensibly.
#[derive(Default)]
pub struct LexicalCrossEncoder;

const UNICODE_NGRAM_SIZE: usize = 2;

#[async_trait::async_trait]
impl CrossEncoder for LexicalCrossEncoder {
    async fn predict(&self, pairs: &[(String, String)]) -> Result<Vec<f32>, CrossEncoderError> {
        Ok(pairs
            .iter()
            .map(|(query, passage)| {
                let query_tokens = tokenize(query);
                let passage_tokens = tokenize(passage);
                overlap_score(&query_tokens, &passage_tokens)
            })
            .collect())
    }
}

/// Scorer that fails at inference time.
pub struct FailingCrossEncoder;

#[async_trait::async_trait]
impl CrossEncoder for FailingCrossEncoder {
    async fn predict(&self, _pairs: &[(String, String)]) -> Result<Vec<f32>, CrossEncoderError> {
        Err(CrossEncoderError::Inference("inference backend down".to_string()))
    }
}

fn overlap_score(query: &HashSet<String>, passage: &HashSet<String>) -> f32 {
    if query.is_empty() || passage.is_empty() {
        return 0.0;
    }
    let intersection = query.intersection(passage).count() as f32;
    intersection / query.len() as f32
}

fn tokenize(text: &str) -> HashSet<String> {
    let mut out = HashSet::new();
    let mut buffer = String::new();

    for ch in text.chars().flat_map(|ch| ch.to_lowercase()) {
        if ch.is_alphanumeric() || ch == '_' {
            buffer.push(ch);
        } else if !buffer.is_empty() {
            out.insert(buffer.clone());
            buffer.clear();
        }
    }

    if !buffer.is_empty() {
        out.insert(buffer);
    }

    let unicode_tokens: Vec<String> = out
        .iter()
        .filter(|token| !token.is_ascii())
        .cloned()
        .collect();
    for token in unicode_tokens {
        for ngram in char_ngrams(&token, UNICODE_NGRAM_SIZE) {
            out.insert(ngram);
        }
    }

    out
}

fn char_ngrams(token: &str, n: usize) -> Vec<String> {
    let chars: Vec<char> = token.chars().collect();
    if chars.is_empty() || n == 0 {
        return Vec::new();
    }
    if chars.len() <= n {
        return vec![token.to_string()];
    }

    chars
        .windows(n)
        .map(|window| window.iter().collect::<String>())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lexical_scores_relevant_passage_higher() {
        let encoder = LexicalCrossEncoder;
        let pairs = vec![
            (
                "trattamento della radicolopatia lombare".to_string(),
                "il trattamento conservativo della radicolopatia lombare prevede".to_string(),
            ),
            (
                "trattamento della radicolopatia lombare".to_string(),
                "anatomia del ginocchio e legamenti crociati".to_string(),
            ),
        ];

        let scores = encoder.predict(&pairs).await.unwrap();
        assert_eq!(scores.len(), 2);
        assert!(scores[0] > scores[1]);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
    }

    #[tokio::test]
    async fn failing_encoder_surfaces_inference_error() {
        let encoder = FailingCrossEncoder;
        let err = encoder
            .predict(&[("q".to_string(), "p".to_string())])
            .await
            .unwrap_err();
        assert!(matches!(err, CrossEncoderError::Inference(_)));
    }
}
