use crate::chat::{ChatError, ChatModel, ChatOptions};
use fisiorag_core::model::{Classification, DocumentStructure};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

/// Bump when the classification schema or prompt changes; cached results
/// from older versions then read as misses.
pub const CLASSIFIER_VERSION: u32 = 2;

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier model error: {0}")]
    Model(#[from] ChatError),
    #[error("unparseable classifier output: {0}")]
    Parse(String),
}

/// Structural signals gathered during extraction, passed to the classifier
/// as hints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructuralHints {
    pub has_tables: bool,
    pub has_images: bool,
}

#[async_trait::async_trait]
pub trait DocumentClassifier: Send + Sync {
    async fn classify(
        &self,
        text: &str,
        hints: StructuralHints,
    ) -> Result<Classification, ClassifierError>;
}

#[derive(Deserialize)]
struct RawClassification {
    domain: String,
    structure: String,
    confidence: f32,
}

/// LLM-backed classifier: one JSON-mode completion over a truncated sample
/// of the document.
pub struct LlmClassifier {
    chat: Arc<dyn ChatModel>,
    sample_chars: usize,
}

impl LlmClassifier {
    pub fn new(chat: Arc<dyn ChatModel>) -> Self {
        Self {
            chat,
            sample_chars: 4000,
        }
    }

    fn build_prompt(&self, text: &str, hints: StructuralHints) -> String {
        let sample: String = text.chars().take(self.sample_chars).collect();
        format!(
            "Classifica il seguente documento di fisioterapia.\n\
             Rispondi SOLO con JSON: {{\"domain\": \"anatomia|patologia|trattamento|esercizi|tecnico_generico\", \
             \"structure\": \"narrative|tabular|mixed\", \"confidence\": 0.0-1.0}}.\n\
             Segnali strutturali: tabelle={}, immagini={}.\n\n{}",
            hints.has_tables, hints.has_images, sample
        )
    }
}

#[async_trait::async_trait]
impl DocumentClassifier for LlmClassifier {
    async fn classify(
        &self,
        text: &str,
        hints: StructuralHints,
    ) -> Result<Classification, ClassifierError> {
        let prompt = self.build_prompt(text, hints);
        let options = ChatOptions::default();
        let raw = self.chat.complete(&prompt, &options).await?;

        let parsed: RawClassification =
            serde_json::from_str(raw.trim()).map_err(|err| ClassifierError::Parse(err.to_string()))?;

        Ok(Classification {
            domain: parsed.domain,
            structure: parse_structure(&parsed.structure),
            confidence: parsed.confidence.clamp(0.0, 1.0),
            version: CLASSIFIER_VERSION,
        })
    }
}

/// Deterministic keyword classifier used in tests and as an offline
/// fallback. Domain vocabulary mirrors the clinical corpus.
#[derive(Default)]
pub struct KeywordClassifier;

const DOMAIN_KEYWORDS: [(&str, &[&str]); 4] = [
    (
        "patologia",
        &["sindrome", "patologia", "radicolopatia", "lombalgia", "cervicalgia", "ernia"],
    ),
    (
        "trattamento",
        &["trattamento", "terapia", "riabilitazione", "conservativo", "chirurgico"],
    ),
    ("esercizi", &["esercizio", "esercizi", "stretching", "mobilizzazione"]),
    ("anatomia", &["muscolo", "vertebra", "nervo", "articolazione", "legamento"]),
];

#[async_trait::async_trait]
impl DocumentClassifier for KeywordClassifier {
    async fn classify(
        &self,
        text: &str,
        hints: StructuralHints,
    ) -> Result<Classification, ClassifierError> {
        let lowered = text.to_lowercase();

        let mut best: Option<(&str, usize)> = None;
        for (domain, keywords) in DOMAIN_KEYWORDS {
            let matches = keywords
                .iter()
                .filter(|keyword| lowered.contains(*keyword))
                .count();
            if matches > 0 && best.map(|(_, n)| matches > n).unwrap_or(true) {
                best = Some((domain, matches));
            }
        }

        let structure = if hints.has_tables {
            if lowered.len() > 400 {
                DocumentStructure::Mixed
            } else {
                DocumentStructure::Tabular
            }
        } else {
            DocumentStructure::Narrative
        };

        match best {
            Some((domain, matches)) => Ok(Classification {
                domain: domain.to_string(),
                structure,
                confidence: (0.6 + 0.1 * matches as f32).min(0.95),
                version: CLASSIFIER_VERSION,
            }),
            None => Ok(Classification {
                domain: fisiorag_core::model::FALLBACK_DOMAIN.to_string(),
                structure,
                confidence: 0.4,
                version: CLASSIFIER_VERSION,
            }),
        }
    }
}

fn parse_structure(raw: &str) -> DocumentStructure {
    match raw.to_lowercase().as_str() {
        "tabular" => DocumentStructure::Tabular,
        "mixed" => DocumentStructure::Mixed,
        _ => DocumentStructure::Narrative,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::MockChatModel;

    #[tokio::test]
    async fn keyword_classifier_finds_pathology_domain() {
        let classifier = KeywordClassifier;
        let result = classifier
            .classify(
                "La radicolopatia lombare è una sindrome da compressione radicolare.",
                StructuralHints::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.domain, "patologia");
        assert!(result.confidence >= 0.7);
        assert_eq!(result.version, CLASSIFIER_VERSION);
    }

    #[tokio::test]
    async fn keyword_classifier_falls_back_on_unknown_text() {
        let classifier = KeywordClassifier;
        let result = classifier
            .classify("contenuto generico senza termini noti", StructuralHints::default())
            .await
            .unwrap();

        assert_eq!(result.domain, fisiorag_core::model::FALLBACK_DOMAIN);
        assert!(result.confidence < 0.7);
    }

    #[tokio::test]
    async fn llm_classifier_parses_json_output() {
        let chat = Arc::new(MockChatModel::with_responses(vec![
            r#"{"domain": "trattamento", "structure": "narrative", "confidence": 0.92}"#,
        ]));
        let classifier = LlmClassifier::new(chat);

        let result = classifier
            .classify("Il trattamento conservativo…", StructuralHints::default())
            .await
            .unwrap();

        assert_eq!(result.domain, "trattamento");
        assert_eq!(result.structure, DocumentStructure::Narrative);
        assert!((result.confidence - 0.92).abs() < 1e-6);
    }

    #[tokio::test]
    async fn llm_classifier_surfaces_parse_errors() {
        let chat = Arc::new(MockChatModel::with_responses(vec!["not json"]));
        let classifier = LlmClassifier::new(chat);

        let err = classifier
            .classify("testo", StructuralHints::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifierError::Parse(_)));
    }
}
