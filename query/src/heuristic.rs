use fisiorag_core::config::RetrievalConfig;

/// Query shape inferred from cheap lexical features. Drives the dynamic
/// match-count sizing: definitional questions need few focused passages,
/// comparisons need broad coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Definitional,
    Procedural,
    Comparative,
    Other,
}

const COMPARATIVE_CUES: [&str; 9] = [
    "confronta",
    "confronto",
    "differenza",
    "differenze",
    "rispetto a",
    "versus",
    " vs ",
    "compare",
    "comparison",
];

const PROCEDURAL_CUES: [&str; 9] = [
    "come ",
    "passo",
    "passi",
    "procedura",
    "protocollo",
    "istruzioni",
    "quali sono",
    "elenca",
    "how to",
];

const DEFINITIONAL_CUES: [&str; 8] = [
    "cos'è",
    "cos'e",
    "cosa è",
    "cosa e",
    "che cos'è",
    "definizione",
    "what is",
    "define",
];

pub fn classify_query(query: &str) -> QueryKind {
    let normalized = query.to_lowercase();

    if contains_any(&normalized, &COMPARATIVE_CUES) {
        return QueryKind::Comparative;
    }
    if contains_any(&normalized, &PROCEDURAL_CUES) {
        return QueryKind::Procedural;
    }
    if contains_any(&normalized, &DEFINITIONAL_CUES) {
        return QueryKind::Definitional;
    }
    // Very short interrogatives without other cues read as definitional.
    if normalized.contains('?') && normalized.split_whitespace().count() <= 4 {
        return QueryKind::Definitional;
    }

    QueryKind::Other
}

/// Match count for a query under the dynamic heuristic, clamped to the
/// configured [min, max] window.
pub fn dynamic_match_count(query: &str, config: &RetrievalConfig) -> usize {
    let target = match classify_query(query) {
        QueryKind::Definitional => 5,
        QueryKind::Procedural => 10,
        QueryKind::Comparative => 12,
        QueryKind::Other => config.match_count_default,
    };
    target.clamp(config.match_count_min, config.match_count_max)
}

fn contains_any(haystack: &str, cues: &[&str]) -> bool {
    cues.iter().any(|cue| haystack.contains(cue))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_the_three_canonical_queries() {
        assert_eq!(
            classify_query("Cos'è la radicolopatia?"),
            QueryKind::Definitional
        );
        assert_eq!(
            classify_query("Come trattare la radicolopatia passo per passo?"),
            QueryKind::Procedural
        );
        assert_eq!(
            classify_query("Confronta trattamento conservativo e chirurgico"),
            QueryKind::Comparative
        );
    }

    #[test]
    fn match_counts_follow_the_kind_mapping() {
        let config = RetrievalConfig::default();
        assert_eq!(dynamic_match_count("Cos'è la radicolopatia?", &config), 5);
        assert_eq!(
            dynamic_match_count("Come trattare la radicolopatia passo per passo?", &config),
            10
        );
        assert_eq!(
            dynamic_match_count("Confronta trattamento conservativo e chirurgico", &config),
            12
        );
        assert_eq!(
            dynamic_match_count("terapia manuale rachide lombare", &config),
            8
        );
    }

    #[test]
    fn counts_are_clamped_to_configured_window() {
        let config = RetrievalConfig {
            match_count_min: 6,
            match_count_max: 9,
            ..RetrievalConfig::default()
        };
        assert_eq!(dynamic_match_count("Cos'è la lombalgia?", &config), 6);
        assert_eq!(
            dynamic_match_count("Confronta esercizi e terapia manuale", &config),
            9
        );
    }
}
