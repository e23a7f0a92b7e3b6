use std::collections::HashMap;

/// Exact cosine-similarity index over a flat embedding table. Used when the
/// `hnsw` feature is off and as the reference implementation for its tests.
pub struct LinearAnnIndex {
    embeddings: HashMap<u64, Vec<f32>>,
}

impl LinearAnnIndex {
    pub fn new() -> Self {
        Self {
            embeddings: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: u64, embedding: Vec<f32>) {
        self.embeddings.insert(key, embedding);
    }

    pub fn remove(&mut self, key: u64) -> bool {
        self.embeddings.remove(&key).is_some()
    }

    /// Top-k nearest neighbors by cosine similarity, keeping only entries
    /// strictly above `threshold`.
    pub fn search(&self, query: &[f32], threshold: f32, k: usize) -> Vec<(u64, f32)> {
        let mut scores: Vec<(u64, f32)> = self
            .embeddings
            .iter()
            .filter_map(|(key, emb)| cosine_similarity(query, emb).map(|score| (*key, score)))
            .filter(|(_, score)| *score > threshold)
            .collect();

        scores.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        scores.truncate(k);
        scores
    }

    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

impl Default for LinearAnnIndex {
    fn default() -> Self {
        Self::new()
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}
