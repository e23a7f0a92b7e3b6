use usearch::{new_index, Index, IndexOptions, MetricKind, ScalarKind};

/// HNSW parameters for the chunk index. Connectivity is the graph's `m`,
/// expansion_add is `ef_construction`.
const HNSW_CONNECTIVITY: usize = 16;
const HNSW_EXPANSION_ADD: usize = 64;
const HNSW_EXPANSION_SEARCH: usize = 64;
const INITIAL_CAPACITY: usize = 1024;

/// Approximate nearest-neighbor index over cosine distance, backed by
/// usearch. Similarity is reported as `1 - cosine_distance` so callers see
/// the same score space as the exact index.
pub struct HnswIndex {
    index: Index,
}

impl HnswIndex {
    pub fn new(dims: usize) -> Result<Self, String> {
        let mut options = IndexOptions::default();
        options.dimensions = dims;
        options.metric = MetricKind::Cos;
        options.quantization = ScalarKind::F32;
        options.connectivity = HNSW_CONNECTIVITY;
        options.expansion_add = HNSW_EXPANSION_ADD;
        options.expansion_search = HNSW_EXPANSION_SEARCH;

        let index = new_index(&options).map_err(|e| e.to_string())?;
        index.reserve(INITIAL_CAPACITY).map_err(|e| e.to_string())?;

        Ok(Self { index })
    }

    pub fn insert(&mut self, key: u64, embedding: &[f32]) -> Result<(), String> {
        if self.index.size() >= self.index.capacity() {
            let grown = (self.index.capacity() * 2).max(INITIAL_CAPACITY);
            self.index.reserve(grown).map_err(|e| e.to_string())?;
        }
        // Re-inserting an existing key replaces its vector.
        let _ = self.index.remove(key);
        self.index.add(key, embedding).map_err(|e| e.to_string())
    }

    pub fn remove(&mut self, key: u64) -> bool {
        self.index.remove(key).map(|n| n > 0).unwrap_or(false)
    }

    pub fn search(&self, query: &[f32], threshold: f32, k: usize) -> Result<Vec<(u64, f32)>, String> {
        if k == 0 || self.index.size() == 0 {
            return Ok(Vec::new());
        }

        let matches = self.index.search(query, k).map_err(|e| e.to_string())?;

        let mut out = Vec::with_capacity(matches.keys.len());
        for (key, distance) in matches.keys.iter().zip(matches.distances.iter()) {
            let similarity = 1.0 - *distance;
            if similarity > threshold {
                out.push((*key, similarity));
            }
        }

        // usearch returns ascending distance; keep descending similarity
        // with a stable key tie-break like the exact index.
        out.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.index.size()
    }
}
