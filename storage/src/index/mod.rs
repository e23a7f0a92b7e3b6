pub mod ann;
#[cfg(all(feature = "hnsw", not(target_os = "macos")))]
pub mod hnsw;

pub use ann::LinearAnnIndex;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VectorIndexError {
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("vector index backend error: {0}")]
    Backend(String),
}

enum Backend {
    Linear(LinearAnnIndex),
    #[cfg(all(feature = "hnsw", not(target_os = "macos")))]
    Hnsw(hnsw::HnswIndex),
}

/// Vector index over chunk embeddings with a fixed dimension. Uses the HNSW
/// backend when compiled in, the exact linear scan otherwise; both honor the
/// same threshold/k search contract.
pub struct VectorIndex {
    dims: usize,
    backend: Backend,
}

impl VectorIndex {
    pub fn new(dims: usize) -> Result<Self, VectorIndexError> {
        #[cfg(all(feature = "hnsw", not(target_os = "macos")))]
        {
            let index = hnsw::HnswIndex::new(dims).map_err(VectorIndexError::Backend)?;
            return Ok(Self {
                dims,
                backend: Backend::Hnsw(index),
            });
        }

        #[allow(unreachable_code)]
        Ok(Self {
            dims,
            backend: Backend::Linear(LinearAnnIndex::new()),
        })
    }

    /// Exact-scan index regardless of compiled features.
    pub fn linear(dims: usize) -> Self {
        Self {
            dims,
            backend: Backend::Linear(LinearAnnIndex::new()),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn insert(&mut self, key: u64, embedding: &[f32]) -> Result<(), VectorIndexError> {
        if embedding.len() != self.dims {
            return Err(VectorIndexError::DimensionMismatch {
                expected: self.dims,
                actual: embedding.len(),
            });
        }

        match &mut self.backend {
            Backend::Linear(index) => {
                index.insert(key, embedding.to_vec());
                Ok(())
            }
            #[cfg(all(feature = "hnsw", not(target_os = "macos")))]
            Backend::Hnsw(index) => index.insert(key, embedding).map_err(VectorIndexError::Backend),
        }
    }

    pub fn remove(&mut self, key: u64) -> bool {
        match &mut self.backend {
            Backend::Linear(index) => index.remove(key),
            #[cfg(all(feature = "hnsw", not(target_os = "macos")))]
            Backend::Hnsw(index) => index.remove(key),
        }
    }

    pub fn search(
        &self,
        query: &[f32],
        threshold: f32,
        k: usize,
    ) -> Result<Vec<(u64, f32)>, VectorIndexError> {
        if query.len() != self.dims {
            return Err(VectorIndexError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }

        match &self.backend {
            Backend::Linear(index) => Ok(index.search(query, threshold, k)),
            #[cfg(all(feature = "hnsw", not(target_os = "macos")))]
            Backend::Hnsw(index) => index
                .search(query, threshold, k)
                .map_err(VectorIndexError::Backend),
        }
    }

    pub fn len(&self) -> usize {
        match &self.backend {
            Backend::Linear(index) => index.len(),
            #[cfg(all(feature = "hnsw", not(target_os = "macos")))]
            Backend::Hnsw(index) => index.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_wrong_dimension_on_insert() {
        let mut index = VectorIndex::linear(3);
        let err = index.insert(1, &[1.0, 0.0]).unwrap_err();
        assert!(matches!(
            err,
            VectorIndexError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn search_respects_threshold_and_k() {
        let mut index = VectorIndex::linear(2);
        index.insert(1, &[1.0, 0.0]).unwrap();
        index.insert(2, &[0.9, 0.1]).unwrap();
        index.insert(3, &[0.0, 1.0]).unwrap();

        let hits = index.search(&[1.0, 0.0], 0.5, 1).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 1);
    }
}
