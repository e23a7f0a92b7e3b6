use sha2::{Digest, Sha256};

/// Hash-seeded embedding used by the deterministic embedder in tests and
/// offline tooling. Vectors are L2-normalized so cosine similarity over
/// them behaves like the production model's output space.
pub fn deterministic_embedding(text: &str, model_id: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);

    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    let mut out = Vec::with_capacity(dims);
    for i in 0..dims {
        let byte = digest[i % digest.len()];
        let value = (byte as f32 / 127.5) - 1.0;
        out.push(value);
    }

    let norm: f32 = out.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut out {
            *value /= norm;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_embedding_is_reproducible_for_same_inputs() {
        let a = deterministic_embedding("radicolopatia", "embed-clinical-v1", 16);
        let b = deterministic_embedding("radicolopatia", "embed-clinical-v1", 16);
        assert_eq!(a, b);
    }

    #[test]
    fn deterministic_embedding_changes_when_model_changes() {
        let a = deterministic_embedding("radicolopatia", "embed-clinical-v1", 16);
        let b = deterministic_embedding("radicolopatia", "embed-clinical-v2", 16);
        assert_ne!(a, b);
    }

    #[test]
    fn deterministic_embedding_is_unit_length() {
        let v = deterministic_embedding("lombalgia acuta", "embed-clinical-v1", 64);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }
}
