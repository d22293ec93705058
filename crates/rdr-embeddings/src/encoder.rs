use async_trait::async_trait;
use sha2::{Digest, Sha256};

use rdr_core::Result;

use crate::similarity::l2_normalize;

/// Encodes a batch of texts into fixed-dimensionality vectors.
#[async_trait]
pub trait TextEncoder: Send + Sync {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn dimensions(&self) -> usize;
}

/// Deterministic encoder for tests and offline runs.
///
/// Hashes the text with SHA-256 and uses the digest bytes as vector
/// components, L2-normalized. Identical texts map to identical unit vectors,
/// which is all the matcher tests rely on.
pub struct HashingEncoder {
    dims: usize,
}

impl HashingEncoder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }

    fn hash_to_vector(&self, text: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(text.as_bytes());
        let hash = hasher.finalize();

        let mut v: Vec<f32> = (0..self.dims)
            .map(|i| {
                let byte = hash[i % hash.len()];
                // Map byte to [-1, 1].
                (f32::from(byte) / 127.5) - 1.0
            })
            .collect();

        l2_normalize(&mut v);
        v
    }
}

#[async_trait]
impl TextEncoder for HashingEncoder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.hash_to_vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_texts_get_identical_vectors() {
        let enc = HashingEncoder::new(16);
        let vs = enc
            .encode(&["billing issue".to_string(), "billing issue".to_string()])
            .await
            .unwrap();
        assert_eq!(vs[0], vs[1]);
    }

    #[tokio::test]
    async fn vectors_are_unit_length() {
        let enc = HashingEncoder::new(16);
        let vs = enc.encode(&["hello".to_string()]).await.unwrap();
        let norm: f32 = vs[0].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn distinct_texts_differ() {
        let enc = HashingEncoder::new(16);
        let vs = enc
            .encode(&["support".to_string(), "billing".to_string()])
            .await
            .unwrap();
        assert_ne!(vs[0], vs[1]);
    }
}
