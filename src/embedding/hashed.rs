//! Offline feature-hashing embedder.
//!
//! Each lowercase alphanumeric token is hashed with SHA-256; the hash picks a
//! bucket and a sign. The bucket counts are L2-normalised, so cosine
//! similarity tracks shared vocabulary. No model, no network, fully
//! deterministic across runs and platforms.

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use super::{normalize_l2, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::Result;

const DEFAULT_DIMS: usize = 384;
const DEFAULT_MODEL: &str = "hashed-v1";

pub struct HashedProvider {
    model: String,
    dims: usize,
}

impl HashedProvider {
    pub fn new(config: &EmbeddingConfig) -> Self {
        Self::with_dims(
            config.model.as_deref().unwrap_or(DEFAULT_MODEL),
            config.dims.unwrap_or(DEFAULT_DIMS),
        )
    }

    pub fn with_dims(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims: dims.max(1),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        let lower = text.to_lowercase();
        for token in lower.split(|c: char| !c.is_alphanumeric()).filter(|t| !t.is_empty()) {
            let digest = Sha256::digest(token.as_bytes());
            let mut head = [0u8; 8];
            head.copy_from_slice(&digest[..8]);
            let h = u64::from_le_bytes(head);
            let bucket = (h % self.dims as u64) as usize;
            let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        normalize_l2(&mut v);
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashedProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::cosine_similarity;

    #[test]
    fn deterministic_and_unit_length() {
        let p = HashedProvider::with_dims("h", 64);
        let a = p.embed_one("The sky is blue.");
        assert_eq!(a, p.embed_one("The sky is blue."));
        assert_eq!(a.len(), 64);
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn shared_words_score_higher() {
        let p = HashedProvider::with_dims("h", 384);
        let q = p.embed_one("What color is the sky?");
        let sky = p.embed_one("The sky is blue.");
        let grass = p.embed_one("Grass grows green in spring.");
        assert!(cosine_similarity(&q, &sky) > cosine_similarity(&q, &grass));
    }

    #[test]
    fn case_and_punctuation_are_ignored() {
        let p = HashedProvider::with_dims("h", 128);
        assert_eq!(p.embed_one("Blue SKY!"), p.embed_one("blue sky"));
    }

    #[test]
    fn empty_text_is_zero_vector() {
        let p = HashedProvider::with_dims("h", 16);
        assert!(p.embed_one("  ...  ").iter().all(|x| *x == 0.0));
    }

    #[test]
    fn config_defaults() {
        let p = HashedProvider::new(&EmbeddingConfig::default());
        assert_eq!(p.dims(), 384);
        assert_eq!(p.model_name(), "hashed-v1");
    }
}
