//! Shared test doubles for this crate's unit tests.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use async_trait::async_trait;

use aika_llm::{Embedder, LlmError};

pub const TEST_DIM: usize = 16;

/// Deterministic bag-of-chars embedding: identical text embeds identically,
/// disjoint text lands in different buckets.
pub struct HashEmbedder;

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut v = vec![0.0f32; TEST_DIM];
        for ch in text.chars() {
            let mut h = DefaultHasher::new();
            ch.hash(&mut h);
            v[(h.finish() as usize) % TEST_DIM] += 1.0;
        }
        Ok(v)
    }

    fn dim(&self) -> usize {
        TEST_DIM
    }
}
