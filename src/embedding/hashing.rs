//! Deterministic feature-hashing embedder.
//!
//! Hashes lowercase word unigrams, word bigrams and character trigrams into
//! [`EMBEDDING_DIM`] signed buckets, then L2-normalizes. No model files, no
//! randomness: the same text always maps to the same vector, which is all the
//! recall chain needs in development and tests.

use anyhow::Result;

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};

const MODEL_ID: &str = "blitz-hashing-v1";

#[derive(Debug, Default, Clone)]
pub struct HashingEmbeddingProvider;

impl HashingEmbeddingProvider {
    pub fn new() -> Self {
        Self
    }
}

impl EmbeddingProvider for HashingEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        let words: Vec<String> = text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        for word in &words {
            add_feature(&mut v, word, 1.0);
            let padded: Vec<char> = format!(" {word} ").chars().collect();
            for tri in padded.windows(3) {
                add_feature(&mut v, &tri.iter().collect::<String>(), 0.5);
            }
        }
        for pair in words.windows(2) {
            add_feature(&mut v, &format!("{} {}", pair[0], pair[1]), 0.75);
        }

        Ok(l2_normalize(&v))
    }

    fn model_id(&self) -> &str {
        MODEL_ID
    }
}

fn add_feature(v: &mut [f32], feature: &str, weight: f32) {
    let h = fnv1a(feature.as_bytes());
    let bucket = (h % EMBEDDING_DIM as u64) as usize;
    let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
    v[bucket] += sign * weight;
}

// Stable across platforms and releases, unlike `DefaultHasher`.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for b in bytes {
        hash ^= *b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}
