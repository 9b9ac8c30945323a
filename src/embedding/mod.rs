//! Text-to-vector embedding pipeline.
//!
//! Provides the [`EmbeddingProvider`] trait, the ONNX-backed [`local`] provider
//! (all-MiniLM-L6-v2, 384 dimensions, L2-normalized) and the deterministic
//! [`hashing`] provider. The provider is created via [`create_provider`] from
//! configuration; its [`EmbeddingProvider::model_id`] is recorded next to every
//! stored vector so vectors from different models are never compared.

pub mod hashing;
pub mod local;

use anyhow::Result;

/// Number of dimensions in the embedding vectors. Fixed by the `recall_vec` table.
pub const EMBEDDING_DIM: usize = 384;

/// Trait for embedding text into vectors.
///
/// Implementations produce L2-normalized vectors of exactly [`EMBEDDING_DIM`] dimensions.
/// All methods are synchronous; callers in async contexts should use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        texts.iter().map(|t| self.embed(t)).collect()
    }

    /// Stable identity of the model producing the vectors.
    fn model_id(&self) -> &str;

    fn dimensions(&self) -> usize {
        EMBEDDING_DIM
    }
}

/// Create an embedding provider from config.
///
/// `"local"` needs the model files (`blitz model download`); `"hashing"` needs nothing.
pub fn create_provider(
    config: &crate::config::EmbeddingConfig,
) -> Result<Box<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "local" => {
            let provider = local::LocalEmbeddingProvider::new(config)?;
            Ok(Box::new(provider))
        }
        "hashing" => Ok(Box::new(hashing::HashingEmbeddingProvider::new())),
        other => anyhow::bail!("unknown embedding provider: {other}. Supported: local, hashing"),
    }
}

/// `false` for the zero vector, which has no direction to compare by cosine.
pub fn has_direction(v: &[f32]) -> bool {
    v.iter().any(|x| *x != 0.0)
}

/// L2-normalize a vector. Returns the input unchanged if its norm is zero.
pub fn l2_normalize(v: &[f32]) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.iter().map(|x| x / norm).collect()
    } else {
        v.to_vec()
    }
}

/// Cosine similarity; 0.0 when either vector is all zeros or lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    (dot / (norm_a * norm_b)) as f64
}
