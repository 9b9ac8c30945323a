//! ONNX Runtime embedding provider (all-MiniLM-L6-v2).

use std::sync::Mutex;

use anyhow::{Context, Result};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::{Encoding, Tokenizer};

use super::{l2_normalize, EmbeddingProvider, EMBEDDING_DIM};
use crate::config::EmbeddingConfig;

/// all-MiniLM-L6-v2 was trained at 256 tokens; questions are far shorter.
const MAX_SEQ_LEN: usize = 256;

pub const MODEL_FILE: &str = "model.onnx";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

pub struct LocalEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    model_id: String,
}

// Safety: Tokenizer is Send+Sync. Session is only reached through the Mutex.
unsafe impl Send for LocalEmbeddingProvider {}
unsafe impl Sync for LocalEmbeddingProvider {}

/// Flattened `[batch, seq]` inputs for one inference call.
struct BatchInputs {
    batch: usize,
    seq: usize,
    ids: Vec<i64>,
    mask: Vec<i64>,
}

impl BatchInputs {
    fn from_encodings(encodings: &[Encoding]) -> Self {
        let batch = encodings.len();
        let seq = encodings.first().map_or(0, |e| e.get_ids().len());
        let ids = encodings
            .iter()
            .flat_map(|e| e.get_ids().iter().map(|&id| id as i64))
            .collect();
        let mask = encodings
            .iter()
            .flat_map(|e| e.get_attention_mask().iter().map(|&m| m as i64))
            .collect();
        Self { batch, seq, ids, mask }
    }

    fn shape(&self) -> Vec<i64> {
        vec![self.batch as i64, self.seq as i64]
    }
}

impl LocalEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let cache_dir = crate::config::expand_tilde(&config.cache_dir);
        let model_path = cache_dir.join(MODEL_FILE);
        let tokenizer_path = cache_dir.join(TOKENIZER_FILE);

        anyhow::ensure!(
            model_path.exists() && tokenizer_path.exists(),
            "embedding model files missing under {}. Run `blitz model download` first, \
             or set embedding.provider = \"hashing\".",
            cache_dir.display()
        );

        let session = Session::builder()?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)
            .context("failed to load ONNX model")?;

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: MAX_SEQ_LEN,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to set truncation: {e}"))?;
        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        tracing::info!(model = %config.model, dir = %cache_dir.display(), "embedding model loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            model_id: config.model.clone(),
        })
    }

    fn run(&self, inputs: &BatchInputs) -> Result<(Vec<i64>, Vec<f32>)> {
        let shape = inputs.shape();
        let ids = Tensor::from_array((shape.clone(), inputs.ids.clone().into_boxed_slice()))?;
        let mask = Tensor::from_array((shape.clone(), inputs.mask.clone().into_boxed_slice()))?;
        // single-segment input
        let token_types = Tensor::from_array((
            shape,
            vec![0i64; inputs.batch * inputs.seq].into_boxed_slice(),
        ))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| anyhow::anyhow!("session lock poisoned: {e}"))?;
        let outputs = session.run(ort::inputs! {
            "input_ids" => ids,
            "attention_mask" => mask,
            "token_type_ids" => token_types,
        })?;

        // Output naming differs between exports.
        let hidden = outputs
            .get("token_embeddings")
            .or_else(|| outputs.get("last_hidden_state"))
            .unwrap_or_else(|| &outputs[0]);
        let (dims, data) = hidden
            .try_extract_tensor::<f32>()
            .context("failed to extract token embeddings")?;

        let dims: Vec<i64> = dims.iter().copied().collect();
        anyhow::ensure!(
            dims.len() == 3 && dims[2] == EMBEDDING_DIM as i64,
            "unexpected token embedding shape {dims:?}, expected [batch, seq, {EMBEDDING_DIM}]"
        );
        Ok((dims, data.to_vec()))
    }
}

/// Attention-masked mean over the sequence axis, one vector per batch row.
fn mean_pool(inputs: &BatchInputs, dims: &[i64], data: &[f32]) -> Vec<Vec<f32>> {
    let out_seq = dims[1] as usize;
    let hidden = dims[2] as usize;

    (0..inputs.batch)
        .map(|b| {
            let mut sum = vec![0.0f32; hidden];
            let mut count = 0.0f32;
            for s in 0..out_seq {
                let weight = inputs.mask[b * inputs.seq + s] as f32;
                if weight == 0.0 {
                    continue;
                }
                let row = &data[(b * out_seq + s) * hidden..][..hidden];
                for (acc, x) in sum.iter_mut().zip(row) {
                    *acc += x * weight;
                }
                count += weight;
            }
            if count > 0.0 {
                sum.iter_mut().for_each(|x| *x /= count);
            }
            l2_normalize(&sum)
        })
        .collect()
}

impl EmbeddingProvider for LocalEmbeddingProvider {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])?
            .pop()
            .context("embedding batch returned no vector")
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("tokenization failed: {e}"))?;
        let inputs = BatchInputs::from_encodings(&encodings);
        let (dims, data) = self.run(&inputs)?;
        Ok(mean_pool(&inputs, &dims, &data))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}
