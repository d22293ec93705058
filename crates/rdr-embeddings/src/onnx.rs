//! ONNX Runtime encoder (feature-gated behind `onnx`).
//!
//! Loads `tokenizer.json` + `model.onnx` from a local model directory,
//! tokenizes with `tokenizers`, runs inference via `ort`, then mean-pools
//! the token embeddings over the attention mask.

use std::path::Path;

use async_trait::async_trait;
use tracing::info;

use rdr_core::{Error, Result};

use crate::encoder::TextEncoder;

/// Combined session + tokenizer state behind a single mutex.
struct InferenceState {
    session: ort::session::Session,
    tokenizer: tokenizers::Tokenizer,
}

pub struct OnnxEncoder {
    dims: usize,
    state: parking_lot::Mutex<Option<InferenceState>>,
}

impl OnnxEncoder {
    /// Load the model files from `model_dir` (blocking work runs off the
    /// async threads). `dims` must match the model's hidden size.
    pub async fn load(model_dir: &Path, dims: usize) -> Result<Self> {
        let dir = model_dir.to_path_buf();
        let state = tokio::task::spawn_blocking(move || {
            load_inner(&dir).map_err(|e| Error::Embedding(e.to_string()))
        })
        .await
        .map_err(|e| Error::Embedding(format!("join: {e}")))??;

        info!(model_dir = %model_dir.display(), "ONNX encoder ready");
        Ok(Self {
            dims,
            state: parking_lot::Mutex::new(Some(state)),
        })
    }
}

fn load_inner(
    dir: &Path,
) -> std::result::Result<InferenceState, Box<dyn std::error::Error + Send + Sync>> {
    let tokenizer = tokenizers::Tokenizer::from_file(dir.join("tokenizer.json"))
        .map_err(|e| format!("tokenizer load: {e}"))?;

    let session = ort::session::Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(dir.join("model.onnx"))?;

    Ok(InferenceState { session, tokenizer })
}

fn run_inference(
    session: &mut ort::session::Session,
    tokenizer: &tokenizers::Tokenizer,
    texts: &[String],
    dims: usize,
) -> Result<Vec<Vec<f32>>> {
    run_inference_inner(session, tokenizer, texts, dims)
        .map_err(|e| Error::Embedding(e.to_string()))
}

fn run_inference_inner(
    session: &mut ort::session::Session,
    tokenizer: &tokenizers::Tokenizer,
    texts: &[String],
    dims: usize,
) -> std::result::Result<Vec<Vec<f32>>, Box<dyn std::error::Error + Send + Sync>> {
    if texts.is_empty() {
        return Ok(Vec::new());
    }

    let encodings = tokenizer.encode_batch(texts.to_vec(), true)?;

    let max_len = encodings
        .iter()
        .map(|e| e.get_ids().len())
        .max()
        .unwrap_or(0);
    if max_len == 0 {
        return Err("empty tokenization".into());
    }

    let batch_size = texts.len();

    let mut input_ids = vec![0i64; batch_size * max_len];
    let mut attention_mask = vec![0i64; batch_size * max_len];

    for (i, enc) in encodings.iter().enumerate() {
        let offset = i * max_len;
        for (j, &id) in enc.get_ids().iter().enumerate() {
            input_ids[offset + j] = i64::from(id);
        }
        for (j, &m) in enc.get_attention_mask().iter().enumerate() {
            attention_mask[offset + j] = i64::from(m);
        }
    }

    #[allow(clippy::cast_possible_wrap)]
    let shape = vec![batch_size as i64, max_len as i64];

    let input_ids_tensor = ort::value::Tensor::from_array((shape.clone(), input_ids))?;
    let attention_mask_tensor = ort::value::Tensor::from_array((shape, attention_mask.clone()))?;

    let outputs = session.run(ort::inputs![input_ids_tensor, attention_mask_tensor])?;

    let (output_shape, output_data) = outputs[0].try_extract_tensor::<f32>()?;

    #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    let out_dims: Vec<usize> = output_shape.iter().map(|&d| d as usize).collect();
    if out_dims.len() != 3 || out_dims[0] != batch_size || out_dims[1] != max_len {
        return Err(format!("unexpected output shape: {output_shape:?}").into());
    }
    let hidden = out_dims[2];
    if hidden != dims {
        return Err(format!("model hidden size {hidden} does not match configured {dims}").into());
    }

    // Mean pooling over the attention mask.
    let mut results = Vec::with_capacity(batch_size);
    for i in 0..batch_size {
        let mut pooled = vec![0f32; hidden];
        let mut count = 0f32;
        for j in 0..max_len {
            if attention_mask[i * max_len + j] == 0 {
                continue;
            }
            count += 1.0;
            let base = (i * max_len + j) * hidden;
            for (k, slot) in pooled.iter_mut().enumerate() {
                *slot += output_data[base + k];
            }
        }
        if count > 0.0 {
            for slot in pooled.iter_mut() {
                *slot /= count;
            }
        }
        results.push(pooled);
    }

    Ok(results)
}

#[async_trait]
impl TextEncoder for OnnxEncoder {
    async fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        // Take state out of the mutex (brief lock), run inference on a
        // blocking thread, then restore it. The state stays valid even when
        // inference fails.
        let mut state = self
            .state
            .lock()
            .take()
            .ok_or_else(|| Error::Embedding("inference already in progress".to_string()))?;
        let texts = texts.to_vec();
        let dims = self.dims;

        let (result, returned_state) = tokio::task::spawn_blocking(move || {
            let r = run_inference(&mut state.session, &state.tokenizer, &texts, dims);
            (r, state)
        })
        .await
        .map_err(|e| Error::Embedding(format!("join: {e}")))?;

        *self.state.lock() = Some(returned_state);
        result
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}
