//! Face embedding extraction via ONNX Runtime.
//!
//! Runs an ArcFace-style recognition model over batches of preprocessed
//! 112×112 face crops and returns one fixed-length vector per crop.

use ndarray::{Array3, Array4, Axis};
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::preprocess::EMBED_INPUT_SIZE;
use crate::types::{Device, Embedding};

/// Default embedding dimensionality (w600k_r50 and glint360k_r100 exports).
pub const DEFAULT_EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0} — download from insightface and place in the model dir")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Batched embedding extraction: batch in, batch out, order-preserving.
///
/// `output[i]` is the embedding of `crops[i]`. Every crop in one call must be
/// the same preprocessed shape. Embeddings are returned exactly as the network
/// produced them; callers relying on cosine similarity need no normalization.
pub trait Embedder: Send {
    fn embed(&mut self, crops: &[Array3<f32>]) -> Result<Vec<Embedding>, EmbedderError>;
}

/// ONNX Runtime face embedder.
pub struct OnnxEmbedder {
    session: Session,
    embedding_dim: usize,
}

impl OnnxEmbedder {
    /// Load the embedding ONNX model from the given path onto the given device.
    pub fn load(
        model_path: &str,
        device: Device,
        embedding_dim: usize,
    ) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let mut builder = Session::builder()?.with_intra_threads(2)?;
        if device.is_cuda() {
            builder = builder.with_execution_providers([CUDAExecutionProvider::default()
                .build()
                .error_on_failure()])?;
        }
        let session = builder.commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            device = %device,
            embedding_dim,
            "loaded embedding model"
        );

        Ok(Self {
            session,
            embedding_dim,
        })
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&mut self, crops: &[Array3<f32>]) -> Result<Vec<Embedding>, EmbedderError> {
        if crops.is_empty() {
            return Ok(Vec::new());
        }

        for crop in crops {
            if crop.shape() != [3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE] {
                return Err(EmbedderError::InferenceFailed(format!(
                    "crop shape {:?} does not match embedder input [3, {EMBED_INPUT_SIZE}, {EMBED_INPUT_SIZE}]",
                    crop.shape()
                )));
            }
        }

        let views: Vec<_> = crops.iter().map(|c| c.view()).collect();
        let batch: Array4<f32> = ndarray::stack(Axis(0), &views)
            .map_err(|e| EmbedderError::InferenceFailed(format!("batch assembly: {e}")))?;

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(batch.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let expected = crops.len() * self.embedding_dim;
        if raw.len() != expected {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {expected} output values ({} crops × {} dims), got {}",
                crops.len(),
                self.embedding_dim,
                raw.len()
            )));
        }

        Ok(raw
            .chunks_exact(self.embedding_dim)
            .map(|chunk| Embedding::new(chunk.to_vec()))
            .collect())
    }
}
