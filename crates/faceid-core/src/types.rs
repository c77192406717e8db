use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Device a model is constructed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    Cuda,
}

impl Device {
    pub fn is_cuda(self) -> bool {
        self == Device::Cuda
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cpu => "cpu",
            Device::Cuda => "cuda",
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown device {0:?}, expected \"cpu\" or \"cuda\"")]
pub struct ParseDeviceError(String);

impl FromStr for Device {
    type Err = ParseDeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda),
            other => Err(ParseDeviceError(other.to_string())),
        }
    }
}

/// A detected face in original-image pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
    pub confidence: f32,
}

impl Detection {
    /// Box edges as integer pixel coordinates, clamped to non-negative values.
    pub fn clamped_bounds(&self) -> (i64, i64, i64, i64) {
        let clamp = |v: f32| v.max(0.0) as i64;
        (
            clamp(self.x_min),
            clamp(self.y_min),
            clamp(self.x_max),
            clamp(self.y_max),
        )
    }
}

/// Face embedding vector (512-dimensional for the default embedder).
///
/// Values are stored exactly as the embedding network produced them; nothing
/// here renormalizes. Cosine similarity divides by the operand norms instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

#[derive(Debug, Error)]
pub enum EmbeddingCodecError {
    #[error("embedding blob length {0} is not a multiple of 4")]
    Truncated(usize),
    #[error("embedding blob is empty")]
    Empty,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    ///
    /// A dimension mismatch or a zero-norm operand yields 0.0 rather than
    /// comparing garbage.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return 0.0;
        }

        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }

    /// Elementwise mean of a batch of equally sized embeddings.
    ///
    /// Returns `None` for an empty batch or mismatched dimensions.
    pub fn mean(embeddings: &[Embedding]) -> Option<Embedding> {
        let first = embeddings.first()?;
        let dim = first.dim();
        if embeddings.iter().any(|e| e.dim() != dim) {
            return None;
        }

        let mut sums = vec![0.0f32; dim];
        for embedding in embeddings {
            for (sum, v) in sums.iter_mut().zip(embedding.values.iter()) {
                *sum += v;
            }
        }
        let n = embeddings.len() as f32;
        Some(Embedding::new(sums.into_iter().map(|s| s / n).collect()))
    }

    /// Encode as a little-endian f32 blob for storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a little-endian f32 blob produced by [`to_le_bytes`](Self::to_le_bytes).
    pub fn from_le_bytes(bytes: &[u8]) -> Result<Embedding, EmbeddingCodecError> {
        if bytes.is_empty() {
            return Err(EmbeddingCodecError::Empty);
        }
        if bytes.len() % 4 != 0 {
            return Err(EmbeddingCodecError::Truncated(bytes.len()));
        }

        let values = bytes
            .chunks_exact(4)
            .map(|chunk| {
                let arr: [u8; 4] = chunk.try_into().expect("chunks_exact yields 4-byte chunks");
                f32::from_le_bytes(arr)
            })
            .collect();

        Ok(Embedding::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.cosine_similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.cosine_similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_opposite() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![-1.0, 0.0]);
        assert!((a.cosine_similarity(&b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.cosine_similarity(&b), 0.0);
    }

    #[test]
    fn test_cosine_similarity_dimension_mismatch() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert_eq!(a.cosine_similarity(&b), 0.0);
    }

    #[test]
    fn test_cosine_similarity_unnormalized_inputs() {
        // Same direction, different magnitudes: still similarity 1.
        let a = Embedding::new(vec![2.0, 0.0]);
        let b = Embedding::new(vec![5.0, 0.0]);
        assert!((a.cosine_similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_elementwise() {
        let batch = vec![
            Embedding::new(vec![1.0, 3.0]),
            Embedding::new(vec![3.0, 5.0]),
        ];
        let mean = Embedding::mean(&batch).unwrap();
        assert_eq!(mean.values, vec![2.0, 4.0]);
    }

    #[test]
    fn test_mean_single() {
        let batch = vec![Embedding::new(vec![1.0, 2.0, 3.0])];
        assert_eq!(Embedding::mean(&batch).unwrap().values, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_mean_empty_or_mismatched() {
        assert!(Embedding::mean(&[]).is_none());
        let batch = vec![Embedding::new(vec![1.0]), Embedding::new(vec![1.0, 2.0])];
        assert!(Embedding::mean(&batch).is_none());
    }

    #[test]
    fn test_codec_roundtrip() {
        let e = Embedding::new(vec![0.25, -1.5, 3.75]);
        let decoded = Embedding::from_le_bytes(&e.to_le_bytes()).unwrap();
        assert_eq!(decoded, e);
    }

    #[test]
    fn test_codec_rejects_bad_blobs() {
        assert!(matches!(
            Embedding::from_le_bytes(&[]),
            Err(EmbeddingCodecError::Empty)
        ));
        assert!(matches!(
            Embedding::from_le_bytes(&[0, 0, 0]),
            Err(EmbeddingCodecError::Truncated(3))
        ));
    }

    #[test]
    fn test_clamped_bounds() {
        let det = Detection {
            x_min: -4.2,
            y_min: 10.9,
            x_max: 99.5,
            y_max: -0.1,
            confidence: 0.9,
        };
        assert_eq!(det.clamped_bounds(), (0, 10, 99, 0));
    }

    #[test]
    fn test_device_parsing() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda);
        assert_eq!("gpu".parse::<Device>().unwrap(), Device::Cuda);
        assert!("tpu".parse::<Device>().is_err());
    }
}
