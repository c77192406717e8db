//! faceid-core — Face detection and embedding primitives.
//!
//! SCRFD face detection and ArcFace-style embedding extraction, both running
//! via ONNX Runtime, plus the shared types used by the faceid service.

pub mod detector;
pub mod embedder;
pub mod preprocess;
pub mod types;

pub use detector::{Detector, OnnxDetector};
pub use embedder::{Embedder, OnnxEmbedder};
pub use types::{Detection, Device, Embedding};
