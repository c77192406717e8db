//! Model host: lazy construction of the inference collaborators and the
//! GPU→CPU out-of-memory fallback state machine.
//!
//! Construction is mutually exclusive: one initialization in flight at a
//! time, concurrent callers block and observe its result. Inference on a
//! ready host runs concurrently across requests; the collaborators themselves
//! take `&mut self`, so calls into each one are serialized here, invisible to
//! callers.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use image::DynamicImage;
use ndarray::Array3;
use thiserror::Error;
use tokio::sync::Mutex;

use faceid_core::detector::{Detector, DetectorError, OnnxDetector};
use faceid_core::embedder::{Embedder, EmbedderError, OnnxEmbedder};
use faceid_core::{Detection, Device, Embedding};

#[derive(Error, Debug)]
pub enum HostError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
    #[error("inference task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl HostError {
    /// Whether this failure looks like GPU memory exhaustion.
    ///
    /// Classification is by message, the only signal the runtime exposes for
    /// allocation failures during session construction.
    pub fn is_gpu_oom(&self) -> bool {
        let message = self.to_string().to_ascii_lowercase();
        message.contains("out of memory")
            || message.contains("cuda_error_out_of_memory")
            || message.contains("cudamalloc")
    }
}

/// Detector and embedder constructed together on one device.
pub struct LoadedModels {
    detector: StdMutex<Box<dyn Detector>>,
    embedder: StdMutex<Box<dyn Embedder>>,
    device: Device,
}

impl LoadedModels {
    pub fn new(detector: Box<dyn Detector>, embedder: Box<dyn Embedder>, device: Device) -> Self {
        Self {
            detector: StdMutex::new(detector),
            embedder: StdMutex::new(embedder),
            device,
        }
    }

    pub fn device(&self) -> Device {
        self.device
    }

    fn run_detect(
        &self,
        image: &DynamicImage,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, DetectorError> {
        // Sessions hold no cross-call state; a poisoned lock is still usable.
        let mut detector = self
            .detector
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        detector.detect(image, confidence_threshold)
    }

    fn run_embed(&self, crops: &[Array3<f32>]) -> Result<Vec<Embedding>, EmbedderError> {
        let mut embedder = self
            .embedder
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        embedder.embed(crops)
    }
}

/// Builds the inference collaborators for a device.
///
/// `load` blocks (file I/O, session compilation) and is always run under
/// `spawn_blocking`.
pub trait ModelProvider: Send + Sync + 'static {
    fn load(&self, device: Device) -> Result<LoadedModels, HostError>;
}

/// Provider backed by the ONNX model files on disk.
pub struct OnnxModelProvider {
    detector_path: String,
    embedder_path: String,
    embedding_dim: usize,
}

impl OnnxModelProvider {
    pub fn new(detector_path: String, embedder_path: String, embedding_dim: usize) -> Self {
        Self {
            detector_path,
            embedder_path,
            embedding_dim,
        }
    }
}

impl ModelProvider for OnnxModelProvider {
    fn load(&self, device: Device) -> Result<LoadedModels, HostError> {
        let detector = OnnxDetector::load(&self.detector_path, device)?;
        let embedder = OnnxEmbedder::load(&self.embedder_path, device, self.embedding_dim)?;
        Ok(LoadedModels::new(
            Box::new(detector),
            Box::new(embedder),
            device,
        ))
    }
}

struct HostState {
    models: Option<Arc<LoadedModels>>,
    /// Device for the next construction attempt. A GPU OOM demotion rewrites
    /// this to CPU, permanently, for every subsequent caller.
    device: Device,
}

/// Owns the detector and embedder, constructing them lazily on first use.
pub struct ModelHost {
    provider: Arc<dyn ModelProvider>,
    state: Mutex<HostState>,
}

impl ModelHost {
    pub fn new(provider: Arc<dyn ModelProvider>, device: Device) -> Self {
        Self {
            provider,
            state: Mutex::new(HostState {
                models: None,
                device,
            }),
        }
    }

    /// Construct the models if they are not ready yet. Idempotent and safe to
    /// call concurrently; only one initialization runs at a time.
    ///
    /// A construction failure attributable to GPU memory exhaustion demotes
    /// the host to CPU and retries exactly once within this call. Any other
    /// failure, including a failure of the CPU retry, surfaces to this caller and
    /// leaves the host uninitialized, so the next call attempts again from
    /// scratch on the current (possibly demoted) device.
    pub async fn ensure_ready(&self) -> Result<Arc<LoadedModels>, HostError> {
        let mut state = self.state.lock().await;
        if let Some(models) = &state.models {
            return Ok(Arc::clone(models));
        }

        let device = state.device;
        match self.load_on(device).await {
            Ok(models) => {
                let models = Arc::new(models);
                state.models = Some(Arc::clone(&models));
                tracing::info!(device = %device, "models ready");
                Ok(models)
            }
            Err(error) if device.is_cuda() && error.is_gpu_oom() => {
                tracing::warn!(%error, "GPU out of memory during model construction; switching to CPU");
                state.device = Device::Cpu;
                let models = Arc::new(self.load_on(Device::Cpu).await?);
                state.models = Some(Arc::clone(&models));
                tracing::info!(device = %Device::Cpu, "models ready after CPU fallback");
                Ok(models)
            }
            Err(error) => Err(error),
        }
    }

    async fn load_on(&self, device: Device) -> Result<LoadedModels, HostError> {
        let provider = Arc::clone(&self.provider);
        tokio::task::spawn_blocking(move || provider.load(device)).await?
    }

    /// Device the next construction attempt uses; reflects a persisted CPU
    /// demotion.
    pub async fn device(&self) -> Device {
        self.state.lock().await.device
    }

    /// Detect faces. Implicitly initializes the models on first use.
    pub async fn detect(
        &self,
        image: DynamicImage,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, HostError> {
        let models = self.ensure_ready().await?;
        tokio::task::spawn_blocking(move || -> Result<Vec<Detection>, HostError> {
            Ok(models.run_detect(&image, confidence_threshold)?)
        })
        .await?
    }

    /// Embed a batch of preprocessed crops. Implicitly initializes the models
    /// on first use. Order-preserving: output `i` belongs to `crops[i]`.
    pub async fn embed(&self, crops: Vec<Array3<f32>>) -> Result<Vec<Embedding>, HostError> {
        let models = self.ensure_ready().await?;
        tokio::task::spawn_blocking(move || -> Result<Vec<Embedding>, HostError> {
            Ok(models.run_embed(&crops)?)
        })
        .await?
    }
}
