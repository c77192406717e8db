//! Recognition pipeline: detect → crop → embed → match.
//!
//! The six operations the external dispatcher invokes. Every operation
//! returns a structured envelope rather than an error: failures are caught
//! at this boundary and never leak into other in-flight requests.

use std::sync::Arc;
use std::time::Instant;

use image::DynamicImage;
use ndarray::Array3;
use thiserror::Error;

use faceid_core::preprocess::{crop_face, decode_image, embedder_input};
use faceid_core::{Detection, Embedding};

use crate::cache::GalleryCache;
use crate::host::{HostError, ModelHost};
use crate::results::{
    CompareResult, DeleteResult, DetectResult, DetectedFace, ListResult, Prediction,
    RecognizeResult, RegisterResult,
};
use crate::store::{GalleryStore, StoreError, Upsert};

/// Detection threshold applied to registration images.
const REGISTER_DETECT_THRESHOLD: f32 = 0.55;
/// Detection threshold applied to both images of a match call.
const MATCH_DETECT_THRESHOLD: f32 = 0.8;
/// Default `min_confidence` for detect/recognize when the caller passes none.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.67;
/// Upper bound on crops per embedding inference call.
const EMBED_BATCH_SIZE: usize = 10;
/// Identity reported when no gallery row passes the threshold.
const UNKNOWN_IDENTITY: &str = "unknown";

#[derive(Error, Debug)]
enum PipelineError {
    #[error("unable to load the face models")]
    ModelUnavailable(#[source] HostError),
    #[error("the image provided was of an unknown type")]
    InvalidImage(#[source] image::ImageError),
    #[error("storage: {0}")]
    Store(#[from] StoreError),
    #[error("inference: {0}")]
    Inference(HostError),
    #[error("internal: {0}")]
    Internal(String),
}

impl PipelineError {
    /// (human-readable message, diagnostic detail) for a failure envelope.
    fn envelope_parts(&self) -> (String, String) {
        (self.to_string(), format!("{self:?}"))
    }
}

/// Map cosine similarity [-1, 1] to a match confidence in [0, 1].
///
/// Tied to the cosine metric: an embedder scored in a different metric space
/// needs this re-derived, not reused.
fn rescale_similarity(similarity: f32) -> f32 {
    (similarity + 1.0) / 2.0
}

/// Deterministic detection order: descending confidence, ties broken by
/// ascending `x_min`, then `y_min`.
fn sort_detections(detections: &mut [Detection]) {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(
                a.x_min
                    .partial_cmp(&b.x_min)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(
                a.y_min
                    .partial_cmp(&b.y_min)
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
    });
}

/// Orchestrates the model host, the gallery cache and the persistent store.
pub struct RecognitionPipeline {
    host: Arc<ModelHost>,
    cache: Arc<GalleryCache>,
    store: Arc<dyn GalleryStore>,
}

impl RecognitionPipeline {
    pub fn new(
        host: Arc<ModelHost>,
        cache: Arc<GalleryCache>,
        store: Arc<dyn GalleryStore>,
    ) -> Self {
        Self { host, cache, store }
    }

    async fn ready(&self) -> Result<(), PipelineError> {
        self.host
            .ensure_ready()
            .await
            .map(|_| ())
            .map_err(PipelineError::ModelUnavailable)
    }

    async fn timed_detect(
        &self,
        image: DynamicImage,
        threshold: f32,
        inference_ms: &mut u64,
    ) -> Result<Vec<Detection>, PipelineError> {
        let start = Instant::now();
        let result = self.host.detect(image, threshold).await;
        *inference_ms += start.elapsed().as_millis() as u64;
        result.map_err(PipelineError::Inference)
    }

    async fn timed_embed(
        &self,
        crops: Vec<Array3<f32>>,
        inference_ms: &mut u64,
    ) -> Result<Vec<Embedding>, PipelineError> {
        let start = Instant::now();
        let result = self.host.embed(crops).await;
        *inference_ms += start.elapsed().as_millis() as u64;
        result.map_err(PipelineError::Inference)
    }

    /// Detect faces in an image.
    pub async fn detect(&self, image_bytes: &[u8], min_confidence: Option<f32>) -> DetectResult {
        match self.detect_inner(image_bytes, min_confidence).await {
            Ok(result) => result,
            Err(error) => {
                let (message, detail) = error.envelope_parts();
                DetectResult::failure(message, detail)
            }
        }
    }

    async fn detect_inner(
        &self,
        image_bytes: &[u8],
        min_confidence: Option<f32>,
    ) -> Result<DetectResult, PipelineError> {
        self.ready().await?;
        let threshold = min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE);
        let image = decode_image(image_bytes).map_err(PipelineError::InvalidImage)?;

        let mut inference_ms = 0u64;
        let mut detections = self.timed_detect(image, threshold, &mut inference_ms).await?;
        sort_detections(&mut detections);

        let predictions: Vec<DetectedFace> =
            detections.iter().map(DetectedFace::from_detection).collect();
        let count = predictions.len();
        let message = if count == 1 {
            "Found 1 face".to_string()
        } else {
            format!("Found {count} faces")
        };

        Ok(DetectResult {
            success: true,
            predictions,
            count,
            message,
            error: None,
            inference_ms,
        })
    }

    /// Register an identity from one or more images.
    ///
    /// Each image contributes at most one face, the first detection in
    /// output order. All crops are embedded in one batch and averaged into a
    /// single representative embedding, then upserted. The cache is refreshed
    /// synchronously so an immediately following recognize sees the identity.
    pub async fn register(&self, identity_id: &str, images: &[Vec<u8>]) -> RegisterResult {
        match self.register_inner(identity_id, images).await {
            Ok(result) => result,
            Err(error) => {
                let (message, detail) = error.envelope_parts();
                RegisterResult::failure(message, detail)
            }
        }
    }

    async fn register_inner(
        &self,
        identity_id: &str,
        images: &[Vec<u8>],
    ) -> Result<RegisterResult, PipelineError> {
        self.ready().await?;

        let mut inference_ms = 0u64;
        let mut crops: Vec<Array3<f32>> = Vec::new();

        for bytes in images {
            let image = decode_image(bytes).map_err(PipelineError::InvalidImage)?;
            let mut detections = self
                .timed_detect(image.clone(), REGISTER_DETECT_THRESHOLD, &mut inference_ms)
                .await?;
            sort_detections(&mut detections);

            // At most one face per registration image: the first detection in
            // output order, remaining detections ignored.
            let Some(first) = detections.first() else {
                continue;
            };
            if let Some(crop) = crop_face(&image, first) {
                crops.push(embedder_input(&crop));
            }
        }

        if crops.is_empty() {
            return Ok(RegisterResult::no_face(inference_ms));
        }

        let embeddings = self.timed_embed(crops, &mut inference_ms).await?;
        let representative = Embedding::mean(&embeddings).ok_or_else(|| {
            PipelineError::Internal("embedder returned an empty or ragged batch".to_string())
        })?;

        let outcome = self.store.upsert(identity_id, &representative).await?;

        // Read-your-writes: refresh before returning. A failed refresh leaves
        // the cache degraded on its last-known-good snapshot; the write is
        // durable either way, so the registration still succeeds.
        if let Err(error) = self.cache.refresh().await {
            tracing::warn!(%error, identity = identity_id, "post-register cache refresh failed");
        }

        let message = match outcome {
            Upsert::Inserted => "face added",
            Upsert::Updated => "face updated",
        };
        tracing::info!(identity = identity_id, message, "identity registered");

        Ok(RegisterResult {
            success: true,
            message: message.to_string(),
            error: None,
            inference_ms,
        })
    }

    /// Recognize every face in an image against the registered gallery.
    pub async fn recognize(
        &self,
        image_bytes: &[u8],
        min_confidence: Option<f32>,
    ) -> RecognizeResult {
        match self.recognize_inner(image_bytes, min_confidence).await {
            Ok(result) => result,
            Err(error) => {
                let (message, detail) = error.envelope_parts();
                RecognizeResult::failure(message, detail)
            }
        }
    }

    async fn recognize_inner(
        &self,
        image_bytes: &[u8],
        min_confidence: Option<f32>,
    ) -> Result<RecognizeResult, PipelineError> {
        self.ready().await?;
        let threshold = min_confidence.unwrap_or(DEFAULT_MIN_CONFIDENCE);

        // One snapshot for the whole call; a background refresh completing
        // mid-call cannot produce mixed results.
        let snapshot = self.cache.current().await;

        let image = decode_image(image_bytes).map_err(PipelineError::InvalidImage)?;

        let mut inference_ms = 0u64;
        let mut detections = self
            .timed_detect(image.clone(), threshold, &mut inference_ms)
            .await?;
        sort_detections(&mut detections);

        if detections.is_empty() {
            return Ok(RecognizeResult::no_face(inference_ms));
        }

        // Detections are still reported against an empty gallery so the
        // caller learns face locations.
        if snapshot.is_empty() {
            let predictions: Vec<Prediction> =
                detections.iter().map(unknown_prediction).collect();
            let count = predictions.len();
            return Ok(RecognizeResult {
                success: true,
                predictions,
                count,
                message: "No known faces".to_string(),
                error: None,
                inference_ms,
            });
        }

        let mut crops: Vec<Array3<f32>> = Vec::new();
        let mut cropped: Vec<Detection> = Vec::new();
        for det in &detections {
            if let Some(crop) = crop_face(&image, det) {
                crops.push(embedder_input(&crop));
                cropped.push(det.clone());
            }
        }
        if crops.is_empty() {
            return Ok(RecognizeResult::no_face(inference_ms));
        }

        // Bounded batches, concatenated in detection order.
        let mut embeddings: Vec<Embedding> = Vec::with_capacity(crops.len());
        for chunk in crops.chunks(EMBED_BATCH_SIZE) {
            let batch = self.timed_embed(chunk.to_vec(), &mut inference_ms).await?;
            embeddings.extend(batch);
        }
        if embeddings.len() != cropped.len() {
            return Err(PipelineError::Internal(format!(
                "embedder returned {} embeddings for {} crops",
                embeddings.len(),
                cropped.len()
            )));
        }

        let mut predictions = Vec::with_capacity(cropped.len());
        let mut found_known = false;

        for (embedding, det) in embeddings.iter().zip(&cropped) {
            let mut best_row = 0usize;
            let mut best_similarity = f32::NEG_INFINITY;
            for (row, gallery_embedding) in snapshot.embeddings.iter().enumerate() {
                let similarity = embedding.cosine_similarity(gallery_embedding);
                if similarity > best_similarity {
                    best_similarity = similarity;
                    best_row = row;
                }
            }

            let match_confidence = rescale_similarity(best_similarity);
            // Inclusive comparison: a confidence exactly at the threshold passes.
            if match_confidence >= threshold {
                found_known = true;
                let (x_min, y_min, x_max, y_max) = det.clamped_bounds();
                predictions.push(Prediction {
                    identity_id: snapshot.identities[best_row].clone(),
                    confidence: match_confidence,
                    x_min,
                    y_min,
                    x_max,
                    y_max,
                });
            } else {
                predictions.push(unknown_prediction(det));
            }
        }

        let count = predictions.len();
        let message = if found_known {
            "A face was recognised"
        } else {
            "No known faces"
        };

        Ok(RecognizeResult {
            success: true,
            predictions,
            count,
            message: message.to_string(),
            error: None,
            inference_ms,
        })
    }

    /// Compare the first face of each image, returning the rescaled cosine
    /// similarity in [0, 1]. The caller interprets the score.
    pub async fn match_faces(&self, image_a: &[u8], image_b: &[u8]) -> CompareResult {
        match self.match_inner(image_a, image_b).await {
            Ok(result) => result,
            Err(error) => {
                let (message, detail) = error.envelope_parts();
                CompareResult::failure(message, detail)
            }
        }
    }

    async fn match_inner(
        &self,
        image_a: &[u8],
        image_b: &[u8],
    ) -> Result<CompareResult, PipelineError> {
        self.ready().await?;

        let mut inference_ms = 0u64;
        let mut pair: Vec<Array3<f32>> = Vec::with_capacity(2);

        for bytes in [image_a, image_b] {
            let image = decode_image(bytes).map_err(PipelineError::InvalidImage)?;
            let mut detections = self
                .timed_detect(image.clone(), MATCH_DETECT_THRESHOLD, &mut inference_ms)
                .await?;
            sort_detections(&mut detections);

            // Same first-detection policy as register.
            let crop = detections.first().and_then(|det| crop_face(&image, det));
            match crop {
                Some(crop) => pair.push(embedder_input(&crop)),
                None => return Ok(CompareResult::no_face(inference_ms)),
            }
        }

        let embeddings = self.timed_embed(pair, &mut inference_ms).await?;
        let [a, b] = embeddings.as_slice() else {
            return Err(PipelineError::Internal(format!(
                "embedder returned {} embeddings for a pair of crops",
                embeddings.len()
            )));
        };

        let similarity = rescale_similarity(a.cosine_similarity(b));

        Ok(CompareResult {
            success: true,
            similarity: Some(similarity),
            message: "Faces compared".to_string(),
            error: None,
            inference_ms,
        })
    }

    /// All registered identity ids.
    pub async fn list(&self) -> ListResult {
        match self.store.list_ids().await {
            Ok(identities) => ListResult {
                success: true,
                identities,
                error: None,
            },
            Err(error) => {
                let error = PipelineError::from(error);
                let (_, detail) = error.envelope_parts();
                ListResult::failure(detail)
            }
        }
    }

    /// Remove an identity from the gallery.
    ///
    /// The cache is refreshed synchronously so an immediately following
    /// recognize no longer sees the identity.
    pub async fn delete(&self, identity_id: &str) -> DeleteResult {
        let removed = match self.store.delete(identity_id).await {
            Ok(removed) => removed,
            Err(error) => {
                let error = PipelineError::from(error);
                let (message, detail) = error.envelope_parts();
                return DeleteResult::failure(message, detail);
            }
        };

        if let Err(error) = self.cache.refresh().await {
            tracing::warn!(%error, identity = identity_id, "post-delete cache refresh failed");
        }

        let message = if removed {
            "face deleted"
        } else {
            "no such identity"
        };
        tracing::info!(identity = identity_id, removed, "identity delete");

        DeleteResult {
            success: true,
            removed,
            message: message.to_string(),
            error: None,
        }
    }
}

/// Prediction for a face no gallery row claimed: identity "unknown",
/// confidence zero, box still reported.
fn unknown_prediction(det: &Detection) -> Prediction {
    let (x_min, y_min, x_max, y_max) = det.clamped_bounds();
    Prediction {
        identity_id: UNKNOWN_IDENTITY.to_string(),
        confidence: 0.0,
        x_min,
        y_min,
        x_max,
        y_max,
    }
}
