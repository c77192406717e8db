//! Structured operation results returned to the external dispatcher.
//!
//! Every envelope carries a success flag, a human-readable message and the
//! accumulated model-inference time; failures additionally carry diagnostic
//! detail in `error`. Box coordinates are integer pixels clamped to ≥ 0.

use serde::{Deserialize, Serialize};

use faceid_core::Detection;

/// A detected face surfaced to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectedFace {
    pub confidence: f32,
    pub x_min: i64,
    pub y_min: i64,
    pub x_max: i64,
    pub y_max: i64,
}

impl DetectedFace {
    pub fn from_detection(det: &Detection) -> Self {
        let (x_min, y_min, x_max, y_max) = det.clamped_bounds();
        Self {
            confidence: det.confidence,
            x_min,
            y_min,
            x_max,
            y_max,
        }
    }
}

/// One recognized (or unknown) face.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prediction {
    pub identity_id: String,
    pub confidence: f32,
    pub x_min: i64,
    pub y_min: i64,
    pub x_max: i64,
    pub y_max: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectResult {
    pub success: bool,
    pub predictions: Vec<DetectedFace>,
    pub count: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub inference_ms: u64,
}

impl DetectResult {
    pub fn failure(message: String, detail: String) -> Self {
        Self {
            success: false,
            predictions: Vec::new(),
            count: 0,
            message,
            error: Some(detail),
            inference_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResult {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub inference_ms: u64,
}

impl RegisterResult {
    pub fn no_face(inference_ms: u64) -> Self {
        Self {
            success: false,
            message: "No face detected".to_string(),
            error: None,
            inference_ms,
        }
    }

    pub fn failure(message: String, detail: String) -> Self {
        Self {
            success: false,
            message,
            error: Some(detail),
            inference_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizeResult {
    pub success: bool,
    pub predictions: Vec<Prediction>,
    pub count: usize,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub inference_ms: u64,
}

impl RecognizeResult {
    pub fn no_face(inference_ms: u64) -> Self {
        Self {
            success: false,
            predictions: Vec::new(),
            count: 0,
            message: "No face found in image".to_string(),
            error: None,
            inference_ms,
        }
    }

    pub fn failure(message: String, detail: String) -> Self {
        Self {
            success: false,
            predictions: Vec::new(),
            count: 0,
            message,
            error: Some(detail),
            inference_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f32>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub inference_ms: u64,
}

impl CompareResult {
    pub fn no_face(inference_ms: u64) -> Self {
        Self {
            success: false,
            similarity: None,
            message: "No face found in one or both images".to_string(),
            error: None,
            inference_ms,
        }
    }

    pub fn failure(message: String, detail: String) -> Self {
        Self {
            success: false,
            similarity: None,
            message,
            error: Some(detail),
            inference_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult {
    pub success: bool,
    pub identities: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ListResult {
    pub fn failure(detail: String) -> Self {
        Self {
            success: false,
            identities: Vec::new(),
            error: Some(detail),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResult {
    pub success: bool,
    /// Whether a record for the identity existed.
    pub removed: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeleteResult {
    pub fn failure(message: String, detail: String) -> Self {
        Self {
            success: false,
            removed: false,
            message,
            error: Some(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_envelope_omits_error_field() {
        let result = DetectResult {
            success: true,
            predictions: vec![DetectedFace {
                confidence: 0.92,
                x_min: 10,
                y_min: 20,
                x_max: 110,
                y_max: 140,
            }],
            count: 1,
            message: "Found 1 face".to_string(),
            error: None,
            inference_ms: 17,
        };

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["count"], 1);
        assert_eq!(json["predictions"][0]["x_min"], 10);
        assert_eq!(json["inference_ms"], 17);
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_failure_envelope_carries_detail() {
        let result = RecognizeResult::failure(
            "storage: database gone".to_string(),
            "Database(...)".to_string(),
        );
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["success"], false);
        assert!(json["error"].as_str().unwrap().contains("Database"));
    }

    #[test]
    fn test_clamped_prediction_bounds() {
        let det = Detection {
            x_min: -12.0,
            y_min: -3.5,
            x_max: 50.9,
            y_max: 80.2,
            confidence: 0.8,
        };
        let face = DetectedFace::from_detection(&det);
        assert_eq!((face.x_min, face.y_min, face.x_max, face.y_max), (0, 0, 50, 80));
    }
}
