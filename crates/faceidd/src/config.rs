//! Daemon configuration.
//!
//! Built-in defaults, overridden by an optional TOML file (`FACEID_CONFIG`),
//! overridden in turn by individual `FACEID_*` environment variables.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use faceid_core::embedder::DEFAULT_EMBEDDING_DIM;
use faceid_core::Device;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Device(#[from] faceid_core::types::ParseDeviceError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device requested for model construction. A GPU out-of-memory failure
    /// at runtime demotes the host to CPU regardless of this setting.
    pub device: Device,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    pub detector_model: String,
    pub embedder_model: String,
    /// Path to the SQLite gallery database.
    pub db_path: PathBuf,
    pub embedding_dim: usize,
    /// Seconds between background gallery refreshes.
    pub refresh_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("faceid");

        Self {
            device: Device::Cpu,
            model_dir: PathBuf::from("models"),
            detector_model: "det_10g.onnx".to_string(),
            embedder_model: "w600k_r50.onnx".to_string(),
            db_path: data_dir.join("gallery.db"),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            refresh_interval_secs: 5,
        }
    }
}

impl Config {
    /// Load configuration: defaults ← `FACEID_CONFIG` TOML file ← env vars.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("FACEID_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        if let Ok(v) = std::env::var("FACEID_DEVICE") {
            config.device = v.parse()?;
        }
        if let Ok(v) = std::env::var("FACEID_MODEL_DIR") {
            config.model_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FACEID_DB_PATH") {
            config.db_path = PathBuf::from(v);
        }
        config.embedding_dim = env_usize("FACEID_EMBEDDING_DIM", config.embedding_dim);
        config.refresh_interval_secs =
            env_u64("FACEID_REFRESH_INTERVAL_SECS", config.refresh_interval_secs);

        Ok(config)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Path to the face detection model.
    pub fn detector_model_path(&self) -> String {
        self.model_dir
            .join(&self.detector_model)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the embedding model.
    pub fn embedder_model_path(&self) -> String {
        self.model_dir
            .join(&self.embedder_model)
            .to_string_lossy()
            .into_owned()
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
