//! Tunable parameters for the fingerprint and live-face pipelines.
//!
//! Every threshold lives here with its default, and is passed explicitly
//! into the component that uses it.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Logical name of the persisted fingerprint model, shared by trainer and verifier.
pub const FINGERPRINT_ARTIFACT_NAME: &str = "fingerprint_verifier.safetensors";

/// Fingerprint preprocessing and verification parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Side length of the square tensor fed to the embedder.
    pub input_size: usize,
    /// Length of the embedding produced by each tower.
    pub embedding_dim: usize,
    /// Score at or above which a pair is accepted.
    pub threshold: f32,
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            embedding_dim: 128,
            threshold: 0.5,
        }
    }
}

/// Offline training parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub batch_size: usize,
    pub epochs: usize,
    /// Fraction of the (shuffled) pair list held out for validation.
    pub validation_split: f32,
    pub learning_rate: f64,
    /// Seed for pair sampling, the validation shuffle, and epoch shuffles.
    pub seed: u64,
    /// Where the fitted parameters are written.
    pub artifact_path: PathBuf,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            epochs: 15,
            validation_split: 0.2,
            learning_rate: 1e-3,
            seed: 42,
            artifact_path: PathBuf::from(FINGERPRINT_ARTIFACT_NAME),
        }
    }
}

/// Live camera session thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveMatchConfig {
    /// Maximum embedding distance for a gallery hit.
    pub match_threshold: f32,
    /// Votes an identity needs before attendance can be marked.
    pub required_frames: u32,
    /// Eye-aspect-ratio below which an eye counts as closed.
    pub eye_ar_threshold: f32,
    /// Minimum run of closed frames that counts as a blink on reopen.
    pub eye_ar_consec_frames: u32,
    /// Scale applied to the frame before embedding extraction.
    pub downscale: f32,
    /// Consecutive frame read failures that end the session.
    pub max_read_failures: u32,
}

impl Default for LiveMatchConfig {
    fn default() -> Self {
        Self {
            match_threshold: 0.55,
            required_frames: 3,
            eye_ar_threshold: 0.20,
            eye_ar_consec_frames: 1,
            downscale: 0.25,
            max_read_failures: 5,
        }
    }
}

/// Locations of the ONNX models used by the live face backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FaceModelConfig {
    pub model_dir: PathBuf,
    pub detector_file: String,
    pub landmark_file: String,
    pub recognizer_file: String,
    /// Square crop size expected by the 68-point landmark model.
    pub landmark_input_size: usize,
}

impl Default for FaceModelConfig {
    fn default() -> Self {
        Self {
            model_dir: default_model_dir(),
            detector_file: "det_10g.onnx".to_string(),
            landmark_file: "landmarks_68.onnx".to_string(),
            recognizer_file: "w600k_r50.onnx".to_string(),
            landmark_input_size: 112,
        }
    }
}

impl FaceModelConfig {
    pub fn detector_path(&self) -> PathBuf {
        self.model_dir.join(&self.detector_file)
    }

    pub fn landmark_path(&self) -> PathBuf {
        self.model_dir.join(&self.landmark_file)
    }

    pub fn recognizer_path(&self) -> PathBuf {
        self.model_dir.join(&self.recognizer_file)
    }
}

/// `$XDG_DATA_HOME/rollcall/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    data_dir().join("models")
}

/// `$XDG_DATA_HOME/rollcall/fingerprint_verifier.safetensors`.
pub fn default_artifact_path() -> PathBuf {
    data_dir().join(FINGERPRINT_ARTIFACT_NAME)
}

/// Base data directory for rollcall state.
pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("rollcall")
}
