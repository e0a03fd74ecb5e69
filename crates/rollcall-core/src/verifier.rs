//! Fingerprint pair verification against a trained artifact.

use crate::config::FingerprintConfig;
use crate::preprocess::{load_fingerprint, ImageLoadError};
use crate::siamese::{load_artifact, ArtifactError, SiameseNetwork};
use candle_core::Device;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("fingerprint model is not loaded")]
    ModelNotLoaded,
    #[error(transparent)]
    ImageLoad(#[from] ImageLoadError),
    #[error("model inference failed: {0}")]
    Model(#[from] candle_core::Error),
    #[error(transparent)]
    Artifact(#[from] ArtifactError),
}

/// Outcome of comparing an enrolled scan with a query scan.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Verification {
    pub score: f32,
    pub threshold: f32,
    pub verified: bool,
}

/// Scores fingerprint pairs with a loaded twin network.
///
/// Immutable once loaded; queries take `&self` and the verifier can be
/// shared across threads behind an `Arc`.
pub struct PairwiseVerifier {
    config: FingerprintConfig,
    network: Option<SiameseNetwork>,
}

impl PairwiseVerifier {
    /// An unloaded verifier. Every query fails with [`VerifyError::ModelNotLoaded`]
    /// until [`load`](Self::load) succeeds.
    pub fn new(config: FingerprintConfig) -> Self {
        Self {
            config,
            network: None,
        }
    }

    /// Build a verifier straight from an artifact on disk.
    pub fn from_artifact(config: FingerprintConfig, path: &Path) -> Result<Self, VerifyError> {
        let mut verifier = Self::new(config);
        verifier.load(path)?;
        Ok(verifier)
    }

    /// Load (or replace) the network from `path`.
    ///
    /// The artifact's recorded input size wins over the configured one, so
    /// query images are always resized to what the network was trained on.
    pub fn load(&mut self, path: &Path) -> Result<(), VerifyError> {
        let network = load_artifact(path, &Device::Cpu)?;
        let arch = network.architecture();
        if arch.input_size != self.config.input_size {
            tracing::warn!(
                configured = self.config.input_size,
                artifact = arch.input_size,
                "artifact input size differs from configuration, using artifact"
            );
            self.config.input_size = arch.input_size;
        }
        self.config.embedding_dim = arch.embedding_dim;
        self.network = Some(network);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.network.is_some()
    }

    pub fn default_threshold(&self) -> f32 {
        self.config.threshold
    }

    /// Similarity score in [0, 1] for two scans on disk.
    pub fn score_paths(&self, enrolled: &Path, query: &Path) -> Result<f32, VerifyError> {
        let network = self.network.as_ref().ok_or(VerifyError::ModelNotLoaded)?;
        let size = self.config.input_size;
        let a = load_fingerprint(enrolled, size)?;
        let b = load_fingerprint(query, size)?;
        Ok(network.score_pair(&a, &b)?)
    }

    /// Score a pair and apply `threshold` (or the configured default).
    pub fn verify(
        &self,
        enrolled: &Path,
        query: &Path,
        threshold: Option<f32>,
    ) -> Result<Verification, VerifyError> {
        let threshold = threshold.unwrap_or(self.config.threshold);
        let score = self.score_paths(enrolled, query)?;
        let verified = score >= threshold;

        tracing::debug!(
            enrolled = %enrolled.display(),
            query = %query.display(),
            score,
            threshold,
            verified,
            "fingerprint verification"
        );

        Ok(Verification {
            score,
            threshold,
            verified,
        })
    }
}
