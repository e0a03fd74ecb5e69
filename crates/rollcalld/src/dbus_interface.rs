use crate::controller::{CameraController, ControllerStatus};
use rollcall_core::{PairwiseVerifier, VerifyError};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    controller: Arc<CameraController>,
    verifier: Arc<PairwiseVerifier>,
    artifact_path: PathBuf,
}

impl RollcallService {
    pub fn new(controller: Arc<CameraController>, verifier: Arc<PairwiseVerifier>, artifact_path: PathBuf) -> Self {
        Self {
            controller,
            verifier,
            artifact_path,
        }
    }

    fn report(&self) -> StatusReport {
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            camera: self.controller.status(),
            fingerprint_model_loaded: self.verifier.is_loaded(),
            fingerprint_threshold: self.verifier.default_threshold(),
            artifact: self.artifact_path.display().to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusReport {
    version: &'static str,
    camera: ControllerStatus,
    fingerprint_model_loaded: bool,
    fingerprint_threshold: f32,
    artifact: String,
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Start a live camera session. Returns false if one is already running.
    async fn start_camera(&self) -> fdo::Result<bool> {
        tracing::info!("start_camera requested");
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || controller.start())
            .await
            .map_err(|e| fdo::Error::Failed(format!("camera task failed: {e}")))?
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Stop the live camera session. Returns false if none was running.
    async fn stop_camera(&self) -> fdo::Result<bool> {
        tracing::info!("stop_camera requested");
        let controller = Arc::clone(&self.controller);
        tokio::task::spawn_blocking(move || controller.stop())
            .await
            .map_err(|e| fdo::Error::Failed(format!("camera task failed: {e}")))
    }

    /// Return daemon status as JSON.
    async fn status(&self) -> fdo::Result<String> {
        serde_json::to_string(&self.report()).map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Compare two fingerprint scans on the daemon's filesystem.
    ///
    /// A threshold of zero or less uses the configured default.
    async fn verify_fingerprint(&self, enrolled: &str, query: &str, threshold: f64) -> fdo::Result<(bool, f64)> {
        tracing::info!(enrolled, query, threshold, "verify_fingerprint requested");
        let verifier = Arc::clone(&self.verifier);
        let enrolled = PathBuf::from(enrolled);
        let query = PathBuf::from(query);
        let threshold = requested_threshold(threshold);

        let verification = tokio::task::spawn_blocking(move || verifier.verify(&enrolled, &query, threshold))
            .await
            .map_err(|e| fdo::Error::Failed(format!("verification task failed: {e}")))?
            .map_err(verify_error)?;

        Ok((verification.verified, f64::from(verification.score)))
    }
}

fn requested_threshold(threshold: f64) -> Option<f32> {
    (threshold.is_finite() && threshold > 0.0).then_some(threshold as f32)
}

fn verify_error(err: VerifyError) -> fdo::Error {
    match err {
        VerifyError::ImageLoad(e) => fdo::Error::InvalidArgs(e.to_string()),
        other => fdo::Error::Failed(other.to_string()),
    }
}
