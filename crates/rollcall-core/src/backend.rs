//! ONNX Runtime face backend: SCRFD detection, 68-point landmarks, ArcFace embeddings.

use crate::config::FaceModelConfig;
use crate::detector::FaceDetector;
use crate::landmarks::LandmarkLocator;
use crate::recognizer::FaceRecognizer;
use crate::session::FaceBackend;
use crate::types::{Embedding, FaceLandmarks};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceModelError {
    #[error("model file not found: {0} (place the ONNX models in the configured model_dir)")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Open an ONNX session, logging its input and output signature.
pub(crate) fn open_session(path: &Path, kind: &str) -> Result<Session, FaceModelError> {
    if !path.exists() {
        return Err(FaceModelError::ModelNotFound(path.to_path_buf()));
    }

    let session = Session::builder()?
        .with_intra_threads(2)?
        .commit_from_file(path)?;

    tracing::info!(
        model = kind,
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded ONNX model"
    );
    Ok(session)
}

/// Grayscale image → `(1, 3, H, W)` tensor, `(p - mean) / std`, Y replicated into RGB.
pub(crate) fn gray_to_nchw(img: &GrayImage, mean: f32, std: f32) -> Array4<f32> {
    let (w, h) = (img.width() as usize, img.height() as usize);
    Array4::from_shape_fn((1, 3, h, w), |(_, _, y, x)| {
        (f32::from(img.get_pixel(x as u32, y as u32)[0]) - mean) / std
    })
}

/// [`FaceBackend`] backed by three ONNX models.
pub struct OnnxFaceBackend {
    detector: FaceDetector,
    locator: LandmarkLocator,
    recognizer: FaceRecognizer,
}

impl OnnxFaceBackend {
    pub fn load(config: &FaceModelConfig) -> Result<Self, FaceModelError> {
        Ok(Self {
            detector: FaceDetector::load(&config.detector_path())?,
            locator: LandmarkLocator::load(&config.landmark_path(), config.landmark_input_size)?,
            recognizer: FaceRecognizer::load(&config.recognizer_path())?,
        })
    }
}

impl FaceBackend for OnnxFaceBackend {
    type Error = FaceModelError;

    fn landmarks(&mut self, frame: &GrayImage) -> Result<Vec<FaceLandmarks>, FaceModelError> {
        let faces = self.detector.detect(frame)?;
        let mut out = Vec::with_capacity(faces.len());
        for face in &faces {
            out.push(self.locator.locate(frame, face)?);
        }
        Ok(out)
    }

    fn encodings(&mut self, frame: &GrayImage) -> Result<Vec<Embedding>, FaceModelError> {
        let faces = self.detector.detect(frame)?;
        let mut out = Vec::with_capacity(faces.len());
        for face in &faces {
            if let Some(embedding) = self.recognizer.embed(frame, face)? {
                out.push(embedding);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_gray_to_nchw_layout() {
        let img = GrayImage::from_fn(4, 2, |x, y| Luma([(x + 10 * y) as u8]));
        let t = gray_to_nchw(&img, 0.0, 1.0);
        assert_eq!(t.shape(), &[1, 3, 2, 4]);
        assert_eq!(t[[0, 0, 1, 3]], 13.0);
        assert_eq!(t[[0, 2, 1, 3]], 13.0);
    }

    #[test]
    fn test_gray_to_nchw_normalization() {
        let img = GrayImage::from_pixel(2, 2, Luma([255]));
        let t = gray_to_nchw(&img, 127.5, 127.5);
        assert!(t.iter().all(|&v| (v - 1.0).abs() < 1e-6));
    }

    #[test]
    fn test_missing_model_reports_path() {
        let cfg = FaceModelConfig {
            model_dir: PathBuf::from("/nonexistent/models"),
            ..Default::default()
        };
        match OnnxFaceBackend::load(&cfg) {
            Err(FaceModelError::ModelNotFound(p)) => assert_eq!(p, cfg.detector_path()),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("load should fail without models"),
        }
    }
}
