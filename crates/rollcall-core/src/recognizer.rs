//! ArcFace face embeddings.
//!
//! The detection box is cropped and resized to 112×112 directly; there is
//! no keypoint alignment step.

use crate::backend::{gray_to_nchw, open_session, FaceModelError};
use crate::types::{BoundingBox, Embedding};
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: u32 = 112;
const MEAN: f32 = 127.5;
// ArcFace uses symmetric normalization, unlike SCRFD.
const STD: f32 = 127.5;
const EMBEDDING_DIM: usize = 512;

pub struct FaceRecognizer {
    session: Session,
}

impl FaceRecognizer {
    pub fn load(path: &Path) -> Result<Self, FaceModelError> {
        Ok(Self {
            session: open_session(path, "arcface")?,
        })
    }

    /// L2-normalized embedding of `face`, or `None` if the box lies outside the frame.
    pub fn embed(&mut self, frame: &GrayImage, face: &BoundingBox) -> Result<Option<Embedding>, FaceModelError> {
        let Some(input) = face_tensor(frame, face) else {
            return Ok(None);
        };

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| FaceModelError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if raw.len() != EMBEDDING_DIM {
            return Err(FaceModelError::InferenceFailed(format!(
                "expected {EMBEDDING_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }
        Ok(Some(Embedding::new(raw.to_vec()).l2_normalized()))
    }
}

fn face_tensor(frame: &GrayImage, face: &BoundingBox) -> Option<Array4<f32>> {
    let (x, y, w, h) = face.crop_rect(frame.width(), frame.height())?;
    let crop = image::imageops::crop_imm(frame, x, y, w, h).to_image();
    let resized = image::imageops::resize(&crop, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    Some(gray_to_nchw(&resized, MEAN, STD))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_face_tensor_shape() {
        let frame = GrayImage::from_pixel(160, 120, Luma([128]));
        let face = BoundingBox { x: 40.0, y: 20.0, width: 60.0, height: 70.0, confidence: 0.9 };
        let t = face_tensor(&frame, &face).unwrap();
        assert_eq!(t.shape(), &[1, 3, 112, 112]);
        let expected = (128.0 - MEAN) / STD;
        assert!((t[[0, 0, 50, 50]] - expected).abs() < 1e-6);
    }

    #[test]
    fn test_face_outside_frame_has_no_tensor() {
        let frame = GrayImage::new(100, 100);
        let face = BoundingBox { x: 150.0, y: 150.0, width: 20.0, height: 20.0, confidence: 0.9 };
        assert!(face_tensor(&frame, &face).is_none());
    }
}
