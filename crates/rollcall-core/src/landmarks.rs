//! 68-point facial landmark regression.
//!
//! The model takes a square face crop and returns 136 values: (x, y) pairs
//! normalized to the crop. Crops that extend past the frame are zero-padded.

use crate::backend::{gray_to_nchw, open_session, FaceModelError};
use crate::types::{BoundingBox, FaceLandmarks, Point, LANDMARK_COUNT};
use image::imageops::FilterType;
use image::{GrayImage, Luma};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

/// Crop side relative to the longer side of the detection box.
const CROP_EXPANSION: f32 = 1.2;

/// Square region of the frame fed to the landmark model.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FaceCrop {
    x0: f32,
    y0: f32,
    side: f32,
}

impl FaceCrop {
    fn around(face: &BoundingBox) -> Self {
        let side = (face.width.max(face.height) * CROP_EXPANSION).max(1.0);
        let cx = face.x + face.width / 2.0;
        let cy = face.y + face.height / 2.0;
        Self {
            x0: cx - side / 2.0,
            y0: cy - side / 2.0,
            side,
        }
    }

    fn extract(&self, frame: &GrayImage, out_size: u32) -> GrayImage {
        let side = self.side.round() as u32;
        let (ox, oy) = (self.x0.round() as i64, self.y0.round() as i64);
        let crop = GrayImage::from_fn(side, side, |x, y| {
            let (fx, fy) = (ox + i64::from(x), oy + i64::from(y));
            if fx < 0 || fy < 0 {
                return Luma([0]);
            }
            frame
                .get_pixel_checked(fx as u32, fy as u32)
                .copied()
                .unwrap_or(Luma([0]))
        });
        image::imageops::resize(&crop, out_size, out_size, FilterType::Triangle)
    }

    /// Crop-normalized coordinate back to frame pixels.
    fn to_frame(&self, (u, v): Point) -> Point {
        (self.x0 + u * self.side, self.y0 + v * self.side)
    }
}

pub struct LandmarkLocator {
    session: Session,
    input_size: u32,
}

impl LandmarkLocator {
    pub fn load(path: &Path, input_size: usize) -> Result<Self, FaceModelError> {
        Ok(Self {
            session: open_session(path, "landmarks68")?,
            input_size: input_size as u32,
        })
    }

    /// Landmarks for one detected face, in frame coordinates.
    pub fn locate(&mut self, frame: &GrayImage, face: &BoundingBox) -> Result<FaceLandmarks, FaceModelError> {
        let crop = FaceCrop::around(face);
        let input = gray_to_nchw(&crop.extract(frame, self.input_size), 0.0, 255.0);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| FaceModelError::InferenceFailed(format!("landmark extraction: {e}")))?;

        decode_landmarks(raw, &crop)
    }
}

fn decode_landmarks(raw: &[f32], crop: &FaceCrop) -> Result<FaceLandmarks, FaceModelError> {
    if raw.len() != LANDMARK_COUNT * 2 {
        return Err(FaceModelError::InferenceFailed(format!(
            "expected {} landmark values, got {}",
            LANDMARK_COUNT * 2,
            raw.len()
        )));
    }
    let points = raw
        .chunks_exact(2)
        .map(|p| crop.to_frame((p[0], p[1])))
        .collect();
    FaceLandmarks::new(points)
        .ok_or_else(|| FaceModelError::InferenceFailed("landmark count mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face() -> BoundingBox {
        BoundingBox { x: 10.0, y: 20.0, width: 40.0, height: 50.0, confidence: 0.9 }
    }

    #[test]
    fn test_crop_is_square_and_centered() {
        let crop = FaceCrop::around(&face());
        assert!((crop.side - 60.0).abs() < 1e-4);
        assert!((crop.x0 + crop.side / 2.0 - 30.0).abs() < 1e-4);
        assert!((crop.y0 + crop.side / 2.0 - 45.0).abs() < 1e-4);
    }

    #[test]
    fn test_crop_pads_outside_frame() {
        let frame = GrayImage::from_pixel(20, 20, Luma([200]));
        let crop = FaceCrop { x0: -10.0, y0: -10.0, side: 20.0 };
        let out = crop.extract(&frame, 20);
        assert_eq!(out.dimensions(), (20, 20));
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(19, 19)[0], 200);
    }

    #[test]
    fn test_decode_maps_to_frame() {
        let crop = FaceCrop { x0: 100.0, y0: 50.0, side: 200.0 };
        let mut raw = vec![0.5; LANDMARK_COUNT * 2];
        raw[0] = 0.0;
        raw[1] = 1.0;
        let lm = decode_landmarks(&raw, &crop).unwrap();
        assert_eq!(lm.points()[0], (100.0, 250.0));
        assert_eq!(lm.points()[67], (200.0, 150.0));
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let crop = FaceCrop { x0: 0.0, y0: 0.0, side: 1.0 };
        assert!(decode_landmarks(&[0.0; 10], &crop).is_err());
    }
}
