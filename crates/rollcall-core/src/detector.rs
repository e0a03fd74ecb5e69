//! SCRFD face detector.
//!
//! Frames are letterboxed into a square input, decoded per stride from
//! anchor-free box offsets, then filtered with NMS. The keypoint outputs
//! of the model are not used.

use crate::backend::{open_session, FaceModelError};
use crate::types::BoundingBox;
use image::imageops::FilterType;
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;

const INPUT_SIZE: usize = 640;
const MEAN: f32 = 127.5;
const STD: f32 = 128.0;
const SCORE_THRESHOLD: f32 = 0.5;
const NMS_THRESHOLD: f32 = 0.4;
const STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;

/// Scale and padding applied when fitting a frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: usize,
    pad_y: usize,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> (Self, u32, u32) {
        let side = INPUT_SIZE as f32;
        let scale = (side / width as f32).min(side / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, INPUT_SIZE as u32);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, INPUT_SIZE as u32);
        let pad_x = (INPUT_SIZE - new_w as usize) / 2;
        let pad_y = (INPUT_SIZE - new_h as usize) / 2;
        (Self { scale, pad_x, pad_y }, new_w, new_h)
    }

    /// Input-space point back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// Output positions of (score, bbox) for one stride.
type StrideOutputs = (usize, usize);

pub struct FaceDetector {
    session: Session,
    outputs: [StrideOutputs; 3],
}

impl FaceDetector {
    pub fn load(path: &Path) -> Result<Self, FaceModelError> {
        let session = open_session(path, "scrfd")?;
        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(FaceModelError::InferenceFailed(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let outputs = stride_outputs(&names);
        tracing::debug!(?outputs, "SCRFD output mapping");
        Ok(Self { session, outputs })
    }

    /// Faces in `frame`, highest confidence first.
    pub fn detect(&mut self, frame: &GrayImage) -> Result<Vec<BoundingBox>, FaceModelError> {
        let (input, letterbox) = letterbox_tensor(frame);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (&stride, &(score_idx, bbox_idx)) in STRIDES.iter().zip(self.outputs.iter()) {
            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| FaceModelError::InferenceFailed(format!("scores at stride {stride}: {e}")))?;
            let (_, boxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| FaceModelError::InferenceFailed(format!("boxes at stride {stride}: {e}")))?;
            candidates.extend(decode_stride(scores, boxes, stride, &letterbox));
        }

        Ok(nms(candidates, NMS_THRESHOLD))
    }
}

fn letterbox_tensor(frame: &GrayImage) -> (Array4<f32>, Letterbox) {
    let (letterbox, new_w, new_h) = Letterbox::fit(frame.width(), frame.height());
    let resized = image::imageops::resize(frame, new_w, new_h, FilterType::Triangle);

    // Zero is the normalized padding value.
    let mut tensor = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let v = (f32::from(pixel[0]) - MEAN) / STD;
        let (ty, tx) = (y as usize + letterbox.pad_y, x as usize + letterbox.pad_x);
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = v;
        }
    }
    (tensor, letterbox)
}

/// Map output tensors to strides by name (`score_8`, `bbox_8`, ...), falling
/// back to the usual positional layout `[scores x3, boxes x3, kps x3]`.
fn stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let named: Option<Vec<StrideOutputs>> = STRIDES
        .iter()
        .map(|&s| find("score", s).zip(find("bbox", s)))
        .collect();

    match named.as_deref() {
        Some(&[a, b, c]) => [a, b, c],
        _ => {
            tracing::debug!(?names, "SCRFD outputs unnamed, using positional layout");
            [(0, 3), (1, 4), (2, 5)]
        }
    }
}

fn decode_stride(scores: &[f32], boxes: &[f32], stride: usize, letterbox: &Letterbox) -> Vec<BoundingBox> {
    let grid_w = INPUT_SIZE / stride;
    let anchors = grid_w * (INPUT_SIZE / stride) * ANCHORS_PER_CELL;
    let s = stride as f32;

    (0..anchors)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= SCORE_THRESHOLD {
                return None;
            }
            let offsets = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / ANCHORS_PER_CELL;
            let cx = (cell % grid_w) as f32 * s;
            let cy = (cell / grid_w) as f32 * s;

            let (x1, y1) = letterbox.unmap(cx - offsets[0] * s, cy - offsets[1] * s);
            let (x2, y2) = letterbox.unmap(cx + offsets[2] * s, cy + offsets[3] * s);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression; result is sorted by confidence.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<BoundingBox> = Vec::new();
    for candidate in candidates {
        if kept.iter().all(|k| k.iou(&candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_nms_keeps_best_of_overlap() {
        let kept = nms(
            vec![
                bbox(5.0, 5.0, 100.0, 100.0, 0.8),
                bbox(0.0, 0.0, 100.0, 100.0, 0.9),
                bbox(200.0, 200.0, 50.0, 50.0, 0.7),
            ],
            0.4,
        );
        let conf: Vec<f32> = kept.iter().map(|b| b.confidence).collect();
        assert_eq!(conf, vec![0.9, 0.7]);
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_letterbox_fit_landscape() {
        let (lb, w, h) = Letterbox::fit(320, 240);
        assert_eq!((w, h), (640, 480));
        assert_eq!((lb.pad_x, lb.pad_y), (0, 80));
        let (x, y) = lb.unmap(100.0 * lb.scale, 50.0 * lb.scale + 80.0);
        assert!((x - 100.0).abs() < 1e-3 && (y - 50.0).abs() < 1e-3);
    }

    #[test]
    fn test_letterbox_tensor_pads_with_zero() {
        let frame = GrayImage::from_pixel(320, 240, image::Luma([255]));
        let (t, _) = letterbox_tensor(&frame);
        assert_eq!(t.shape(), &[1, 3, INPUT_SIZE, INPUT_SIZE]);
        assert_eq!(t[[0, 0, 0, 0]], 0.0);
        assert!((t[[0, 1, 320, 320]] - (255.0 - MEAN) / STD).abs() < 1e-6);
    }

    #[test]
    fn test_stride_outputs_by_name() {
        let names: Vec<String> = ["bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(stride_outputs(&names), [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn test_stride_outputs_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(stride_outputs(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn test_decode_single_anchor() {
        let stride = 32;
        let grid = INPUT_SIZE / stride;
        let anchors = grid * grid * ANCHORS_PER_CELL;
        let mut scores = vec![0.0; anchors];
        let mut boxes = vec![0.0; anchors * 4];

        // Cell (x=2, y=1), first anchor; one stride in every direction.
        let idx = (grid + 2) * ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        boxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let identity = Letterbox { scale: 1.0, pad_x: 0, pad_y: 0 };
        let dets = decode_stride(&scores, &boxes, stride, &identity);
        assert_eq!(dets.len(), 1);
        assert_eq!((dets[0].x, dets[0].y), (32.0, 0.0));
        assert_eq!((dets[0].width, dets[0].height), (64.0, 64.0));
    }
}
