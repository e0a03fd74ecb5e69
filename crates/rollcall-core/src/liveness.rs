//! Blink-based liveness from eye landmarks.

use crate::types::{FaceLandmarks, Point};

fn dist(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Eye aspect ratio `(|p2-p6| + |p3-p5|) / (2 |p1-p4|)` over six ordered eye points.
///
/// `None` for anything other than six points, or when the eye corners coincide.
pub fn eye_aspect_ratio(eye: &[Point]) -> Option<f32> {
    let &[p1, p2, p3, p4, p5, p6] = eye else {
        return None;
    };
    let horizontal = dist(p1, p4);
    if horizontal <= f32::EPSILON {
        return None;
    }
    Some((dist(p2, p6) + dist(p3, p5)) / (2.0 * horizontal))
}

/// Mean of both eyes' aspect ratios for one face.
pub fn face_aspect_ratio(face: &FaceLandmarks) -> Option<f32> {
    let left = eye_aspect_ratio(face.left_eye())?;
    let right = eye_aspect_ratio(face.right_eye())?;
    Some((left + right) / 2.0)
}

/// Counts closed-then-open eye cycles across frames.
#[derive(Debug, Clone)]
pub struct BlinkCounter {
    closed_threshold: f32,
    min_closed_frames: u32,
    closed_run: u32,
    blinks: u32,
}

impl BlinkCounter {
    pub fn new(closed_threshold: f32, min_closed_frames: u32) -> Self {
        Self {
            closed_threshold,
            min_closed_frames,
            closed_run: 0,
            blinks: 0,
        }
    }

    /// Feed one aspect-ratio measurement. Returns true when it completed a blink.
    ///
    /// Below the threshold the closed run grows. Otherwise, a run of at least
    /// `min_closed_frames` counts as one blink, and the run resets.
    pub fn update(&mut self, ear: f32) -> bool {
        if ear < self.closed_threshold {
            self.closed_run += 1;
            return false;
        }
        let blinked = self.closed_run >= self.min_closed_frames;
        if blinked {
            self.blinks += 1;
        }
        self.closed_run = 0;
        blinked
    }

    pub fn blinks(&self) -> u32 {
        self.blinks
    }

    pub fn closed_run(&self) -> u32 {
        self.closed_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Six eye points with the given eye width and lid opening.
    fn eye(width: f32, opening: f32) -> [Point; 6] {
        let h = opening / 2.0;
        [
            (0.0, 0.0),
            (width / 3.0, -h),
            (2.0 * width / 3.0, -h),
            (width, 0.0),
            (2.0 * width / 3.0, h),
            (width / 3.0, h),
        ]
    }

    #[test]
    fn test_ear_formula() {
        // Verticals are both 3, horizontal 10: (3 + 3) / 20.
        let ear = eye_aspect_ratio(&eye(10.0, 3.0)).unwrap();
        assert!((ear - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_ear_degenerate() {
        assert!(eye_aspect_ratio(&eye(0.0, 3.0)).is_none());
        assert!(eye_aspect_ratio(&[(0.0, 0.0); 4]).is_none());
    }

    #[test]
    fn test_face_ratio_averages_eyes() {
        let mut pts = vec![(0.0, 0.0); 68];
        pts[36..42].copy_from_slice(&eye(10.0, 2.0));
        pts[42..48].copy_from_slice(&eye(10.0, 4.0));
        let face = FaceLandmarks::new(pts).unwrap();
        assert!((face_aspect_ratio(&face).unwrap() - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_blink_counted_on_reopen() {
        let mut counter = BlinkCounter::new(0.2, 1);
        assert!(!counter.update(0.3));
        assert!(!counter.update(0.1));
        assert_eq!(counter.closed_run(), 1);
        assert!(counter.update(0.3));
        assert_eq!(counter.blinks(), 1);
        assert_eq!(counter.closed_run(), 0);
    }

    #[test]
    fn test_short_closure_ignored() {
        let mut counter = BlinkCounter::new(0.2, 3);
        for ear in [0.1, 0.1, 0.3, 0.1, 0.1, 0.1, 0.3] {
            counter.update(ear);
        }
        assert_eq!(counter.blinks(), 1);
    }

    #[test]
    fn test_zero_minimum_counts_every_reopen() {
        let mut counter = BlinkCounter::new(0.2, 0);
        assert!(counter.update(0.3));
        assert!(counter.update(0.3));
        assert_eq!(counter.blinks(), 2);
    }

    #[test]
    fn test_open_eyes_never_blink() {
        let mut counter = BlinkCounter::new(0.2, 1);
        for _ in 0..10 {
            counter.update(0.35);
        }
        assert_eq!(counter.blinks(), 0);
    }
}
