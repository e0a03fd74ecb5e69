//! Live camera attendance session.
//!
//! Each frame is scanned at full resolution for face landmarks (liveness)
//! and at reduced resolution for identity embeddings (matching). An
//! identity is reported to the attendance ledger once it has collected
//! enough matching frames and at least one blink has been seen.

use crate::config::LiveMatchConfig;
use crate::gallery::{FaceGallery, GalleryError, GalleryMatch};
use crate::liveness::{face_aspect_ratio, BlinkCounter};
use crate::types::{Embedding, FaceLandmarks};
use chrono::NaiveDate;
use image::imageops::FilterType;
use image::GrayImage;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

/// Detection, landmarking and embedding, as one stateful capability.
pub trait FaceBackend {
    type Error: std::error::Error + Send + Sync + 'static;

    /// 68-point landmarks for every face in `frame`.
    fn landmarks(&mut self, frame: &GrayImage) -> Result<Vec<FaceLandmarks>, Self::Error>;

    /// One embedding per face in `frame`.
    fn encodings(&mut self, frame: &GrayImage) -> Result<Vec<Embedding>, Self::Error>;
}

#[derive(Error, Debug, Clone)]
pub enum FrameError {
    #[error("frame capture failed: {0}")]
    Capture(String),
    #[error("video stream ended")]
    EndOfStream,
}

pub trait FrameSource {
    fn next_frame(&mut self) -> Result<GrayImage, FrameError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MarkOutcome {
    Marked,
    AlreadyMarked,
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("attendance file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("attendance file {path} is malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Per-day attendance record, idempotent per identity and day.
pub trait AttendanceLedger {
    fn mark_if_absent(&mut self, identity: &str, day: NaiveDate) -> Result<MarkOutcome, LedgerError>;
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("camera unavailable: {0}")]
    CameraUnavailable(String),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("face backend: {0}")]
    Backend(String),
}

/// Per-identity count of matching frames.
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    votes: HashMap<String, u32>,
}

impl VoteTally {
    /// Add one vote and return the new total.
    pub fn increment(&mut self, identity: &str) -> u32 {
        let count = self.votes.entry(identity.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, identity: &str) -> u32 {
        self.votes.get(identity).copied().unwrap_or(0)
    }
}

/// What one frame did to the session state.
#[derive(Debug, Clone, Default)]
pub struct FrameOutcome {
    pub faces: usize,
    pub blinked: bool,
    /// Gallery hits within the match threshold.
    pub matches: Vec<GalleryMatch>,
    /// Identities handed to the ledger on this frame.
    pub reported: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    Stopped,
    SourceFailed,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub frames: u64,
    pub skipped_frames: u64,
    pub blinks: u32,
    pub reported: Vec<String>,
    pub end: SessionEnd,
}

/// Frame-by-frame vote and liveness state for one session.
pub struct LiveFaceMatcher {
    config: LiveMatchConfig,
    gallery: FaceGallery,
    votes: VoteTally,
    blinks: BlinkCounter,
    reported: HashSet<String>,
    report_order: Vec<String>,
}

impl LiveFaceMatcher {
    pub fn new(config: LiveMatchConfig, gallery: FaceGallery) -> Self {
        let blinks = BlinkCounter::new(config.eye_ar_threshold, config.eye_ar_consec_frames);
        Self {
            config,
            gallery,
            votes: VoteTally::default(),
            blinks,
            reported: HashSet::new(),
            report_order: Vec::new(),
        }
    }

    pub fn votes(&self) -> &VoteTally {
        &self.votes
    }

    pub fn blinks(&self) -> u32 {
        self.blinks.blinks()
    }

    pub fn is_reported(&self, identity: &str) -> bool {
        self.reported.contains(identity)
    }

    /// Run one frame through liveness, matching and reporting.
    ///
    /// A frame with no face is a no-op. Ledger failures are logged and the
    /// identity stays unreported, so a later frame retries it.
    pub fn process_frame<B, L>(
        &mut self,
        frame: &GrayImage,
        backend: &mut B,
        ledger: &mut L,
        day: NaiveDate,
    ) -> Result<FrameOutcome, B::Error>
    where
        B: FaceBackend,
        L: AttendanceLedger + ?Sized,
    {
        let faces = backend.landmarks(frame)?;
        if faces.is_empty() {
            return Ok(FrameOutcome::default());
        }

        let mut outcome = FrameOutcome {
            faces: faces.len(),
            ..Default::default()
        };

        for face in &faces {
            if let Some(ear) = face_aspect_ratio(face) {
                if self.blinks.update(ear) {
                    outcome.blinked = true;
                    tracing::debug!(ear, blinks = self.blinks.blinks(), "blink detected");
                }
            }
        }

        let small = downscale(frame, self.config.downscale);
        for encoding in backend.encodings(&small)? {
            let Some(hit) = self.gallery.nearest(&encoding) else {
                continue;
            };
            if hit.distance >= self.config.match_threshold {
                continue;
            }

            let votes = self.votes.increment(&hit.identity);
            tracing::trace!(identity = %hit.identity, distance = hit.distance, votes, "gallery match");
            outcome.matches.push(hit.clone());

            if votes >= self.config.required_frames
                && self.blinks.blinks() >= 1
                && !self.reported.contains(&hit.identity)
            {
                match ledger.mark_if_absent(&hit.identity, day) {
                    Ok(mark) => {
                        tracing::info!(identity = %hit.identity, %day, ?mark, votes, "attendance recorded");
                        self.reported.insert(hit.identity.clone());
                        self.report_order.push(hit.identity.clone());
                        outcome.reported.push(hit.identity);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(identity = %hit.identity, error = %e, "attendance ledger write failed");
                    }
                }
            }
        }

        Ok(outcome)
    }

    /// Consume frames until `stop` is set or the source fails
    /// `max_read_failures` times in a row.
    ///
    /// `stop` is checked between frames; a frame in progress always completes.
    pub fn run<S, B, L>(
        &mut self,
        source: &mut S,
        backend: &mut B,
        ledger: &mut L,
        stop: &AtomicBool,
    ) -> SessionSummary
    where
        S: FrameSource + ?Sized,
        B: FaceBackend,
        L: AttendanceLedger + ?Sized,
    {
        let mut frames = 0u64;
        let mut skipped_frames = 0u64;
        let mut read_failures = 0u32;

        let end = loop {
            if stop.load(Ordering::SeqCst) {
                break SessionEnd::Stopped;
            }

            let frame = match source.next_frame() {
                Ok(frame) => {
                    read_failures = 0;
                    frame
                }
                Err(e) => {
                    read_failures += 1;
                    tracing::warn!(error = %e, consecutive = read_failures, "frame read failed");
                    if read_failures >= self.config.max_read_failures.max(1) {
                        break SessionEnd::SourceFailed;
                    }
                    continue;
                }
            };

            frames += 1;
            let today = chrono::Local::now().date_naive();
            if let Err(e) = self.process_frame(&frame, backend, ledger, today) {
                skipped_frames += 1;
                tracing::warn!(error = %e, frame = frames, "face backend failed, skipping frame");
            }
        };

        let summary = SessionSummary {
            frames,
            skipped_frames,
            blinks: self.blinks.blinks(),
            reported: self.report_order.clone(),
            end,
        };
        tracing::info!(
            frames = summary.frames,
            skipped = summary.skipped_frames,
            blinks = summary.blinks,
            reported = summary.reported.len(),
            end = ?summary.end,
            "camera session finished"
        );
        summary
    }
}

/// Shrink a frame by `factor`. Factors outside (0, 1) return a copy.
pub fn downscale(frame: &GrayImage, factor: f32) -> GrayImage {
    if !(factor > 0.0 && factor < 1.0) {
        return frame.clone();
    }
    let w = ((frame.width() as f32 * factor).round() as u32).max(1);
    let h = ((frame.height() as f32 * factor).round() as u32).max(1);
    image::imageops::resize(frame, w, h, FilterType::Triangle)
}
