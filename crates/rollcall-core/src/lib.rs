//! rollcall-core: biometric matching for attendance.
//!
//! Two independent pipelines live here. The fingerprint side trains and
//! queries a twin-tower similarity network (candle). The face side runs a
//! live camera session that votes on gallery matches and gates attendance
//! on a blink, using ONNX Runtime models for detection, landmarks and
//! embeddings.

pub mod backend;
pub mod config;
pub mod detector;
pub mod gallery;
pub mod landmarks;
pub mod liveness;
pub mod preprocess;
pub mod recognizer;
pub mod session;
pub mod siamese;
pub mod trainer;
pub mod types;
pub mod verifier;

pub use backend::{FaceModelError, OnnxFaceBackend};
pub use config::{FaceModelConfig, FingerprintConfig, LiveMatchConfig, TrainingConfig};
pub use gallery::{FaceGallery, GalleryError, GalleryMatch};
pub use preprocess::{load_fingerprint, ImageLoadError, NormalizedTensor};
pub use session::{
    AttendanceLedger, FaceBackend, FrameError, FrameSource, LedgerError, LiveFaceMatcher, MarkOutcome,
    SessionEnd, SessionError, SessionSummary,
};
pub use trainer::{TrainError, Trainer, TrainingReport};
pub use types::{BoundingBox, Embedding, FaceLandmarks, GalleryEntry};
pub use verifier::{PairwiseVerifier, Verification, VerifyError};
