//! Camera session lifecycle: at most one live session, on its own thread.

use crate::config::Config;
use crate::ledger::CsvLedger;
use chrono::{DateTime, Local};
use rollcall_core::{FaceGallery, LiveFaceMatcher, OnnxFaceBackend, SessionError, SessionSummary};
use rollcall_hw::Camera;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ControllerError {
    #[error("failed to spawn camera thread: {0}")]
    Spawn(#[source] std::io::Error),
}

/// The body of a camera session. Runs until `stop` is set or it fails.
pub trait SessionLauncher: Send + Sync + 'static {
    fn run_session(&self, stop: &AtomicBool) -> Result<SessionSummary, SessionError>;
}

/// How the most recent session ended.
#[derive(Debug, Clone, Serialize)]
pub struct FinishedSession {
    pub id: Uuid,
    pub started_at: DateTime<Local>,
    pub finished_at: DateTime<Local>,
    pub summary: Option<SessionSummary>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub running: bool,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Local>>,
    pub last_session: Option<FinishedSession>,
}

struct ActiveSession {
    id: Uuid,
    started_at: DateTime<Local>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Owns the live camera session, if any.
pub struct CameraController {
    launcher: Arc<dyn SessionLauncher>,
    active: Mutex<Option<ActiveSession>>,
    last: Arc<Mutex<Option<FinishedSession>>>,
}

impl CameraController {
    pub fn new(launcher: Arc<dyn SessionLauncher>) -> Self {
        Self {
            launcher,
            active: Mutex::new(None),
            last: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawn a session unless one is already running. Returns whether one was spawned.
    pub fn start(&self) -> Result<bool, ControllerError> {
        let mut active = lock(&self.active);

        if let Some(session) = active.as_ref() {
            if !session.handle.is_finished() {
                tracing::debug!(session = %session.id, "camera session already running");
                return Ok(false);
            }
        }
        // A session that ended on its own is reaped before starting a new one.
        if let Some(finished) = active.take() {
            join(finished);
        }

        let id = Uuid::new_v4();
        let started_at = Local::now();
        let stop = Arc::new(AtomicBool::new(false));

        let launcher = Arc::clone(&self.launcher);
        let last = Arc::clone(&self.last);
        let thread_stop = Arc::clone(&stop);
        let handle = std::thread::Builder::new()
            .name("rollcall-camera".into())
            .spawn(move || {
                tracing::info!(session = %id, "camera session started");
                let result = launcher.run_session(&thread_stop);
                if let Err(e) = &result {
                    tracing::error!(session = %id, error = %e, "camera session failed");
                }
                let (summary, error) = match result {
                    Ok(summary) => (Some(summary), None),
                    Err(e) => (None, Some(e.to_string())),
                };
                *lock(&*last) = Some(FinishedSession {
                    id,
                    started_at,
                    finished_at: Local::now(),
                    summary,
                    error,
                });
            })
            .map_err(ControllerError::Spawn)?;

        *active = Some(ActiveSession {
            id,
            started_at,
            stop,
            handle,
        });
        Ok(true)
    }

    /// Ask the running session to stop and wait for it. Returns false when idle.
    ///
    /// The stop takes effect at the next frame boundary.
    pub fn stop(&self) -> bool {
        let mut active = lock(&self.active);
        let Some(session) = active.take() else {
            return false;
        };
        let was_running = !session.handle.is_finished();
        session.stop.store(true, Ordering::SeqCst);
        join(session);
        was_running
    }

    pub fn status(&self) -> ControllerStatus {
        let active = lock(&self.active);
        let live = active.as_ref().filter(|s| !s.handle.is_finished());
        ControllerStatus {
            running: live.is_some(),
            session_id: live.map(|s| s.id),
            started_at: live.map(|s| s.started_at),
            last_session: lock(&*self.last).clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn join(session: ActiveSession) {
    let id = session.id;
    if session.handle.join().is_err() {
        tracing::error!(session = %id, "camera session thread panicked");
    } else {
        tracing::info!(session = %id, "camera session stopped");
    }
}

/// Camera + ONNX models + CSV ledger.
pub struct CameraSessionLauncher {
    config: Config,
}

impl CameraSessionLauncher {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl SessionLauncher for CameraSessionLauncher {
    fn run_session(&self, stop: &AtomicBool) -> Result<SessionSummary, SessionError> {
        let cfg = &self.config;

        let mut backend = OnnxFaceBackend::load(&cfg.models).map_err(|e| SessionError::Backend(e.to_string()))?;
        let gallery = FaceGallery::load_dir(&cfg.gallery_dir, &mut backend)?;
        if gallery.is_empty() {
            tracing::warn!(dir = %cfg.gallery_dir.display(), "face gallery is empty, nobody can be matched");
        }

        let mut stream = Camera::open(&cfg.camera_device, cfg.camera_width, cfg.camera_height)
            .and_then(Camera::into_stream)
            .map_err(|e| SessionError::CameraUnavailable(format!("{}: {e}", cfg.camera_device)))?;

        let mut ledger = CsvLedger::new(&cfg.attendance_dir);
        let mut matcher = LiveFaceMatcher::new(cfg.live.clone(), gallery);
        Ok(matcher.run(&mut stream, &mut backend, &mut ledger, stop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::SessionEnd;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Runs until stopped, counting how many sessions were launched.
    #[derive(Default)]
    struct IdleLauncher {
        launched: AtomicUsize,
    }

    impl SessionLauncher for IdleLauncher {
        fn run_session(&self, stop: &AtomicBool) -> Result<SessionSummary, SessionError> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            while !stop.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(5));
            }
            Ok(SessionSummary {
                frames: 0,
                skipped_frames: 0,
                blinks: 0,
                reported: Vec::new(),
                end: SessionEnd::Stopped,
            })
        }
    }

    struct NoCamera;

    impl SessionLauncher for NoCamera {
        fn run_session(&self, _stop: &AtomicBool) -> Result<SessionSummary, SessionError> {
            Err(SessionError::CameraUnavailable("/dev/video0".into()))
        }
    }

    fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_double_start_spawns_one_session() {
        let launcher = Arc::new(IdleLauncher::default());
        let controller = CameraController::new(launcher.clone());

        assert!(controller.start().unwrap());
        assert!(!controller.start().unwrap());
        assert!(controller.status().running);

        assert!(controller.stop());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 1);
        assert!(!controller.status().running);

        let last = controller.status().last_session.unwrap();
        assert_eq!(last.summary.unwrap().end, SessionEnd::Stopped);
    }

    #[test]
    fn test_stop_when_idle_is_noop() {
        let controller = CameraController::new(Arc::new(IdleLauncher::default()));
        assert!(!controller.stop());
        assert!(!controller.stop());
        assert!(controller.status().last_session.is_none());
    }

    #[test]
    fn test_restart_after_stop() {
        let launcher = Arc::new(IdleLauncher::default());
        let controller = CameraController::new(launcher.clone());
        assert!(controller.start().unwrap());
        assert!(controller.stop());
        assert!(controller.start().unwrap());
        assert!(controller.stop());
        assert_eq!(launcher.launched.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_camera_failure_returns_to_idle() {
        let controller = CameraController::new(Arc::new(NoCamera));
        assert!(controller.start().unwrap());
        wait_until(|| !controller.status().running);

        let status = controller.status();
        assert!(!status.running);
        let error = status.last_session.unwrap().error.unwrap();
        assert!(error.contains("camera unavailable"));

        // The failed session is reaped and a new one can start.
        assert!(controller.start().unwrap());
        controller.stop();
    }
}
