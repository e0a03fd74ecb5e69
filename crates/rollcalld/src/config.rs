use anyhow::Context;
use rollcall_core::config::{data_dir, default_artifact_path};
use rollcall_core::{FaceModelConfig, FingerprintConfig, LiveMatchConfig};
use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device path for the attendance camera.
    pub camera_device: String,
    pub camera_width: u32,
    pub camera_height: u32,
    /// Root of per-identity enrollment photo folders.
    pub gallery_dir: PathBuf,
    /// Where `attendance_YYYY-MM-DD.csv` files are written.
    pub attendance_dir: PathBuf,
    /// Trained fingerprint verifier.
    pub artifact_path: PathBuf,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
    pub fingerprint: FingerprintConfig,
    pub live: LiveMatchConfig,
    pub models: FaceModelConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            camera_width: 640,
            camera_height: 480,
            gallery_dir: data.join("faces"),
            attendance_dir: data.join("attendance"),
            artifact_path: default_artifact_path(),
            system_bus: false,
            fingerprint: FingerprintConfig::default(),
            live: LiveMatchConfig::default(),
            models: FaceModelConfig::default(),
        }
    }
}

impl Config {
    /// Read `$ROLLCALL_CONFIG` if set, then apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {path}"))?;
                Self::from_toml_str(&text).with_context(|| format!("parsing config file {path}"))?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply `ROLLCALL_*` overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("ROLLCALL_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        if let Some(v) = lookup("ROLLCALL_GALLERY_DIR") {
            self.gallery_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_ATTENDANCE_DIR") {
            self.attendance_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_ARTIFACT_PATH") {
            self.artifact_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_MODEL_DIR") {
            self.models.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("ROLLCALL_SYSTEM_BUS") {
            self.system_bus = v != "0";
        }

        set_from(&lookup, "ROLLCALL_FINGERPRINT_THRESHOLD", &mut self.fingerprint.threshold);
        set_from(&lookup, "ROLLCALL_MATCH_THRESHOLD", &mut self.live.match_threshold);
        set_from(&lookup, "ROLLCALL_REQUIRED_FRAMES", &mut self.live.required_frames);
        set_from(&lookup, "ROLLCALL_EYE_AR_THRESHOLD", &mut self.live.eye_ar_threshold);
        set_from(&lookup, "ROLLCALL_EYE_AR_CONSEC_FRAMES", &mut self.live.eye_ar_consec_frames);
        set_from(&lookup, "ROLLCALL_MAX_READ_FAILURES", &mut self.live.max_read_failures);
        set_from(&lookup, "ROLLCALL_CAMERA_WIDTH", &mut self.camera_width);
        set_from(&lookup, "ROLLCALL_CAMERA_HEIGHT", &mut self.camera_height);
    }
}

fn set_from<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    if let Some(value) = lookup(key) {
        match value.parse() {
            Ok(v) => *slot = v,
            Err(_) => tracing::warn!(key, value = %value, "ignoring unparseable config override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let cfg = Config::from_toml_str(
            r#"
            camera_device = "/dev/video4"

            [live]
            required_frames = 5
            "#,
        )
        .unwrap();
        assert_eq!(cfg.camera_device, "/dev/video4");
        assert_eq!(cfg.live.required_frames, 5);
        assert!((cfg.live.match_threshold - 0.55).abs() < 1e-6);
        assert!((cfg.fingerprint.threshold - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ROLLCALL_MATCH_THRESHOLD", "0.4"),
            ("ROLLCALL_REQUIRED_FRAMES", "not-a-number"),
            ("ROLLCALL_ATTENDANCE_DIR", "/srv/attendance"),
            ("ROLLCALL_SYSTEM_BUS", "1"),
        ]
        .into_iter()
        .collect();

        let mut cfg = Config::default();
        cfg.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert!((cfg.live.match_threshold - 0.4).abs() < 1e-6);
        assert_eq!(cfg.live.required_frames, 3);
        assert_eq!(cfg.attendance_dir, PathBuf::from("/srv/attendance"));
        assert!(cfg.system_bus);
    }

    #[test]
    fn test_unknown_toml_type_is_error() {
        assert!(Config::from_toml_str("camera_width = \"wide\"").is_err());
    }
}
