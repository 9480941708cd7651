use kspy_core::tracker::{DEFAULT_DETECTION_EVERY, DEFAULT_IDENTIFICATION_EVERY, DEFAULT_MOVE_SPEED};
use kspy_core::{DetectorBackend, ModelPaths, TrackerConfig, DEFAULT_TOLERANCE};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("tolerance must be a finite, non-negative distance (got {0})")]
    InvalidTolerance(f32),
}

/// Runtime configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root holding the `training/`, `output/` and `validation/` directories.
    pub data_dir: PathBuf,
    /// Serialized gallery (default: `<data_dir>/output/encodings.bin`).
    pub gallery_path: PathBuf,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// TTF/OTF font for labels; system fonts are probed when unset.
    pub font_path: Option<PathBuf>,
    /// Maximum embedding distance that counts as a match.
    pub tolerance: f32,
    pub backend: DetectorBackend,
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Display refresh period of the live loop.
    pub tick_ms: u64,
    pub detection_every: u64,
    pub identification_every: u64,
    pub move_speed: f32,
    /// Background workers for live detection and identification passes.
    pub workers: usize,
}

impl Config {
    /// Load configuration from `KSPY_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let data_dir = std::env::var("KSPY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let gallery_path = std::env::var("KSPY_GALLERY_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("output").join("encodings.bin"));

        let model_dir = std::env::var("KSPY_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| default_model_dir());

        let backend = match std::env::var("KSPY_BACKEND") {
            Ok(v) => v.parse().unwrap_or_else(|e| {
                tracing::warn!(error = %e, "ignoring KSPY_BACKEND");
                DetectorBackend::default()
            }),
            Err(_) => DetectorBackend::default(),
        };

        Self {
            gallery_path,
            model_dir,
            font_path: std::env::var("KSPY_FONT_PATH").ok().map(PathBuf::from),
            tolerance: env_f32("KSPY_TOLERANCE", DEFAULT_TOLERANCE),
            backend,
            camera_device: std::env::var("KSPY_CAMERA_DEVICE")
                .unwrap_or_else(|_| "/dev/video0".to_string()),
            tick_ms: env_u64("KSPY_TICK_MS", 30),
            detection_every: env_u64("KSPY_DETECTION_EVERY", DEFAULT_DETECTION_EVERY),
            identification_every: env_u64("KSPY_IDENTIFICATION_EVERY", DEFAULT_IDENTIFICATION_EVERY),
            move_speed: env_f32("KSPY_MOVE_SPEED", DEFAULT_MOVE_SPEED),
            workers: env_usize("KSPY_WORKERS", kspy_core::pool::DEFAULT_WORKERS),
            data_dir,
        }
    }

    /// Reject values that would silently make every face unknown.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(ConfigError::InvalidTolerance(self.tolerance));
        }
        Ok(())
    }

    pub fn training_dir(&self) -> PathBuf {
        self.data_dir.join("training")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.data_dir.join("output")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.data_dir.join("validation")
    }

    pub fn model_paths(&self) -> ModelPaths {
        ModelPaths::in_dir(&self.model_dir)
    }

    pub fn font_path(&self) -> Option<&Path> {
        self.font_path.as_deref()
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            detection_every: self.detection_every,
            identification_every: self.identification_every,
            speed: self.move_speed,
            backend: self.backend,
        }
    }
}

/// `$XDG_DATA_HOME/kspy/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("kspy")
        .join("models")
}

fn env_f32(key: &str, default: f32) -> f32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_layout_follows_data_dir() {
        let config = Config {
            data_dir: PathBuf::from("/srv/kspy"),
            ..Config::from_env()
        };
        assert_eq!(config.training_dir(), PathBuf::from("/srv/kspy/training"));
        assert_eq!(config.output_dir(), PathBuf::from("/srv/kspy/output"));
        assert_eq!(config.validation_dir(), PathBuf::from("/srv/kspy/validation"));
    }

    #[test]
    fn test_tracker_config_carries_cadences() {
        let config = Config {
            detection_every: 3,
            identification_every: 9,
            move_speed: 1.5,
            backend: DetectorBackend::Accurate,
            ..Config::from_env()
        };
        let tracker = config.tracker_config();
        assert_eq!(tracker.detection_every, 3);
        assert_eq!(tracker.identification_every, 9);
        assert_eq!(tracker.speed, 1.5);
        assert_eq!(tracker.backend, DetectorBackend::Accurate);
    }

    #[test]
    fn test_env_helpers_fall_back_on_garbage() {
        assert_eq!(env_u64("KSPY_TEST_UNSET_VARIABLE", 7), 7);
        assert_eq!(env_f32("KSPY_TEST_UNSET_VARIABLE", 0.25), 0.25);
    }

    #[test]
    fn test_tolerance_must_be_finite_and_non_negative() {
        for bad in [f32::NAN, f32::INFINITY, -0.1] {
            let config = Config {
                tolerance: bad,
                ..Config::from_env()
            };
            assert!(matches!(config.validate(), Err(ConfigError::InvalidTolerance(_))), "{bad}");
        }
        for good in [0.0, DEFAULT_TOLERANCE] {
            let config = Config {
                tolerance: good,
                ..Config::from_env()
            };
            assert!(config.validate().is_ok(), "{good}");
        }
    }

    #[test]
    fn test_tick_period_never_zero() {
        let config = Config {
            tick_ms: 0,
            ..Config::from_env()
        };
        assert_eq!(config.tick_period(), Duration::from_millis(1));
    }
}
