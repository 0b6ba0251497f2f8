//! Configuration loading and validation
//!
//! Built-in defaults, then an optional TOML file, then `DASHCAM__`-prefixed
//! environment variables (`DASHCAM__DISPLAY__BACKEND=drm`). The result is
//! validated once before any component is constructed.

use camera_capture::{CameraConfig, CameraRole};
use config::{Config, Environment, File, FileFormat};
use display::{DisplayConfig, OverlayConfig};
use recorder::{DiskPolicy, RecordingConfig, RecoveryConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use telemetry::TelemetryConfig;
use thiserror::Error;
use tracing::Level;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/dashcam/dashcam.toml";

/// Environment variable prefix
const ENV_PREFIX: &str = "DASHCAM";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Front and rear camera settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraSettings {
    pub front: CameraConfig,
    pub rear: CameraConfig,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            front: CameraConfig::front(),
            rear: CameraConfig::rear(),
        }
    }
}

impl CameraSettings {
    /// Both slots, front first
    pub fn all(&self) -> [&CameraConfig; 2] {
        [&self.front, &self.rear]
    }

    pub fn get(&self, role: CameraRole) -> &CameraConfig {
        match role {
            CameraRole::Front => &self.front,
            CameraRole::Rear => &self.rear,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = &CameraConfig> {
        self.all().into_iter().filter(|c| c.enabled)
    }
}

/// Complete dashcam configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashcamConfig {
    /// tracing level name
    pub log_level: String,
    /// Emit JSON log lines
    pub log_json: bool,
    /// Installation root override (`DASHCAM__BASE_DIR`)
    pub base_dir: Option<PathBuf>,
    /// Wait before touching any hardware (seconds)
    pub startup_delay_secs: f64,
    /// Seconds between status log lines
    pub status_interval_secs: u64,
    pub display: DisplayConfig,
    pub overlay: OverlayConfig,
    pub cameras: CameraSettings,
    pub recording: RecordingConfig,
    pub disk: DiskPolicy,
    pub recovery: RecoveryConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for DashcamConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            log_json: false,
            base_dir: None,
            startup_delay_secs: 3.0,
            status_interval_secs: 30,
            display: DisplayConfig::default(),
            overlay: OverlayConfig::default(),
            cameras: CameraSettings::default(),
            recording: RecordingConfig::default(),
            disk: DiskPolicy::default(),
            recovery: RecoveryConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl DashcamConfig {
    /// Load from `path` (optional) layered under the process environment
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: &Path, env: Environment) -> Result<Self, ConfigError> {
        // Defaults go in as the bottom layer so a partially specified section
        // keeps the defaults of its own slot (e.g. the rear camera).
        let defaults = Config::try_from(&DashcamConfig::default())?;
        let settings = Config::builder()
            .add_source(defaults)
            .add_source(File::from(path).format(FileFormat::Toml).required(false))
            .add_source(
                env.prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: DashcamConfig = settings.try_deserialize()?;
        if let Some(base_dir) = &config.base_dir {
            config.recording.base_dir = base_dir.clone();
        }
        // The slot decides the role.
        config.cameras.front.role = CameraRole::Front;
        config.cameras.rear.role = CameraRole::Rear;
        Ok(config)
    }

    pub fn startup_delay(&self) -> Duration {
        Duration::from_secs_f64(self.startup_delay_secs.max(0.0))
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_secs.max(1))
    }

    pub fn log_level(&self) -> Result<Level, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("unknown log level '{}'", self.log_level)))
    }

    /// Reject values no component can run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        self.log_level()?;

        if self.cameras.enabled().next().is_none() {
            return invalid("no camera enabled".into());
        }
        for camera in self.cameras.enabled() {
            if camera.width == 0 || camera.height == 0 {
                return invalid(format!("{} camera has zero size", camera.role));
            }
            if camera.fps == 0 {
                return invalid(format!("{} camera fps must be positive", camera.role));
            }
            if camera.rotation % 90 != 0 {
                return invalid(format!(
                    "{} camera rotation {} is not a multiple of 90",
                    camera.role, camera.rotation
                ));
            }
        }

        if self.display.enabled {
            if self.display.width == 0 || self.display.height == 0 {
                return invalid("display has zero size".into());
            }
            if self.display.fps == 0 {
                return invalid("display fps must be positive".into());
            }
            if !self.cameras.get(self.display.camera).enabled {
                return invalid(format!("display camera '{}' is disabled", self.display.camera));
            }
        }

        if self.overlay.enabled {
            self.overlay.check_formats().map_err(ConfigError::Invalid)?;
        }

        if self.recording.segment_duration_secs == 0 {
            return invalid("segment duration must be positive".into());
        }

        let mark = self.disk.high_water_mark;
        if !(mark > 0.0 && mark < 1.0) {
            return invalid(format!("high-water mark {} outside (0, 1)", mark));
        }
        if self.disk.min_free_gb < 0.0 {
            return invalid("min_free_gb must not be negative".into());
        }

        Ok(())
    }
}
