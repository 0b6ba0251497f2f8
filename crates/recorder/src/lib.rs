//! Dashcam Recording Pipeline
//!
//! Everything between the cameras' hardware encoders and the disk:
//! - Per-camera recorder state machine with current/archive file handling
//! - Coordinated segment rotation across cameras
//! - Disk-usage guardian with oldest-first eviction
//! - Bounded camera recovery with optional reboot
//! - The capture loop feeding the display's frame bus

pub mod capture;
pub mod clock;
pub mod disk;
pub mod recorder;
pub mod recovery;
pub mod scheduler;
#[cfg(test)]
mod test_support;

pub use capture::spawn_capture_loop;
pub use clock::{Clock, ManualClock, SystemClock};
pub use disk::{CleanupReport, DiskGuardian, DiskUsage, StatvfsUsage, UsageSource};
pub use recorder::{
    CameraRecorder, CameraStats, RecorderState, RecordingGroup, Segment, SharedRecorder,
};
pub use recovery::{RebootCommand, RecoveryManager, RecoveryOutcome, SystemControl};
pub use scheduler::SegmentScheduler;

use camera_capture::CameraError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Recorder error types
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid recorder state: {0}")]
    InvalidState(String),
}

/// Recording configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Installation root; videos live under `<base_dir>/videos`
    pub base_dir: PathBuf,
    /// Segment length in seconds
    pub segment_duration_secs: u64,
    /// Encoder flush pause between stop and restart on rotation
    pub rotation_pause_ms: u64,
    /// Rotation check interval
    pub check_interval_ms: u64,
    /// Keep going when one of two cameras fails to initialize
    pub continue_on_single_camera: bool,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/opt/dashcam"),
            segment_duration_secs: 60,
            rotation_pause_ms: 500,
            check_interval_ms: 1000,
            continue_on_single_camera: true,
        }
    }
}

impl RecordingConfig {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_secs(self.segment_duration_secs)
    }

    pub fn rotation_pause(&self) -> Duration {
        Duration::from_millis(self.rotation_pause_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn paths(&self) -> VideoPaths {
        VideoPaths::under(&self.base_dir)
    }
}

/// Video directory layout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoPaths {
    /// Filesystem whose usage the disk guardian watches
    pub root: PathBuf,
    /// Segments being written
    pub current: PathBuf,
    /// Completed segments, eligible for eviction
    pub archive: PathBuf,
}

impl VideoPaths {
    pub fn under(base_dir: &Path) -> Self {
        let root = base_dir.join("videos");
        Self {
            current: root.join("current"),
            archive: root.join("archive"),
            root,
        }
    }

    /// Create `current` and `archive` if missing
    pub fn create(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.current)?;
        std::fs::create_dir_all(&self.archive)
    }

    /// Move segments left in `current` (power loss, failed rename) into
    /// `archive`. Only safe before any encoder starts.
    pub fn archive_leftovers(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut moved = Vec::new();
        for entry in std::fs::read_dir(&self.current)? {
            let path = entry?.path();
            if !path.is_file()
                || path.extension().and_then(|e| e.to_str()) != Some(recorder::SEGMENT_EXTENSION)
            {
                continue;
            }
            let Some(name) = path.file_name() else {
                continue;
            };
            let target = self.archive.join(name);
            match std::fs::rename(&path, &target) {
                Ok(()) => {
                    info!("Archived leftover segment {}", target.display());
                    moved.push(target);
                }
                Err(e) => warn!("Could not archive leftover {}: {}", path.display(), e),
            }
        }
        moved.sort();
        Ok(moved)
    }
}

/// Disk eviction policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskPolicy {
    /// Used fraction above which eviction starts
    pub high_water_mark: f64,
    /// Free space floor in GB
    pub min_free_gb: f64,
    /// Seconds between usage checks
    pub check_interval_secs: u64,
}

impl Default for DiskPolicy {
    fn default() -> Self {
        Self {
            high_water_mark: 0.75,
            min_free_gb: 10.0,
            check_interval_secs: 60,
        }
    }
}

impl DiskPolicy {
    /// Eviction stops once usage is this far below the high-water mark
    pub const HYSTERESIS: f64 = 0.05;

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Camera recovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Consecutive recoveries allowed before giving up on a camera
    pub camera_retry_attempts: u32,
    /// Wait between close and re-init
    pub camera_retry_delay_secs: f64,
    /// Reboot the system once retries are exhausted
    pub camera_failure_reboot: bool,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            camera_retry_attempts: 3,
            camera_retry_delay_secs: 2.0,
            camera_failure_reboot: false,
        }
    }
}

impl RecoveryConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.camera_retry_delay_secs.max(0.0))
    }
}
