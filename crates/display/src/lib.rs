//! Dashcam Display Pipeline
//!
//! Turns the latest camera frame into pixels on the mirror screen:
//! - Rotation/flip/mirror transform (skipped when the sensor already did it)
//! - Cached overlay (time, date, speed, fuel, CAN status, REC) re-rendered only on change
//! - Bounding-box alpha compositing
//! - RGB565 / XRGB8888 packing
//! - Framebuffer and DRM/KMS presentation backends
//! - The render loop driving all of the above at the target frame rate

pub mod backend;
pub mod compositor;
pub mod overlay;
pub mod packer;
pub mod render_loop;
pub mod transform;

pub use backend::{create_backend, BackendKind, PresentationBackend, SurfaceInfo};
pub use compositor::blend;
pub use overlay::{
    OverlayCache, OverlayConfig, OverlayMask, OverlayRenderer, OverlaySample, OverlayState,
    TextOverlayRenderer,
};
pub use packer::{Packer, PixelFormat};
pub use render_loop::{DisplayStats, RenderLoop, RenderTiming};
pub use transform::TransformStage;

use camera_capture::CameraRole;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Display error types
#[derive(Error, Debug)]
pub enum DisplayError {
    /// Device open or ioctl failure while acquiring the surface
    #[error("Failed to acquire display: {0}")]
    Acquisition(String),

    /// A single frame could not be written
    #[error("Frame write failed: {0}")]
    Transient(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl DisplayError {
    pub(crate) fn acquisition(context: &str, err: std::io::Error) -> Self {
        DisplayError::Acquisition(format!("{}: {}", context, err))
    }
}

/// Display configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Run the display pipeline at all
    pub enabled: bool,
    /// Presentation backend
    pub backend: BackendKind,
    /// Framebuffer device
    pub fb_device: PathBuf,
    /// DRM card node
    pub drm_card: PathBuf,
    /// Surface width when the device does not report one
    pub width: u32,
    /// Surface height when the device does not report one
    pub height: u32,
    /// Target frame rate
    pub fps: u32,
    /// Extra horizontal flip, as in a rear-view mirror
    pub mirror_mode: bool,
    /// Camera feeding the screen
    pub camera: CameraRole,
    /// Log one FPS/timing line per second
    pub log_fps: bool,
    /// Warn when a tick overruns its budget
    pub log_dropped_frames: bool,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendKind::Framebuffer,
            fb_device: PathBuf::from("/dev/fb0"),
            drm_card: PathBuf::from("/dev/dri/card1"),
            width: 1920,
            height: 1080,
            fps: 15,
            mirror_mode: true,
            camera: CameraRole::Rear,
            log_fps: true,
            log_dropped_frames: true,
        }
    }
}

impl DisplayConfig {
    /// Time budget of one render tick
    pub fn frame_budget(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps.max(1) as f64)
    }
}
