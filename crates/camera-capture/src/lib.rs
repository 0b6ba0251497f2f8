//! Camera Capture Library for the Dashcam
//!
//! Provides the pieces shared by the display and recording pipelines:
//! - Raw frames and pixel layouts
//! - Single-slot latest-frame bus between the capture and render threads
//! - The camera collaborator interface (acquisition + hardware encoder control)
//! - A synthetic test-pattern camera for bench runs without sensors

pub mod bus;
pub mod frame;
pub mod source;

pub use bus::FrameBus;
pub use frame::{Frame, PixelLayout};
pub use source::{Camera, PatternCamera};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Camera error types
#[derive(Error, Debug)]
pub enum CameraError {
    #[error("Failed to open camera: {0}")]
    Open(String),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Encoder error: {0}")]
    Encoder(String),

    #[error("Camera not initialized")]
    NotInitialized,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Camera mounting role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraRole {
    /// Forward-facing recording camera
    Front,
    /// Rear camera, usually feeding the mirror display
    Rear,
}

impl CameraRole {
    /// Short lowercase name used in logs and file names
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraRole::Front => "front",
            CameraRole::Rear => "rear",
        }
    }
}

impl std::fmt::Display for CameraRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Whether this camera is used at all
    pub enabled: bool,
    /// Sensor index (CSI port)
    pub index: u32,
    /// Camera role
    pub role: CameraRole,
    /// Capture width
    pub width: u32,
    /// Capture height
    pub height: u32,
    /// Target FPS
    pub fps: u32,
    /// Rotation in degrees (multiple of 90)
    pub rotation: u32,
    /// Horizontal flip
    pub hflip: bool,
    /// Vertical flip
    pub vflip: bool,
    /// Encoder bitrate (bits per second)
    pub bitrate: u32,
    /// File name prefix for segments
    pub prefix: String,
    /// Record this camera
    pub recording_enabled: bool,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self::front()
    }
}

impl CameraConfig {
    /// Front camera config (CAM0, recording only)
    pub fn front() -> Self {
        Self {
            enabled: true,
            index: 0,
            role: CameraRole::Front,
            width: 1920,
            height: 1080,
            fps: 15,
            rotation: 180,
            hflip: false,
            vflip: false,
            bitrate: 8_000_000,
            prefix: "front".to_string(),
            recording_enabled: true,
        }
    }

    /// Rear camera config (CAM1, recording + display)
    pub fn rear() -> Self {
        Self {
            enabled: true,
            index: 1,
            role: CameraRole::Rear,
            width: 1920,
            height: 1080,
            fps: 15,
            rotation: 180,
            hflip: true,
            vflip: false,
            bitrate: 8_000_000,
            prefix: "rear".to_string(),
            recording_enabled: true,
        }
    }
}
