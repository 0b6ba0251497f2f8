//! Presentation backends
//!
//! A backend owns exactly one output surface between `start` and `stop`.
//! `start` either returns a usable surface or leaves nothing allocated.
//! `present` reports single-frame failures as [`DisplayError::Transient`] and
//! keeps the last good image on screen. `stop` blanks the screen and releases
//! everything; calling it twice is harmless.

pub mod drm;
pub mod framebuffer;

pub use drm::DrmKmsBackend;
pub use framebuffer::FramebufferBackend;

use crate::packer::PixelFormat;
use crate::{DisplayConfig, DisplayError};
use serde::{Deserialize, Serialize};

/// Geometry of an acquired surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceInfo {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Bytes per row in device memory
    pub pitch: u32,
}

impl SurfaceInfo {
    /// Surface with rows packed back to back
    pub fn packed(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
            pitch: width * format.bytes_per_pixel() as u32,
        }
    }

    /// Length of one packed frame (no row padding)
    pub fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Output device for packed frames
pub trait PresentationBackend: Send {
    fn name(&self) -> &'static str;

    /// Acquire the surface and show a black frame
    fn start(&mut self) -> Result<SurfaceInfo, DisplayError>;

    /// Show one packed frame of `SurfaceInfo::frame_len` bytes
    fn present(&mut self, packed: &[u8]) -> Result<(), DisplayError>;

    /// Blank and release the surface. Idempotent.
    fn stop(&mut self);

    /// Current surface, if started
    fn surface(&self) -> Option<SurfaceInfo>;
}

/// Backend selected by configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Character-device framebuffer, RGB565
    Framebuffer,
    /// DRM/KMS dumb buffer, XRGB8888
    Drm,
}

/// Build the configured backend (not yet started)
pub fn create_backend(config: &DisplayConfig) -> Box<dyn PresentationBackend> {
    match config.backend {
        BackendKind::Framebuffer => Box::new(FramebufferBackend::new(
            &config.fb_device,
            config.width,
            config.height,
        )),
        BackendKind::Drm => Box::new(DrmKmsBackend::card(&config.drm_card)),
    }
}
