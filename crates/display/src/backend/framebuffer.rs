//! Linux framebuffer (`/dev/fbN`) backend
//!
//! Raw RGB565, row-major, written at offset 0 every frame.

use super::{PresentationBackend, SurfaceInfo};
use crate::packer::PixelFormat;
use crate::DisplayError;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// FBIOGET_VSCREENINFO from linux/fb.h
const FBIOGET_VSCREENINFO: u32 = 0x4600;

/// struct fb_var_screeninfo (160 bytes); only the leading fields are read
#[repr(C)]
#[derive(Default)]
struct FbVarScreenInfo {
    xres: u32,
    yres: u32,
    xres_virtual: u32,
    yres_virtual: u32,
    xoffset: u32,
    yoffset: u32,
    bits_per_pixel: u32,
    grayscale: u32,
    _rest: [u32; 32],
}

/// Ask the device for its visible geometry.
///
/// Regular files and non-fb devices fail with ENOTTY.
fn query_geometry(file: &File) -> std::io::Result<(u32, u32, u32)> {
    let mut info = FbVarScreenInfo::default();
    // SAFETY: the fd is open for the duration of the call and `info` matches
    // the kernel's fb_var_screeninfo layout and size.
    let ret = unsafe {
        libc::ioctl(
            file.as_raw_fd(),
            FBIOGET_VSCREENINFO as _,
            &mut info as *mut FbVarScreenInfo,
        )
    };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((info.xres, info.yres, info.bits_per_pixel))
}

/// Framebuffer character-device backend
pub struct FramebufferBackend {
    path: PathBuf,
    width: u32,
    height: u32,
    device: Option<File>,
    surface: Option<SurfaceInfo>,
}

impl FramebufferBackend {
    /// `width`/`height` are used when the device does not report a 16-bpp mode
    pub fn new(path: &Path, width: u32, height: u32) -> Self {
        Self {
            path: path.to_path_buf(),
            width,
            height,
            device: None,
            surface: None,
        }
    }

    fn write_frame(device: &mut File, packed: &[u8]) -> std::io::Result<()> {
        device.seek(SeekFrom::Start(0))?;
        device.write_all(packed)?;
        device.flush()
    }
}

impl PresentationBackend for FramebufferBackend {
    fn name(&self) -> &'static str {
        "framebuffer"
    }

    fn start(&mut self) -> Result<SurfaceInfo, DisplayError> {
        if let Some(surface) = self.surface {
            return Ok(surface);
        }
        if self.width == 0 || self.height == 0 {
            return Err(DisplayError::Acquisition(format!(
                "invalid framebuffer size {}x{}",
                self.width, self.height
            )));
        }

        let mut device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|e| DisplayError::acquisition(&self.path.display().to_string(), e))?;

        let (width, height) = match query_geometry(&device) {
            Ok((w, h, 16)) if w > 0 && h > 0 => (w, h),
            Ok((w, h, bpp)) => {
                warn!(
                    "{} reports {}x{}@{}bpp, using configured {}x{} RGB565",
                    self.path.display(),
                    w,
                    h,
                    bpp,
                    self.width,
                    self.height
                );
                (self.width, self.height)
            }
            Err(e) => {
                debug!("No fb geometry for {}: {}", self.path.display(), e);
                (self.width, self.height)
            }
        };

        let surface = SurfaceInfo::packed(width, height, PixelFormat::Rgb565);
        let black = vec![0u8; surface.frame_len()];
        Self::write_frame(&mut device, &black)
            .map_err(|e| DisplayError::acquisition("initial black frame", e))?;

        info!(
            "Framebuffer display started: {}x{} RGB565 ({})",
            width,
            height,
            self.path.display()
        );
        self.device = Some(device);
        self.surface = Some(surface);
        Ok(surface)
    }

    fn present(&mut self, packed: &[u8]) -> Result<(), DisplayError> {
        let (Some(device), Some(surface)) = (self.device.as_mut(), self.surface) else {
            return Err(DisplayError::Transient("framebuffer not started".to_string()));
        };
        if packed.len() != surface.frame_len() {
            return Err(DisplayError::Transient(format!(
                "frame is {} bytes, surface needs {}",
                packed.len(),
                surface.frame_len()
            )));
        }
        Self::write_frame(device, packed)
            .map_err(|e| DisplayError::Transient(format!("{}: {}", self.path.display(), e)))
    }

    fn stop(&mut self) {
        let surface = self.surface.take();
        if let (Some(mut device), Some(surface)) = (self.device.take(), surface) {
            let black = vec![0u8; surface.frame_len()];
            if let Err(e) = Self::write_frame(&mut device, &black) {
                warn!("Failed to blank framebuffer: {}", e);
            }
            info!("Framebuffer display stopped");
        }
    }

    fn surface(&self) -> Option<SurfaceInfo> {
        self.surface
    }
}

impl Drop for FramebufferBackend {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_screeninfo_layout() {
        assert_eq!(std::mem::size_of::<FbVarScreenInfo>(), 160);
    }

    #[test]
    fn test_start_fails_cleanly_without_device() {
        let mut backend = FramebufferBackend::new(Path::new("/nonexistent/fb0"), 4, 2);
        assert!(matches!(backend.start(), Err(DisplayError::Acquisition(_))));
        assert!(backend.surface().is_none());
        assert!(backend.present(&[0; 16]).is_err());
        backend.stop();
    }

    #[test]
    fn test_regular_file_as_framebuffer() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let mut backend = FramebufferBackend::new(file.path(), 4, 2);

        let surface = backend.start().unwrap();
        assert_eq!(surface, SurfaceInfo::packed(4, 2, PixelFormat::Rgb565));
        // Black frame on start
        assert_eq!(std::fs::read(file.path()).unwrap(), vec![0u8; 16]);

        let frame: Vec<u8> = (1..=16).collect();
        backend.present(&frame).unwrap();
        backend.present(&frame).unwrap();
        // Every frame lands at offset 0.
        assert_eq!(std::fs::read(file.path()).unwrap(), frame);

        assert!(matches!(
            backend.present(&frame[..8]),
            Err(DisplayError::Transient(_))
        ));

        backend.stop();
        backend.stop();
        assert!(backend.surface().is_none());
        assert_eq!(std::fs::read(file.path()).unwrap(), vec![0u8; 16]);
    }
}
