//! DRM/KMS backend
//!
//! Start-up picks the first connected connector that has a mode, resolves a
//! CRTC for it, allocates a 32-bpp dumb buffer, wraps it in a framebuffer
//! object, maps it and performs the mode-set. The CRTC's existing mode is read
//! back first; if the preferred mode-set fails the backend retries with that
//! mode. With nothing previously configured there is no fallback and start
//! fails.
//!
//! Every failure path releases what was acquired, in the same order as
//! `stop`: unmap, remove framebuffer, destroy dumb buffer, close device.

mod device;
mod uapi;

pub use device::{
    CardDevice, ConnectorInfo, CrtcInfo, DumbBuffer, EncoderInfo, KmsDevice, MappedBuffer,
    Resources,
};
pub use uapi::DrmModeInfo;

use super::{PresentationBackend, SurfaceInfo};
use crate::packer::PixelFormat;
use crate::DisplayError;
use std::path::Path;
use tracing::{debug, info, warn};

/// Dumb buffer, its framebuffer object and CPU mapping
struct Scanout<M> {
    buffer: DumbBuffer,
    fb_id: u32,
    map: Option<M>,
}

struct Session<D: KmsDevice> {
    device: D,
    scanout: Scanout<D::Mapping>,
    mode: DrmModeInfo,
    surface: SurfaceInfo,
}

type Opener<D> = Box<dyn FnMut() -> Result<D, DisplayError> + Send>;

/// DRM/KMS presentation backend
pub struct DrmKmsBackend<D: KmsDevice = CardDevice> {
    label: String,
    opener: Opener<D>,
    session: Option<Session<D>>,
}

impl DrmKmsBackend<CardDevice> {
    /// Backend for a `/dev/dri/cardN` node
    pub fn card(path: &Path) -> Self {
        let path = path.to_path_buf();
        Self::new(path.display().to_string(), move || CardDevice::open(&path))
    }
}

impl<D: KmsDevice> DrmKmsBackend<D> {
    /// Backend opening its device through `opener` on every start
    pub fn new<F>(label: impl Into<String>, opener: F) -> Self
    where
        F: FnMut() -> Result<D, DisplayError> + Send + 'static,
    {
        Self {
            label: label.into(),
            opener: Box::new(opener),
            session: None,
        }
    }

    /// Mode in use, if started
    pub fn mode(&self) -> Option<&DrmModeInfo> {
        self.session.as_ref().map(|s| &s.mode)
    }
}

/// First CRTC able to drive `conn`: the encoder's current one, else the first
/// allowed by its capability mask
fn resolve_crtc<D: KmsDevice>(device: &mut D, res: &Resources, conn: &ConnectorInfo) -> Option<u32> {
    let candidates = std::iter::once(conn.encoder_id)
        .filter(|&id| id != 0)
        .chain(conn.encoders.iter().copied());

    for encoder_id in candidates {
        let encoder = match device.encoder(encoder_id) {
            Ok(encoder) => encoder,
            Err(e) => {
                debug!("Skipping encoder {}: {}", encoder_id, e);
                continue;
            }
        };
        if encoder.crtc_id != 0 {
            return Some(encoder.crtc_id);
        }
        let allowed = res
            .crtcs
            .iter()
            .take(32)
            .enumerate()
            .find(|(i, _)| encoder.possible_crtcs & (1 << i) != 0);
        if let Some((_, &crtc_id)) = allowed {
            return Some(crtc_id);
        }
    }
    None
}

/// Pick connector, CRTC and preferred mode
fn select_output<D: KmsDevice>(device: &mut D) -> Result<(u32, u32, DrmModeInfo), DisplayError> {
    let res = device.resources()?;
    for &connector_id in &res.connectors {
        let conn = match device.connector(connector_id) {
            Ok(conn) => conn,
            Err(e) => {
                debug!("Skipping connector {}: {}", connector_id, e);
                continue;
            }
        };
        let Some(&mode) = conn.modes.first() else {
            continue;
        };
        if !conn.connected {
            continue;
        }
        if let Some(crtc_id) = resolve_crtc(device, &res, &conn) {
            return Ok((connector_id, crtc_id, mode));
        }
    }
    Err(DisplayError::Acquisition(
        "no connected connector with a usable mode and CRTC".to_string(),
    ))
}

fn allocate<D: KmsDevice>(
    device: &mut D,
    width: u32,
    height: u32,
) -> Result<Scanout<D::Mapping>, DisplayError> {
    let buffer = device.create_dumb(width, height, 32)?;

    let fb_id = match device.add_framebuffer(&buffer) {
        Ok(fb_id) => fb_id,
        Err(e) => {
            destroy_buffer(device, buffer.handle);
            return Err(e);
        }
    };

    match device.map_dumb(&buffer) {
        Ok(map) => Ok(Scanout {
            buffer,
            fb_id,
            map: Some(map),
        }),
        Err(e) => {
            remove_fb(device, fb_id);
            destroy_buffer(device, buffer.handle);
            Err(e)
        }
    }
}

fn remove_fb<D: KmsDevice>(device: &mut D, fb_id: u32) {
    if let Err(e) = device.remove_framebuffer(fb_id) {
        warn!("Failed to remove DRM framebuffer {}: {}", fb_id, e);
    }
}

fn destroy_buffer<D: KmsDevice>(device: &mut D, handle: u32) {
    if let Err(e) = device.destroy_dumb(handle) {
        warn!("Failed to destroy dumb buffer {}: {}", handle, e);
    }
}

fn release<D: KmsDevice>(device: &mut D, mut scanout: Scanout<D::Mapping>) {
    drop(scanout.map.take());
    remove_fb(device, scanout.fb_id);
    destroy_buffer(device, scanout.buffer.handle);
}

/// Mode-set with `preferred`, falling back to the previously active mode
fn modeset<D: KmsDevice>(
    device: &mut D,
    crtc_id: u32,
    connector_id: u32,
    preferred: DrmModeInfo,
    saved: Option<DrmModeInfo>,
) -> Result<(Scanout<D::Mapping>, DrmModeInfo), DisplayError> {
    let scanout = allocate(device, preferred.width(), preferred.height())?;
    let err = match device.set_crtc(crtc_id, scanout.fb_id, connector_id, &preferred) {
        Ok(()) => return Ok((scanout, preferred)),
        Err(e) => e,
    };

    let Some(saved) = saved else {
        release(device, scanout);
        return Err(DisplayError::Acquisition(format!(
            "mode-set {} failed and no previous mode is active: {}",
            preferred.name(),
            err
        )));
    };
    warn!(
        "Mode-set {} failed ({}), falling back to previous mode {}",
        preferred.name(),
        err,
        saved.name()
    );

    let scanout = if (saved.width(), saved.height()) == (preferred.width(), preferred.height()) {
        scanout
    } else {
        release(device, scanout);
        allocate(device, saved.width(), saved.height())?
    };
    match device.set_crtc(crtc_id, scanout.fb_id, connector_id, &saved) {
        Ok(()) => Ok((scanout, saved)),
        Err(e) => {
            release(device, scanout);
            Err(DisplayError::Acquisition(format!(
                "fallback mode-set {} failed: {}",
                saved.name(),
                e
            )))
        }
    }
}

impl<D: KmsDevice> PresentationBackend for DrmKmsBackend<D> {
    fn name(&self) -> &'static str {
        "drm"
    }

    fn start(&mut self) -> Result<SurfaceInfo, DisplayError> {
        if let Some(session) = &self.session {
            return Ok(session.surface);
        }

        let mut device = (self.opener)()?;
        let (connector_id, crtc_id, preferred) = select_output(&mut device)?;

        let saved = match device.crtc(crtc_id) {
            Ok(crtc) => crtc.mode,
            Err(e) => {
                debug!("Could not read CRTC {} state: {}", crtc_id, e);
                None
            }
        };

        let (mut scanout, mode) = modeset(&mut device, crtc_id, connector_id, preferred, saved)?;
        if let Some(map) = scanout.map.as_mut() {
            map.as_mut().fill(0);
        }

        let surface = SurfaceInfo {
            width: mode.width(),
            height: mode.height(),
            format: PixelFormat::Xrgb8888,
            pitch: scanout.buffer.pitch,
        };
        info!(
            "DRM/KMS display started: {}x{} @ {}Hz, pitch {} ({})",
            surface.width, surface.height, mode.vrefresh, surface.pitch, self.label
        );
        self.session = Some(Session {
            device,
            scanout,
            mode,
            surface,
        });
        Ok(surface)
    }

    fn present(&mut self, packed: &[u8]) -> Result<(), DisplayError> {
        let Some(session) = self.session.as_mut() else {
            return Err(DisplayError::Transient("DRM display not started".to_string()));
        };
        let surface = session.surface;
        if packed.len() != surface.frame_len() {
            return Err(DisplayError::Transient(format!(
                "frame is {} bytes, surface needs {}",
                packed.len(),
                surface.frame_len()
            )));
        }
        let Some(map) = session.scanout.map.as_mut() else {
            return Err(DisplayError::Transient("DRM buffer not mapped".to_string()));
        };

        let dst = map.as_mut();
        let row = surface.width as usize * 4;
        let pitch = surface.pitch as usize;
        let needed = pitch * (surface.height as usize).saturating_sub(1) + row;
        if pitch < row || dst.len() < needed {
            return Err(DisplayError::Transient(format!(
                "mapping of {} bytes cannot hold {} rows at pitch {}",
                dst.len(),
                surface.height,
                pitch
            )));
        }

        if pitch == row {
            dst[..packed.len()].copy_from_slice(packed);
        } else {
            for (y, src) in packed.chunks_exact(row).enumerate() {
                let start = y * pitch;
                dst[start..start + row].copy_from_slice(src);
            }
        }
        Ok(())
    }

    fn stop(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if let Some(map) = session.scanout.map.as_mut() {
            map.as_mut().fill(0);
        }
        release(&mut session.device, session.scanout);
        drop(session.device);
        info!("DRM/KMS display stopped ({})", self.label);
    }

    fn surface(&self) -> Option<SurfaceInfo> {
        self.session.as_ref().map(|s| s.surface)
    }
}

impl<D: KmsDevice> Drop for DrmKmsBackend<D> {
    fn drop(&mut self) {
        self.stop();
    }
}
