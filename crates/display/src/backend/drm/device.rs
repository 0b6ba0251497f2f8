//! Mode-setting device access
//!
//! [`KmsDevice`] is the small slice of the KMS API the backend needs.
//! [`CardDevice`] implements it with raw ioctls and mmap on a `/dev/dri/cardN`
//! node.

use super::uapi::*;
use crate::DisplayError;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::debug;

/// Mode object ids
#[derive(Debug, Clone, Default)]
pub struct Resources {
    pub crtcs: Vec<u32>,
    pub connectors: Vec<u32>,
    pub encoders: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct ConnectorInfo {
    pub id: u32,
    pub connected: bool,
    /// Encoder currently driving the connector (0 if none)
    pub encoder_id: u32,
    pub encoders: Vec<u32>,
    /// Preferred mode first
    pub modes: Vec<DrmModeInfo>,
}

#[derive(Debug, Clone, Copy)]
pub struct EncoderInfo {
    pub id: u32,
    /// CRTC currently bound (0 if none)
    pub crtc_id: u32,
    /// Bit i set if `Resources::crtcs[i]` can drive this encoder
    pub possible_crtcs: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CrtcInfo {
    pub id: u32,
    pub fb_id: u32,
    /// Active mode, if any
    pub mode: Option<DrmModeInfo>,
}

/// Kernel dumb buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumbBuffer {
    pub handle: u32,
    pub width: u32,
    pub height: u32,
    /// Bytes per row
    pub pitch: u32,
    pub size: u64,
}

/// KMS operations used by the DRM backend.
///
/// Closing the device is dropping it; unmapping a buffer is dropping its
/// mapping.
pub trait KmsDevice: Send {
    type Mapping: AsMut<[u8]> + Send;

    fn resources(&mut self) -> Result<Resources, DisplayError>;
    fn connector(&mut self, id: u32) -> Result<ConnectorInfo, DisplayError>;
    fn encoder(&mut self, id: u32) -> Result<EncoderInfo, DisplayError>;
    fn crtc(&mut self, id: u32) -> Result<CrtcInfo, DisplayError>;

    fn create_dumb(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, DisplayError>;
    fn add_framebuffer(&mut self, buffer: &DumbBuffer) -> Result<u32, DisplayError>;
    fn map_dumb(&mut self, buffer: &DumbBuffer) -> Result<Self::Mapping, DisplayError>;
    fn set_crtc(
        &mut self,
        crtc_id: u32,
        fb_id: u32,
        connector_id: u32,
        mode: &DrmModeInfo,
    ) -> Result<(), DisplayError>;
    fn remove_framebuffer(&mut self, fb_id: u32) -> Result<(), DisplayError>;
    fn destroy_dumb(&mut self, handle: u32) -> Result<(), DisplayError>;
}

/// Shared, writable mapping of a dumb buffer
pub struct MappedBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: the mapping is exclusively owned and only reachable through &mut.
unsafe impl Send for MappedBuffer {}

impl AsMut<[u8]> for MappedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr/len describe a live MAP_SHARED mapping owned by self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/len came from a successful mmap and are unmapped once.
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        if ret != 0 {
            debug!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// DRM card node
pub struct CardDevice {
    fd: OwnedFd,
    path: PathBuf,
}

impl CardDevice {
    pub fn open(path: &Path) -> Result<Self, DisplayError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| DisplayError::acquisition(&path.display().to_string(), e))?;
        debug!("Opened DRM device {}", path.display());
        Ok(Self {
            fd: OwnedFd::from(file),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ioctl<T>(&self, request: u32, arg: &mut T) -> io::Result<()> {
        loop {
            // SAFETY: `arg` is a #[repr(C)] struct whose size is encoded in
            // `request`, and any pointers inside it reference live buffers.
            let ret = unsafe { libc::ioctl(self.fd.as_raw_fd(), request as _, arg as *mut T) };
            if ret >= 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                _ => return Err(err),
            }
        }
    }

    fn call<T>(&self, what: &str, request: u32, arg: &mut T) -> Result<(), DisplayError> {
        self.ioctl(request, arg)
            .map_err(|e| DisplayError::acquisition(what, e))
    }
}

fn ptr_of<T>(v: &mut [T]) -> u64 {
    v.as_mut_ptr() as u64
}

impl KmsDevice for CardDevice {
    type Mapping = MappedBuffer;

    fn resources(&mut self) -> Result<Resources, DisplayError> {
        let mut counts = DrmModeCardRes::default();
        self.call("GETRESOURCES", DRM_IOCTL_MODE_GETRESOURCES, &mut counts)?;

        let mut fbs = vec![0u32; counts.count_fbs as usize];
        let mut crtcs = vec![0u32; counts.count_crtcs as usize];
        let mut connectors = vec![0u32; counts.count_connectors as usize];
        let mut encoders = vec![0u32; counts.count_encoders as usize];
        let mut res = DrmModeCardRes {
            fb_id_ptr: ptr_of(&mut fbs),
            crtc_id_ptr: ptr_of(&mut crtcs),
            connector_id_ptr: ptr_of(&mut connectors),
            encoder_id_ptr: ptr_of(&mut encoders),
            count_fbs: counts.count_fbs,
            count_crtcs: counts.count_crtcs,
            count_connectors: counts.count_connectors,
            count_encoders: counts.count_encoders,
            ..Default::default()
        };
        self.call("GETRESOURCES", DRM_IOCTL_MODE_GETRESOURCES, &mut res)?;

        crtcs.truncate(res.count_crtcs as usize);
        connectors.truncate(res.count_connectors as usize);
        encoders.truncate(res.count_encoders as usize);
        Ok(Resources {
            crtcs,
            connectors,
            encoders,
        })
    }

    fn connector(&mut self, id: u32) -> Result<ConnectorInfo, DisplayError> {
        let mut counts = DrmModeGetConnector {
            connector_id: id,
            ..Default::default()
        };
        self.call("GETCONNECTOR", DRM_IOCTL_MODE_GETCONNECTOR, &mut counts)?;

        let mut modes = vec![DrmModeInfo::default(); counts.count_modes as usize];
        let mut encoders = vec![0u32; counts.count_encoders as usize];
        let mut conn = DrmModeGetConnector {
            connector_id: id,
            modes_ptr: ptr_of(&mut modes),
            encoders_ptr: ptr_of(&mut encoders),
            count_modes: counts.count_modes,
            count_encoders: counts.count_encoders,
            ..Default::default()
        };
        self.call("GETCONNECTOR", DRM_IOCTL_MODE_GETCONNECTOR, &mut conn)?;

        modes.truncate(conn.count_modes as usize);
        encoders.truncate(conn.count_encoders as usize);
        Ok(ConnectorInfo {
            id,
            connected: conn.connection == DRM_MODE_CONNECTED,
            encoder_id: conn.encoder_id,
            encoders,
            modes,
        })
    }

    fn encoder(&mut self, id: u32) -> Result<EncoderInfo, DisplayError> {
        let mut enc = DrmModeGetEncoder {
            encoder_id: id,
            ..Default::default()
        };
        self.call("GETENCODER", DRM_IOCTL_MODE_GETENCODER, &mut enc)?;
        Ok(EncoderInfo {
            id,
            crtc_id: enc.crtc_id,
            possible_crtcs: enc.possible_crtcs,
        })
    }

    fn crtc(&mut self, id: u32) -> Result<CrtcInfo, DisplayError> {
        let mut crtc = DrmModeCrtc {
            crtc_id: id,
            ..Default::default()
        };
        self.call("GETCRTC", DRM_IOCTL_MODE_GETCRTC, &mut crtc)?;
        Ok(CrtcInfo {
            id,
            fb_id: crtc.fb_id,
            mode: (crtc.mode_valid != 0).then_some(crtc.mode),
        })
    }

    fn create_dumb(&mut self, width: u32, height: u32, bpp: u32) -> Result<DumbBuffer, DisplayError> {
        let mut create = DrmModeCreateDumb {
            width,
            height,
            bpp,
            ..Default::default()
        };
        self.call("CREATE_DUMB", DRM_IOCTL_MODE_CREATE_DUMB, &mut create)?;
        Ok(DumbBuffer {
            handle: create.handle,
            width,
            height,
            pitch: create.pitch,
            size: create.size,
        })
    }

    fn add_framebuffer(&mut self, buffer: &DumbBuffer) -> Result<u32, DisplayError> {
        let mut cmd = DrmModeFbCmd2 {
            width: buffer.width,
            height: buffer.height,
            pixel_format: DRM_FORMAT_XRGB8888,
            ..Default::default()
        };
        cmd.handles[0] = buffer.handle;
        cmd.pitches[0] = buffer.pitch;
        self.call("ADDFB2", DRM_IOCTL_MODE_ADDFB2, &mut cmd)?;
        Ok(cmd.fb_id)
    }

    fn map_dumb(&mut self, buffer: &DumbBuffer) -> Result<MappedBuffer, DisplayError> {
        let mut map = DrmModeMapDumb {
            handle: buffer.handle,
            ..Default::default()
        };
        self.call("MAP_DUMB", DRM_IOCTL_MODE_MAP_DUMB, &mut map)?;

        let len = usize::try_from(buffer.size)
            .map_err(|_| DisplayError::Acquisition(format!("dumb buffer too large: {}", buffer.size)))?;
        let offset = libc::off_t::try_from(map.offset)
            .map_err(|_| DisplayError::Acquisition(format!("bad map offset {:#x}", map.offset)))?;

        // SAFETY: mapping a kernel-provided offset of our own fd; the result
        // is checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                offset,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(DisplayError::acquisition("mmap", io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| DisplayError::Acquisition("mmap returned null".to_string()))?;
        Ok(MappedBuffer { ptr, len })
    }

    fn set_crtc(
        &mut self,
        crtc_id: u32,
        fb_id: u32,
        connector_id: u32,
        mode: &DrmModeInfo,
    ) -> Result<(), DisplayError> {
        let mut connectors = [connector_id];
        let mut crtc = DrmModeCrtc {
            set_connectors_ptr: ptr_of(&mut connectors),
            count_connectors: 1,
            crtc_id,
            fb_id,
            mode_valid: 1,
            mode: *mode,
            ..Default::default()
        };
        self.call("SETCRTC", DRM_IOCTL_MODE_SETCRTC, &mut crtc)
    }

    fn remove_framebuffer(&mut self, fb_id: u32) -> Result<(), DisplayError> {
        let mut id = fb_id;
        self.call("RMFB", DRM_IOCTL_MODE_RMFB, &mut id)
    }

    fn destroy_dumb(&mut self, handle: u32) -> Result<(), DisplayError> {
        let mut destroy = DrmModeDestroyDumb { handle };
        self.call("DESTROY_DUMB", DRM_IOCTL_MODE_DESTROY_DUMB, &mut destroy)
    }
}
