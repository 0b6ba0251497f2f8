//! Kernel mode-setting UAPI (include/uapi/drm/drm_mode.h)

#![allow(dead_code)]

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;
const DRM_IOCTL_BASE: u32 = b'd' as u32;

const fn iowr<T>(nr: u32) -> u32 {
    ((IOC_READ | IOC_WRITE) << 30)
        | ((std::mem::size_of::<T>() as u32) << 16)
        | (DRM_IOCTL_BASE << 8)
        | nr
}

pub const DRM_IOCTL_MODE_GETRESOURCES: u32 = iowr::<DrmModeCardRes>(0xA0);
pub const DRM_IOCTL_MODE_GETCRTC: u32 = iowr::<DrmModeCrtc>(0xA1);
pub const DRM_IOCTL_MODE_SETCRTC: u32 = iowr::<DrmModeCrtc>(0xA2);
pub const DRM_IOCTL_MODE_GETENCODER: u32 = iowr::<DrmModeGetEncoder>(0xA6);
pub const DRM_IOCTL_MODE_GETCONNECTOR: u32 = iowr::<DrmModeGetConnector>(0xA7);
pub const DRM_IOCTL_MODE_RMFB: u32 = iowr::<u32>(0xAF);
pub const DRM_IOCTL_MODE_CREATE_DUMB: u32 = iowr::<DrmModeCreateDumb>(0xB2);
pub const DRM_IOCTL_MODE_MAP_DUMB: u32 = iowr::<DrmModeMapDumb>(0xB3);
pub const DRM_IOCTL_MODE_DESTROY_DUMB: u32 = iowr::<DrmModeDestroyDumb>(0xB4);
pub const DRM_IOCTL_MODE_ADDFB2: u32 = iowr::<DrmModeFbCmd2>(0xB8);

/// "XR24"
pub const DRM_FORMAT_XRGB8888: u32 = 0x3432_5258;

pub const DRM_MODE_CONNECTED: u32 = 1;
pub const DRM_DISPLAY_MODE_LEN: usize = 32;

/// struct drm_mode_modeinfo
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrmModeInfo {
    pub clock: u32,
    pub hdisplay: u16,
    pub hsync_start: u16,
    pub hsync_end: u16,
    pub htotal: u16,
    pub hskew: u16,
    pub vdisplay: u16,
    pub vsync_start: u16,
    pub vsync_end: u16,
    pub vtotal: u16,
    pub vscan: u16,
    pub vrefresh: u32,
    pub flags: u32,
    pub type_: u32,
    pub name: [u8; DRM_DISPLAY_MODE_LEN],
}

impl DrmModeInfo {
    /// Mode with only the visible size, refresh and name filled in
    pub fn with_size(width: u16, height: u16, vrefresh: u32) -> Self {
        let mut mode = Self {
            hdisplay: width,
            vdisplay: height,
            vrefresh,
            ..Default::default()
        };
        let name = format!("{}x{}", width, height);
        let n = name.len().min(DRM_DISPLAY_MODE_LEN - 1);
        mode.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        mode
    }

    pub fn width(&self) -> u32 {
        self.hdisplay as u32
    }

    pub fn height(&self) -> u32 {
        self.vdisplay as u32
    }

    pub fn name(&self) -> String {
        let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }
}

/// struct drm_mode_card_res
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeCardRes {
    pub fb_id_ptr: u64,
    pub crtc_id_ptr: u64,
    pub connector_id_ptr: u64,
    pub encoder_id_ptr: u64,
    pub count_fbs: u32,
    pub count_crtcs: u32,
    pub count_connectors: u32,
    pub count_encoders: u32,
    pub min_width: u32,
    pub max_width: u32,
    pub min_height: u32,
    pub max_height: u32,
}

/// struct drm_mode_crtc
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeCrtc {
    pub set_connectors_ptr: u64,
    pub count_connectors: u32,
    pub crtc_id: u32,
    pub fb_id: u32,
    pub x: u32,
    pub y: u32,
    pub gamma_size: u32,
    pub mode_valid: u32,
    pub mode: DrmModeInfo,
}

/// struct drm_mode_get_encoder
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeGetEncoder {
    pub encoder_id: u32,
    pub encoder_type: u32,
    pub crtc_id: u32,
    pub possible_crtcs: u32,
    pub possible_clones: u32,
}

/// struct drm_mode_get_connector
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeGetConnector {
    pub encoders_ptr: u64,
    pub modes_ptr: u64,
    pub props_ptr: u64,
    pub prop_values_ptr: u64,
    pub count_modes: u32,
    pub count_props: u32,
    pub count_encoders: u32,
    pub encoder_id: u32,
    pub connector_id: u32,
    pub connector_type: u32,
    pub connector_type_id: u32,
    pub connection: u32,
    pub mm_width: u32,
    pub mm_height: u32,
    pub subpixel: u32,
    pub pad: u32,
}

/// struct drm_mode_create_dumb
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeCreateDumb {
    pub height: u32,
    pub width: u32,
    pub bpp: u32,
    pub flags: u32,
    pub handle: u32,
    pub pitch: u32,
    pub size: u64,
}

/// struct drm_mode_map_dumb
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeMapDumb {
    pub handle: u32,
    pub pad: u32,
    pub offset: u64,
}

/// struct drm_mode_destroy_dumb
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeDestroyDumb {
    pub handle: u32,
}

/// struct drm_mode_fb_cmd2
#[repr(C)]
#[derive(Debug, Default)]
pub struct DrmModeFbCmd2 {
    pub fb_id: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    pub flags: u32,
    pub handles: [u32; 4],
    pub pitches: [u32; 4],
    pub offsets: [u32; 4],
    pub modifier: [u64; 4],
}
