//! RGB24 to surface pixel format packing
//!
//! The hottest per-pixel loop in the pipeline. Packing writes into a buffer
//! allocated once per display session.

use serde::{Deserialize, Serialize};

/// Native pixel format of a presentation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// 16-bit 5:6:5, little-endian
    Rgb565,
    /// 32-bit, top byte zero, little-endian
    Xrgb8888,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Rgb565 => 2,
            PixelFormat::Xrgb8888 => 4,
        }
    }
}

#[inline]
pub fn rgb565(r: u8, g: u8, b: u8) -> u16 {
    ((r as u16 >> 3) << 11) | ((g as u16 >> 2) << 5) | (b as u16 >> 3)
}

#[inline]
pub fn xrgb8888(r: u8, g: u8, b: u8) -> u32 {
    ((r as u32) << 16) | ((g as u32) << 8) | b as u32
}

/// Pack RGB24 into RGB565. Stops at whichever buffer runs out first.
pub fn pack_rgb565(rgb: &[u8], out: &mut [u8]) {
    for (src, dst) in rgb.chunks_exact(3).zip(out.chunks_exact_mut(2)) {
        dst.copy_from_slice(&rgb565(src[0], src[1], src[2]).to_le_bytes());
    }
}

/// Pack RGB24 into XRGB8888. Stops at whichever buffer runs out first.
pub fn pack_xrgb8888(rgb: &[u8], out: &mut [u8]) {
    for (src, dst) in rgb.chunks_exact(3).zip(out.chunks_exact_mut(4)) {
        dst.copy_from_slice(&xrgb8888(src[0], src[1], src[2]).to_le_bytes());
    }
}

/// Reusable packing buffer for one surface
pub struct Packer {
    format: PixelFormat,
    pixels: usize,
    buffer: Vec<u8>,
}

impl Packer {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        let pixels = width as usize * height as usize;
        Self {
            format,
            pixels,
            buffer: vec![0; pixels * format.bytes_per_pixel()],
        }
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    /// Packed frame length in bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Pack `rgb` into the session buffer.
    ///
    /// Pixels beyond the end of a short input are left black.
    pub fn pack(&mut self, rgb: &[u8]) -> &[u8] {
        let covered = (rgb.len() / 3).min(self.pixels);
        match self.format {
            PixelFormat::Rgb565 => pack_rgb565(rgb, &mut self.buffer),
            PixelFormat::Xrgb8888 => pack_xrgb8888(rgb, &mut self.buffer),
        }
        self.buffer[covered * self.format.bytes_per_pixel()..].fill(0);
        &self.buffer
    }

    /// All-black packed frame
    pub fn black(&mut self) -> &[u8] {
        self.buffer.fill(0);
        &self.buffer
    }

    /// Last packed frame
    pub fn packed(&self) -> &[u8] {
        &self.buffer
    }
}
