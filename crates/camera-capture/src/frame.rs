//! Video frame types and processing

/// Byte order of a raw frame as delivered by acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// R, G, B
    Rgb24,
    /// B, G, R
    Bgr24,
    /// B, G, R, X (one padding byte)
    Bgrx32,
}

impl PixelLayout {
    /// Bytes per pixel
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelLayout::Rgb24 | PixelLayout::Bgr24 => 3,
            PixelLayout::Bgrx32 => 4,
        }
    }
}

/// Raw video frame
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Pixel data (width * height * bytes_per_pixel), row-major, no padding
    pub data: Vec<u8>,
    /// Frame width
    pub width: u32,
    /// Frame height
    pub height: u32,
    /// Pixel layout of `data`
    pub layout: PixelLayout,
    /// Capture timestamp (nanoseconds)
    pub timestamp_ns: u64,
    /// Frame sequence number
    pub sequence: u32,
}

impl Frame {
    /// Create a new RGB24 frame from raw data
    pub fn rgb(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
            layout: PixelLayout::Rgb24,
            timestamp_ns: 0,
            sequence: 0,
        }
    }

    /// All-black RGB24 frame
    pub fn black(width: u32, height: u32) -> Self {
        Self::rgb(vec![0; width as usize * height as usize * 3], width, height)
    }

    /// Expected data length for the frame geometry
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.layout.bytes_per_pixel()
    }

    /// Whether `data` matches the declared geometry
    pub fn is_well_formed(&self) -> bool {
        self.data.len() == self.expected_len()
    }

    /// Get RGB pixel at (x, y)
    pub fn get_pixel(&self, x: u32, y: u32) -> Option<[u8; 3]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let bpp = self.layout.bytes_per_pixel();
        let idx = (y as usize * self.width as usize + x as usize) * bpp;
        let px = self.data.get(idx..idx + bpp)?;
        Some(match self.layout {
            PixelLayout::Rgb24 => [px[0], px[1], px[2]],
            PixelLayout::Bgr24 | PixelLayout::Bgrx32 => [px[2], px[1], px[0]],
        })
    }

    /// Convert to packed RGB24, reusing `out` as storage
    pub fn normalize_into(&self, out: &mut Vec<u8>) {
        let pixels = self.width as usize * self.height as usize;
        out.clear();
        out.reserve(pixels * 3);

        match self.layout {
            PixelLayout::Rgb24 => {
                let n = (pixels * 3).min(self.data.len());
                out.extend_from_slice(&self.data[..n]);
            }
            PixelLayout::Bgr24 => {
                for px in self.data.chunks_exact(3).take(pixels) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
            PixelLayout::Bgrx32 => {
                for px in self.data.chunks_exact(4).take(pixels) {
                    out.extend_from_slice(&[px[2], px[1], px[0]]);
                }
            }
        }
        // Short buffers are padded with black so the geometry always holds.
        out.resize(pixels * 3, 0);
    }

    /// Convert to a packed RGB24 frame
    pub fn to_rgb(&self) -> Frame {
        let mut data = Vec::new();
        self.normalize_into(&mut data);
        Frame {
            data,
            width: self.width,
            height: self.height,
            layout: PixelLayout::Rgb24,
            timestamp_ns: self.timestamp_ns,
            sequence: self.sequence,
        }
    }

    /// Resize an RGB24 frame with nearest-neighbour sampling
    pub fn resize(&self, new_width: u32, new_height: u32) -> Frame {
        let rgb;
        let src = if self.layout == PixelLayout::Rgb24 && self.is_well_formed() {
            self
        } else {
            rgb = self.to_rgb();
            &rgb
        };

        let (sw, sh) = (src.width as usize, src.height as usize);
        let (dw, dh) = (new_width as usize, new_height as usize);
        let mut resized = vec![0u8; dw * dh * 3];

        if sw > 0 && sh > 0 && dw > 0 && dh > 0 {
            // Precompute the source column for every destination column.
            let cols: Vec<usize> = (0..dw).map(|x| (x * sw / dw).min(sw - 1) * 3).collect();
            for (y, row) in resized.chunks_exact_mut(dw * 3).enumerate() {
                let sy = (y * sh / dh).min(sh - 1);
                let src_row = &src.data[sy * sw * 3..(sy + 1) * sw * 3];
                for (dst, &sx) in row.chunks_exact_mut(3).zip(&cols) {
                    dst.copy_from_slice(&src_row[sx..sx + 3]);
                }
            }
        }

        Frame {
            data: resized,
            width: new_width,
            height: new_height,
            layout: PixelLayout::Rgb24,
            timestamp_ns: self.timestamp_ns,
            sequence: self.sequence,
        }
    }
}
