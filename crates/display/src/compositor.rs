//! Overlay compositing
//!
//! Integer alpha blend of the cached overlay region into an RGB24 frame.
//! Work is limited to the mask's bounding box.

use crate::overlay::OverlayMask;

/// Blend `mask` into `frame` (RGB24, `width` x `height`) in place
pub fn blend(frame: &mut [u8], width: u32, height: u32, mask: &OverlayMask) {
    let (fw, fh) = (width as usize, height as usize);
    let (mx, my) = (mask.x as usize, mask.y as usize);
    let (mw, mh) = (mask.width as usize, mask.height as usize);
    if frame.len() < fw * fh * 3 || mask.alpha.len() < mw * mh || mask.rgb.len() < mw * mh * 3 {
        return;
    }
    // Clip to the frame
    let cols = mw.min(fw.saturating_sub(mx));
    let rows = mh.min(fh.saturating_sub(my));

    for row in 0..rows {
        let alpha = &mask.alpha[row * mw..row * mw + cols];
        let rgb = &mask.rgb[row * mw * 3..(row * mw + cols) * 3];
        let start = ((my + row) * fw + mx) * 3;
        let dst = &mut frame[start..start + cols * 3];

        for ((px, over), &a) in dst.chunks_exact_mut(3).zip(rgb.chunks_exact(3)).zip(alpha) {
            match a {
                0 => {}
                255 => px.copy_from_slice(over),
                _ => {
                    let a = a as u32;
                    for c in 0..3 {
                        let v = (a * over[c] as u32 + (255 - a) * px[c] as u32 + 127) / 255;
                        px[c] = v.min(255) as u8;
                    }
                }
            }
        }
    }
}
