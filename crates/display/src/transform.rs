//! Geometric transform stage
//!
//! Quarter turns are counter-clockwise. Flips follow the rotation, and mirror
//! mode adds one more horizontal flip at the very end.

use camera_capture::{Frame, PixelLayout};
use image::{imageops, RgbImage};

/// Apply rotation, flips and mirror to an RGB24 frame.
///
/// `rotation` is in degrees and is reduced to quarter turns; anything that is
/// not a multiple of 90 rounds down. Short buffers are padded with black
/// before transforming.
pub fn apply(frame: Frame, rotation: u32, hflip: bool, vflip: bool, mirror: bool) -> Frame {
    let quarter_turns = (rotation % 360) / 90;
    // hflip and mirror cancel out
    let horizontal = hflip ^ mirror;
    if quarter_turns == 0 && !horizontal && !vflip {
        return frame;
    }
    if frame.layout != PixelLayout::Rgb24 || !frame.is_well_formed() {
        return apply(frame.to_rgb(), rotation, hflip, vflip, mirror);
    }

    let Frame {
        data,
        width,
        height,
        timestamp_ns,
        sequence,
        ..
    } = frame;
    let Some(mut img) = RgbImage::from_raw(width, height, data) else {
        let mut frame = Frame::black(width, height);
        frame.timestamp_ns = timestamp_ns;
        frame.sequence = sequence;
        return frame;
    };

    img = match quarter_turns {
        1 => imageops::rotate270(&img),
        2 => {
            imageops::rotate180_in_place(&mut img);
            img
        }
        3 => imageops::rotate90(&img),
        _ => img,
    };
    if horizontal {
        imageops::flip_horizontal_in_place(&mut img);
    }
    if vflip {
        imageops::flip_vertical_in_place(&mut img);
    }

    let (width, height) = img.dimensions();
    Frame {
        data: img.into_raw(),
        width,
        height,
        layout: PixelLayout::Rgb24,
        timestamp_ns,
        sequence,
    }
}

/// Transform settings for the displayed camera
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransformStage {
    pub rotation: u32,
    pub hflip: bool,
    pub vflip: bool,
    pub mirror: bool,
    /// Set once at startup when the sensor pipeline already transformed
    hardware_applied: bool,
}

impl TransformStage {
    pub fn new(rotation: u32, hflip: bool, vflip: bool, mirror: bool) -> Self {
        Self {
            rotation,
            hflip,
            vflip,
            mirror,
            hardware_applied: false,
        }
    }

    /// Skip the stage entirely
    pub fn with_hardware_applied(mut self, applied: bool) -> Self {
        self.hardware_applied = applied;
        self
    }

    pub fn is_bypassed(&self) -> bool {
        self.hardware_applied
    }

    pub fn apply(&self, frame: Frame) -> Frame {
        if self.hardware_applied {
            return frame;
        }
        apply(frame, self.rotation, self.hflip, self.vflip, self.mirror)
    }
}
