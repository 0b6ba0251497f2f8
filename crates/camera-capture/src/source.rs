//! Camera collaborator interface
//!
//! Sensor acquisition and hardware encoding live outside this workspace. A
//! `Camera` delivers raw frames, reports once whether the sensor pipeline
//! already applied rotation/flip, and starts/stops the hardware encoder into a
//! file.

use crate::{CameraConfig, CameraError, CameraRole, Frame};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Acquisition + hardware encoder control for one sensor
pub trait Camera: Send {
    /// Role of this camera
    fn role(&self) -> CameraRole;

    /// Open and configure the sensor
    fn open(&mut self) -> Result<(), CameraError>;

    /// Release the sensor. Idempotent.
    fn close(&mut self);

    /// Whether `open` succeeded and `close` has not been called
    fn is_open(&self) -> bool;

    /// Whether rotation/flip were applied by the sensor pipeline
    fn hardware_transform_applied(&self) -> bool;

    /// Grab the next display frame (`None` if nothing is ready yet)
    fn capture_frame(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Start the hardware encoder writing to `output`
    fn start_encoder(&mut self, output: &Path, bitrate: u32) -> Result<(), CameraError>;

    /// Stop the hardware encoder and flush its output
    fn stop_encoder(&mut self) -> Result<(), CameraError>;
}

/// Synthetic camera producing a moving colour gradient.
///
/// The stand-in encoder creates the output file and appends one small
/// record per captured frame, so recording and disk management can be
/// exercised on a bench without sensors.
pub struct PatternCamera {
    config: CameraConfig,
    open: bool,
    started: Instant,
    sequence: u32,
    encoder: Option<(PathBuf, File)>,
}

impl PatternCamera {
    /// Create a pattern camera with the configured geometry
    pub fn new(config: CameraConfig) -> Self {
        Self {
            config,
            open: false,
            started: Instant::now(),
            sequence: 0,
            encoder: None,
        }
    }

    /// Render the pattern for time `t` (seconds)
    pub fn pattern(width: u32, height: u32, t: f64) -> Vec<u8> {
        let (w, h) = (width.max(1) as usize, height.max(1) as usize);
        let t30 = (t * 30.0) as usize;
        let t60 = (t * 60.0) as usize;
        let t90 = (t * 90.0) as usize;

        let mut data = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            let gy = y * 255 / h;
            for x in 0..w {
                let gx = x * 255 / w;
                data.push(((gx + t30) % 256) as u8);
                data.push(((gy + t60) % 256) as u8);
                data.push(((gx / 2 + gy / 2 + t90) % 256) as u8);
            }
        }
        data
    }
}

impl Camera for PatternCamera {
    fn role(&self) -> CameraRole {
        self.config.role
    }

    fn open(&mut self) -> Result<(), CameraError> {
        if self.config.width == 0 || self.config.height == 0 {
            return Err(CameraError::Open(format!(
                "invalid geometry {}x{}",
                self.config.width, self.config.height
            )));
        }
        self.open = true;
        self.started = Instant::now();
        info!(
            "Pattern camera {} opened: {}x{}@{}fps",
            self.config.role, self.config.width, self.config.height, self.config.fps
        );
        Ok(())
    }

    fn close(&mut self) {
        self.encoder = None;
        if self.open {
            debug!("Pattern camera {} closed", self.config.role);
        }
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn hardware_transform_applied(&self) -> bool {
        false
    }

    fn capture_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if !self.open {
            return Err(CameraError::NotInitialized);
        }

        let elapsed = self.started.elapsed();
        let mut frame = Frame::rgb(
            Self::pattern(self.config.width, self.config.height, elapsed.as_secs_f64()),
            self.config.width,
            self.config.height,
        );
        frame.timestamp_ns = elapsed.as_nanos() as u64;
        frame.sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);

        if let Some((_, file)) = self.encoder.as_mut() {
            file.write_all(&frame.sequence.to_le_bytes())?;
            file.write_all(&frame.timestamp_ns.to_le_bytes())?;
        }

        Ok(Some(frame))
    }

    fn start_encoder(&mut self, output: &Path, bitrate: u32) -> Result<(), CameraError> {
        if !self.open {
            return Err(CameraError::NotInitialized);
        }
        if self.encoder.is_some() {
            return Err(CameraError::Encoder("encoder already running".to_string()));
        }
        let file = File::create(output)?;
        debug!(
            "Pattern encoder started at {}bps -> {}",
            bitrate,
            output.display()
        );
        self.encoder = Some((output.to_path_buf(), file));
        Ok(())
    }

    fn stop_encoder(&mut self) -> Result<(), CameraError> {
        if let Some((path, file)) = self.encoder.take() {
            file.sync_all()?;
            debug!("Pattern encoder stopped: {}", path.display());
        }
        Ok(())
    }
}
