//! Fake camera and clock shared by the unit tests

use crate::clock::ManualClock;
use camera_capture::{Camera, CameraError, CameraRole, Frame};
use chrono::{Local, TimeZone};
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Fault switches and observations for a [`FakeCamera`]
#[derive(Debug, Default)]
pub struct CameraFaults {
    pub fail_open: bool,
    pub fail_encoder: bool,
    /// Number of upcoming captures that fail
    pub failing_captures: u32,
    pub encoding: bool,
    pub opens: u32,
}

pub struct FakeCamera {
    role: CameraRole,
    open: bool,
    faults: Arc<Mutex<CameraFaults>>,
}

pub fn fake_camera(role: CameraRole) -> (Box<dyn Camera>, Arc<Mutex<CameraFaults>>) {
    let faults = Arc::new(Mutex::new(CameraFaults::default()));
    let camera = FakeCamera {
        role,
        open: false,
        faults: faults.clone(),
    };
    (Box::new(camera), faults)
}

/// Clock starting at 2024-05-01 12:00:00 local time
pub fn manual_clock() -> Arc<ManualClock> {
    let start = Local
        .with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .unwrap();
    Arc::new(ManualClock::new(start))
}

impl Camera for FakeCamera {
    fn role(&self) -> CameraRole {
        self.role
    }

    fn open(&mut self) -> Result<(), CameraError> {
        let mut faults = self.faults.lock().unwrap();
        faults.opens += 1;
        if faults.fail_open {
            return Err(CameraError::Open("sensor not detected".to_string()));
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
        self.faults.lock().unwrap().encoding = false;
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
        let mut faults = self.faults.lock().unwrap();
        if faults.failing_captures > 0 {
            faults.failing_captures -= 1;
            return Err(CameraError::Capture("dequeue timeout".to_string()));
        }
        Ok(Some(Frame::black(4, 2)))
    }

    fn start_encoder(&mut self, output: &Path, _bitrate: u32) -> Result<(), CameraError> {
        let mut faults = self.faults.lock().unwrap();
        if faults.fail_encoder {
            // Leaves an empty file behind, as a half-started encoder would.
            File::create(output)?;
            return Err(CameraError::Encoder("no encoder available".to_string()));
        }
        File::create(output)?;
        faults.encoding = true;
        Ok(())
    }

    fn stop_encoder(&mut self) -> Result<(), CameraError> {
        self.faults.lock().unwrap().encoding = false;
        Ok(())
    }
}
