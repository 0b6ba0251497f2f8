//! Per-camera recorder and the recording group
//!
//! A segment is written under `current/` while the encoder runs and renamed
//! into `archive/` once the encoder has been stopped, so the archive only
//! ever holds complete files.

use crate::clock::Clock;
use crate::{RecorderError, VideoPaths};
use camera_capture::{Camera, CameraConfig, CameraError, CameraRole, Frame};
use chrono::{DateTime, Local};
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Recorded segment file extension
pub const SEGMENT_EXTENSION: &str = "h264";

/// Recorder lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecorderState {
    Uninitialized,
    Ready,
    Recording,
    Closed,
}

/// The in-flight segment of a recording camera
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    pub role: CameraRole,
    /// Path under `current/`
    pub path: PathBuf,
    pub sequence: u32,
    /// Monotonic start time from the recorder's clock
    pub started: Duration,
    pub started_at: DateTime<Local>,
}

/// Snapshot for status reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraStats {
    pub role: CameraRole,
    pub ready: bool,
    pub recording: bool,
    pub frames_captured: u64,
}

/// One camera and its encoder
pub struct CameraRecorder {
    config: CameraConfig,
    camera: Box<dyn Camera>,
    paths: VideoPaths,
    clock: Arc<dyn Clock>,
    state: RecorderState,
    segment: Option<Segment>,
    next_sequence: u32,
    frames_captured: u64,
}

impl CameraRecorder {
    pub fn new(
        config: CameraConfig,
        camera: Box<dyn Camera>,
        paths: VideoPaths,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            camera,
            paths,
            clock,
            state: RecorderState::Uninitialized,
            segment: None,
            next_sequence: 0,
            frames_captured: 0,
        }
    }

    pub fn role(&self) -> CameraRole {
        self.config.role
    }

    pub fn config(&self) -> &CameraConfig {
        &self.config
    }

    pub fn state(&self) -> RecorderState {
        self.state
    }

    /// Initialized and usable (recording or not)
    pub fn is_ready(&self) -> bool {
        matches!(self.state, RecorderState::Ready | RecorderState::Recording)
    }

    pub fn is_recording(&self) -> bool {
        self.state == RecorderState::Recording
    }

    pub fn segment(&self) -> Option<&Segment> {
        self.segment.as_ref()
    }

    pub fn hardware_transform_applied(&self) -> bool {
        self.camera.hardware_transform_applied()
    }

    pub fn stats(&self) -> CameraStats {
        CameraStats {
            role: self.config.role,
            ready: self.is_ready(),
            recording: self.is_recording(),
            frames_captured: self.frames_captured,
        }
    }

    /// Open the camera. A failed open leaves the recorder uninitialized.
    pub fn init(&mut self) -> Result<(), RecorderError> {
        if self.is_ready() {
            return Ok(());
        }
        info!(
            "Initializing {} camera (index {})...",
            self.config.role, self.config.index
        );
        if let Err(e) = self.camera.open() {
            error!("Camera {} initialization failed: {}", self.config.role, e);
            self.camera.close();
            self.state = RecorderState::Uninitialized;
            return Err(e.into());
        }
        self.state = RecorderState::Ready;
        info!(
            "Camera {} initialized: {}x{}@{}fps (hardware transform: {})",
            self.config.role,
            self.config.width,
            self.config.height,
            self.config.fps,
            self.camera.hardware_transform_applied()
        );
        Ok(())
    }

    fn next_output(&mut self) -> (PathBuf, u32, DateTime<Local>) {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.wrapping_add(1);
        let now = self.clock.local_time();
        let name = format!(
            "{}_{}_{:04}.{}",
            self.config.prefix,
            now.format("%Y%m%d_%H%M%S"),
            sequence,
            SEGMENT_EXTENSION
        );
        (self.paths.current.join(name), sequence, now)
    }

    /// Start a new segment.
    ///
    /// Returns `false` without doing anything unless the recorder is ready,
    /// idle and recording is enabled for this camera.
    pub fn start_recording(&mut self) -> Result<bool, RecorderError> {
        if !self.config.recording_enabled {
            debug!("Recording disabled for {} camera", self.config.role);
            return Ok(false);
        }
        if self.state != RecorderState::Ready {
            return Ok(false);
        }

        let (path, sequence, started_at) = self.next_output();
        debug!(
            "Starting encoder for {} camera at {}bps -> {}",
            self.config.role,
            self.config.bitrate,
            path.display()
        );

        if let Err(e) = self.camera.start_encoder(&path, self.config.bitrate) {
            error!("Failed to start recording on {} camera: {}", self.config.role, e);
            if let Err(stop) = self.camera.stop_encoder() {
                debug!("Encoder teardown after failed start: {}", stop);
            }
            if fs::metadata(&path).is_ok_and(|m| m.len() == 0) {
                if let Err(rm) = fs::remove_file(&path) {
                    warn!("Could not remove partial segment {}: {}", path.display(), rm);
                }
            }
            return Err(e.into());
        }

        info!(
            "Recording to: {}",
            path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        self.segment = Some(Segment {
            role: self.config.role,
            path,
            sequence,
            started: self.clock.now(),
            started_at,
        });
        self.state = RecorderState::Recording;
        Ok(true)
    }

    /// Stop the encoder and archive the segment.
    ///
    /// Returns the archived path, or `None` when nothing was recording or
    /// the encoder produced no file.
    pub fn stop_recording(&mut self) -> Result<Option<PathBuf>, RecorderError> {
        if self.state != RecorderState::Recording {
            return Ok(None);
        }
        info!("Stopping recording on {} camera...", self.config.role);

        if let Err(e) = self.camera.stop_encoder() {
            error!("Encoder stop failed on {} camera: {}", self.config.role, e);
        }
        self.state = RecorderState::Ready;
        let Some(segment) = self.segment.take() else {
            return Ok(None);
        };

        if !segment.path.exists() {
            warn!("Segment {} was never written", segment.path.display());
            return Ok(None);
        }
        let Some(name) = segment.path.file_name() else {
            return Err(RecorderError::InvalidState(format!(
                "segment path {} has no file name",
                segment.path.display()
            )));
        };
        let archived = self.paths.archive.join(name);
        // A segment left behind here is archived by the next startup sweep.
        if let Err(e) = fs::rename(&segment.path, &archived) {
            error!(
                "Failed to archive {} to {}: {}",
                segment.path.display(),
                archived.display(),
                e
            );
            return Err(e.into());
        }

        let size_mb = fs::metadata(&archived).map(|m| m.len()).unwrap_or(0) as f64 / (1024.0 * 1024.0);
        info!(
            "Archived: {} ({:.1}MB)",
            archived.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
            size_mb
        );
        Ok(Some(archived))
    }

    /// Grab a display frame
    pub fn capture_frame(&mut self) -> Result<Option<Frame>, RecorderError> {
        if !self.is_ready() {
            return Err(CameraError::NotInitialized.into());
        }
        let frame = self.camera.capture_frame()?;
        if frame.is_some() {
            self.frames_captured += 1;
        }
        Ok(frame)
    }

    /// Stop any recording and release the camera
    pub fn close(&mut self) {
        if let Err(e) = self.stop_recording() {
            error!("Error stopping recording on {} camera: {}", self.config.role, e);
        }
        self.camera.close();
        self.segment = None;
        if self.state != RecorderState::Closed {
            info!("Camera {} closed", self.config.role);
        }
        self.state = RecorderState::Closed;
    }
}

/// Recorder shared between the capture thread and the scheduler
pub type SharedRecorder = Arc<Mutex<CameraRecorder>>;

pub(crate) fn lock(recorder: &Mutex<CameraRecorder>) -> MutexGuard<'_, CameraRecorder> {
    recorder.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cameras that start and stop recording together
pub struct RecordingGroup {
    recorders: Vec<SharedRecorder>,
    recording: Arc<AtomicBool>,
}

impl RecordingGroup {
    pub fn new() -> Self {
        Self::with_flag(Arc::new(AtomicBool::new(false)))
    }

    /// Group publishing its recording state into `recording`
    pub fn with_flag(recording: Arc<AtomicBool>) -> Self {
        Self {
            recorders: Vec::new(),
            recording,
        }
    }

    pub fn add(&mut self, recorder: CameraRecorder) -> SharedRecorder {
        let shared = Arc::new(Mutex::new(recorder));
        self.recorders.push(shared.clone());
        shared
    }

    pub fn recorders(&self) -> &[SharedRecorder] {
        &self.recorders
    }

    pub fn is_empty(&self) -> bool {
        self.recorders.is_empty()
    }

    pub fn find(&self, role: CameraRole) -> Option<SharedRecorder> {
        self.recorders
            .iter()
            .find(|r| lock(r).role() == role)
            .cloned()
    }

    /// Set while any camera records
    pub fn recording_flag(&self) -> Arc<AtomicBool> {
        self.recording.clone()
    }

    /// Re-derive the recording flag from the recorders
    pub fn refresh_flag(&self) -> bool {
        let any = self.recorders.iter().any(|r| lock(r).is_recording());
        self.recording.store(any, Ordering::Relaxed);
        any
    }

    /// Start every enabled camera; returns whether any is recording
    pub fn start_all(&self) -> bool {
        for recorder in &self.recorders {
            let mut recorder = lock(recorder);
            if let Err(e) = recorder.start_recording() {
                warn!("{} camera did not start recording: {}", recorder.role(), e);
            }
        }
        self.refresh_flag()
    }

    /// Stop every camera, last started first
    pub fn stop_all(&self) {
        for recorder in self.recorders.iter().rev() {
            let mut recorder = lock(recorder);
            if let Err(e) = recorder.stop_recording() {
                error!("Error stopping {} camera: {}", recorder.role(), e);
            }
        }
        self.recording.store(false, Ordering::Relaxed);
    }

    /// Start time of the reference segment: front camera first, else rear
    pub fn reference_start(&self) -> Option<Duration> {
        let segments: Vec<(CameraRole, Duration)> = self
            .recorders
            .iter()
            .filter_map(|r| {
                let r = lock(r);
                r.segment().map(|s| (s.role, s.started))
            })
            .collect();
        segments
            .iter()
            .find(|(role, _)| *role == CameraRole::Front)
            .or_else(|| segments.first())
            .map(|(_, started)| *started)
    }

    pub fn stats(&self) -> Vec<CameraStats> {
        self.recorders.iter().map(|r| lock(r).stats()).collect()
    }

    /// Stop recording and release every camera
    pub fn close_all(&self) {
        for recorder in self.recorders.iter().rev() {
            lock(recorder).close();
        }
        self.recording.store(false, Ordering::Relaxed);
    }
}

impl Default for RecordingGroup {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_support::{fake_camera, manual_clock, CameraFaults};

    fn recorder(dir: &tempfile::TempDir, role: CameraRole, clock: Arc<ManualClock>) -> (CameraRecorder, Arc<Mutex<CameraFaults>>) {
        let paths = VideoPaths::under(dir.path());
        paths.create().unwrap();
        let config = match role {
            CameraRole::Front => CameraConfig::front(),
            CameraRole::Rear => CameraConfig::rear(),
        };
        let (camera, faults) = fake_camera(role);
        (CameraRecorder::new(config, camera, paths, clock), faults)
    }

    #[test]
    fn test_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let (mut rec, _) = recorder(&dir, CameraRole::Front, clock.clone());
        assert_eq!(rec.state(), RecorderState::Uninitialized);
        assert!(!rec.start_recording().unwrap());

        rec.init().unwrap();
        assert_eq!(rec.state(), RecorderState::Ready);

        assert!(rec.start_recording().unwrap());
        assert_eq!(rec.state(), RecorderState::Recording);
        // Already recording: no second segment
        assert!(!rec.start_recording().unwrap());

        let segment = rec.segment().unwrap().clone();
        assert_eq!(
            segment.path,
            dir.path().join("videos/current/front_20240501_120000_0000.h264")
        );
        assert!(segment.path.exists());

        clock.advance(Duration::from_secs(60));
        let archived = rec.stop_recording().unwrap().unwrap();
        assert_eq!(rec.state(), RecorderState::Ready);
        assert_eq!(
            archived,
            dir.path().join("videos/archive/front_20240501_120000_0000.h264")
        );
        assert!(archived.exists());
        assert!(!segment.path.exists());

        assert!(rec.start_recording().unwrap());
        assert!(rec
            .segment()
            .unwrap()
            .path
            .ends_with("front_20240501_120100_0001.h264"));

        rec.close();
        assert_eq!(rec.state(), RecorderState::Closed);
        assert!(dir
            .path()
            .join("videos/archive/front_20240501_120100_0001.h264")
            .exists());
        assert!(fs::read_dir(dir.path().join("videos/current")).unwrap().next().is_none());
    }

    #[test]
    fn test_failed_archive_keeps_segment_for_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, _) = recorder(&dir, CameraRole::Front, manual_clock());
        rec.init().unwrap();
        rec.start_recording().unwrap();
        let path = rec.segment().unwrap().path.clone();

        let archive = dir.path().join("videos/archive");
        fs::remove_dir(&archive).unwrap();
        assert!(matches!(rec.stop_recording(), Err(RecorderError::Io(_))));
        assert_eq!(rec.state(), RecorderState::Ready);
        assert!(path.exists());

        let paths = VideoPaths::under(dir.path());
        paths.create().unwrap();
        let moved = paths.archive_leftovers().unwrap();
        assert_eq!(moved, vec![archive.join("front_20240501_120000_0000.h264")]);
        assert!(!path.exists());
        assert!(moved[0].exists());
    }

    #[test]
    fn test_recording_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, _) = recorder(&dir, CameraRole::Rear, manual_clock());
        rec.config.recording_enabled = false;
        rec.init().unwrap();
        assert!(!rec.start_recording().unwrap());
        assert_eq!(rec.state(), RecorderState::Ready);
    }

    #[test]
    fn test_failed_start_reverts() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, faults) = recorder(&dir, CameraRole::Front, manual_clock());
        rec.init().unwrap();
        faults.lock().unwrap().fail_encoder = true;

        assert!(rec.start_recording().is_err());
        assert_eq!(rec.state(), RecorderState::Ready);
        assert!(rec.segment().is_none());
        assert!(!faults.lock().unwrap().encoding);
        assert!(fs::read_dir(dir.path().join("videos/current")).unwrap().next().is_none());

        faults.lock().unwrap().fail_encoder = false;
        assert!(rec.start_recording().unwrap());
    }

    #[test]
    fn test_failed_init() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, faults) = recorder(&dir, CameraRole::Front, manual_clock());
        faults.lock().unwrap().fail_open = true;
        assert!(rec.init().is_err());
        assert_eq!(rec.state(), RecorderState::Uninitialized);
        assert!(matches!(
            rec.capture_frame(),
            Err(RecorderError::Camera(CameraError::NotInitialized))
        ));
    }

    #[test]
    fn test_capture_counts_frames() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, _) = recorder(&dir, CameraRole::Rear, manual_clock());
        rec.init().unwrap();
        rec.capture_frame().unwrap().unwrap();
        rec.capture_frame().unwrap().unwrap();
        let stats = rec.stats();
        assert_eq!(stats.frames_captured, 2);
        assert!(stats.ready);
        assert!(!stats.recording);
    }

    #[test]
    fn test_group_starts_and_stops_together() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let mut group = RecordingGroup::new();
        for role in [CameraRole::Front, CameraRole::Rear] {
            let (mut rec, _) = recorder(&dir, role, clock.clone());
            rec.init().unwrap();
            group.add(rec);
        }
        let flag = group.recording_flag();

        assert!(group.start_all());
        assert!(flag.load(Ordering::Relaxed));
        assert_eq!(group.reference_start(), Some(Duration::ZERO));
        assert!(group.stats().iter().all(|s| s.recording));

        group.stop_all();
        assert!(!flag.load(Ordering::Relaxed));
        assert_eq!(group.reference_start(), None);
        assert_eq!(fs::read_dir(dir.path().join("videos/archive")).unwrap().count(), 2);

        assert!(group.find(CameraRole::Rear).is_some());
        group.close_all();
        assert!(group.stats().iter().all(|s| !s.ready));
    }

    #[test]
    fn test_reference_prefers_front() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let mut group = RecordingGroup::new();
        let (mut rear, _) = recorder(&dir, CameraRole::Rear, clock.clone());
        rear.init().unwrap();
        let rear = group.add(rear);
        let (mut front, _) = recorder(&dir, CameraRole::Front, clock.clone());
        front.init().unwrap();
        let front = group.add(front);

        lock(&rear).start_recording().unwrap();
        clock.advance(Duration::from_secs(3));
        lock(&front).start_recording().unwrap();
        assert_eq!(group.reference_start(), Some(Duration::from_secs(3)));

        lock(&front).stop_recording().unwrap();
        assert_eq!(group.reference_start(), Some(Duration::ZERO));
    }
}
