//! Coordinated segment rotation
//!
//! All cameras rotate together, timed off one reference camera (front when it
//! records, otherwise rear), so front and rear segments share boundaries.

use crate::clock::Clock;
use crate::recorder::RecordingGroup;
use crate::RecordingConfig;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use worker::{WorkerError, WorkerSet};

/// Segment rotation timer
pub struct SegmentScheduler {
    segment: Duration,
    pause: Duration,
    interval: Duration,
    clock: Arc<dyn Clock>,
    rotations: u64,
}

impl SegmentScheduler {
    pub fn new(config: &RecordingConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            segment: config.segment_duration(),
            pause: config.rotation_pause(),
            interval: config.check_interval(),
            clock,
            rotations: 0,
        }
    }

    pub fn rotations(&self) -> u64 {
        self.rotations
    }

    /// Whether the reference segment has reached its length
    pub fn is_due(&self, group: &RecordingGroup) -> bool {
        group
            .reference_start()
            .is_some_and(|start| self.clock.now().saturating_sub(start) >= self.segment)
    }

    /// Rotate all cameras if due. `flush` waits for the encoders between stop
    /// and restart and returns `false` if the pipeline is shutting down.
    pub fn check(&mut self, group: &RecordingGroup, flush: impl FnOnce(Duration) -> bool) -> bool {
        if !self.is_due(group) {
            group.refresh_flag();
            return false;
        }

        info!("Rotating video segments...");
        group.stop_all();
        if !flush(self.pause) {
            debug!("Rotation interrupted by shutdown");
            return false;
        }
        group.start_all();
        self.rotations += 1;
        true
    }

    /// Run on its own thread until the set is shut down
    pub fn spawn(mut self, workers: &mut WorkerSet, group: Arc<RecordingGroup>) -> Result<(), WorkerError> {
        workers.spawn("segment-scheduler", move |token| {
            while token.sleep(self.interval) {
                self.check(&group, |pause| token.sleep(pause));
            }
            debug!("Segment scheduler stopped after {} rotations", self.rotations);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::recorder::CameraRecorder;
    use crate::test_support::{fake_camera, manual_clock};
    use crate::VideoPaths;
    use camera_capture::{CameraConfig, CameraRole};
    use std::sync::atomic::Ordering;
    use std::time::Instant;

    fn group(dir: &tempfile::TempDir, clock: &Arc<ManualClock>) -> RecordingGroup {
        let paths = VideoPaths::under(dir.path());
        paths.create().unwrap();
        let mut group = RecordingGroup::new();
        for config in [CameraConfig::front(), CameraConfig::rear()] {
            let (camera, _) = fake_camera(config.role);
            let mut rec = CameraRecorder::new(config, camera, paths.clone(), clock.clone());
            rec.init().unwrap();
            group.add(rec);
        }
        group
    }

    fn segment_starts(group: &RecordingGroup) -> Vec<Duration> {
        group
            .recorders()
            .iter()
            .map(|r| crate::recorder::lock(r).segment().unwrap().started)
            .collect()
    }

    #[test]
    fn test_rotates_every_segment() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let group = group(&dir, &clock);
        let mut scheduler = SegmentScheduler::new(&RecordingConfig::default(), clock.clone());
        assert!(group.start_all());

        let mut rotated_at = Vec::new();
        for t in 1..=200u64 {
            clock.set(Duration::from_secs(t));
            if scheduler.check(&group, |_| true) {
                rotated_at.push(t);
                let starts = segment_starts(&group);
                assert!(starts.iter().all(|s| *s == starts[0]));
            }
        }
        assert_eq!(rotated_at, vec![60, 120, 180]);
        assert_eq!(scheduler.rotations(), 3);

        // Three completed segments per camera
        let archived = std::fs::read_dir(dir.path().join("videos/archive")).unwrap().count();
        assert_eq!(archived, 6);
        assert!(group.recording_flag().load(Ordering::Relaxed));
    }

    #[test]
    fn test_reference_falls_back_to_rear() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let group = group(&dir, &clock);
        let rear = group.find(CameraRole::Rear).unwrap();
        crate::recorder::lock(&rear).start_recording().unwrap();

        let mut scheduler = SegmentScheduler::new(&RecordingConfig::default(), clock.clone());
        clock.set(Duration::from_secs(59));
        assert!(!scheduler.check(&group, |_| true));
        assert!(group.recording_flag().load(Ordering::Relaxed));
        clock.set(Duration::from_secs(60));
        assert!(scheduler.check(&group, |_| true));
        // Rotation restarts every enabled camera.
        assert!(group.stats().iter().all(|s| s.recording));
    }

    #[test]
    fn test_idle_group_never_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let group = group(&dir, &clock);
        let mut scheduler = SegmentScheduler::new(&RecordingConfig::default(), clock.clone());
        clock.set(Duration::from_secs(600));
        assert!(!scheduler.check(&group, |_| true));
    }

    #[test]
    fn test_interrupted_rotation_leaves_cameras_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let group = group(&dir, &clock);
        group.start_all();
        let mut scheduler = SegmentScheduler::new(&RecordingConfig::default(), clock.clone());
        clock.set(Duration::from_secs(60));
        assert!(!scheduler.check(&group, |_| false));
        assert!(group.stats().iter().all(|s| !s.recording));
        assert_eq!(scheduler.rotations(), 0);
    }

    #[test]
    fn test_spawned_scheduler_rotates() {
        let dir = tempfile::tempdir().unwrap();
        let clock = manual_clock();
        let group = Arc::new(group(&dir, &clock));
        group.start_all();
        let config = RecordingConfig {
            check_interval_ms: 10,
            rotation_pause_ms: 1,
            ..Default::default()
        };
        let mut workers = WorkerSet::new();
        SegmentScheduler::new(&config, clock.clone())
            .spawn(&mut workers, group.clone())
            .unwrap();

        clock.set(Duration::from_secs(61));
        let archive = dir.path().join("videos/archive");
        let deadline = Instant::now() + Duration::from_secs(5);
        while std::fs::read_dir(&archive).unwrap().count() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(workers.shutdown(Duration::from_secs(2)), 0);
        assert_eq!(std::fs::read_dir(&archive).unwrap().count(), 2);
    }
}
