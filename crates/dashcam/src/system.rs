//! System orchestration
//!
//! Brings the pipelines up in order (cameras, display, telemetry, recording)
//! and takes them down in reverse. Each subsystem degrades on its own: a
//! missing camera, font, display or GPS is logged and the rest keeps going.

use crate::config::DashcamConfig;
use crate::devices::Devices;
use camera_capture::{CameraRole, FrameBus};
use display::{
    create_backend, DisplayStats, OverlayCache, OverlayConfig, RenderLoop, TextOverlayRenderer,
    TransformStage,
};
use recorder::{
    spawn_capture_loop, CameraRecorder, CameraStats, Clock, DiskGuardian, RecorderError,
    RecordingGroup, RecoveryManager, SegmentScheduler, SharedRecorder, StatvfsUsage, SystemClock,
};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use telemetry::{spawn_gps_feed, spawn_vehicle_feed, CanStatus, GpsStatus, TelemetryBoard};
use thiserror::Error;
use tracing::{error, info, warn};
use worker::{WorkerError, WorkerSet, DEFAULT_JOIN_TIMEOUT};

/// Startup failures
#[derive(Error, Debug)]
pub enum SystemError {
    #[error("No camera could be initialized")]
    NoCamera,

    #[error("{0} camera failed to initialize and single-camera operation is disabled")]
    CameraRequired(CameraRole),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Snapshot for the periodic status line
#[derive(Debug, Clone)]
pub struct SystemStatus {
    pub cameras: Vec<CameraStats>,
    pub display: Option<DisplayStats>,
    pub gps: GpsStatus,
    pub can: Option<CanStatus>,
}

impl fmt::Display for SystemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for camera in &self.cameras {
            let state = match (camera.ready, camera.recording) {
                (_, true) => "recording",
                (true, false) => "ready",
                (false, false) => "down",
            };
            write!(f, "{}: {} ({} frames) | ", camera.role, state, camera.frames_captured)?;
        }
        match &self.display {
            Some(d) => {
                write!(f, "display: {} frames @ {:.1} FPS", d.frames_presented, d.actual_fps)?;
                if d.frames_failed > 0 {
                    write!(f, " ({} failed)", d.frames_failed)?;
                }
                write!(f, " | ")?;
            }
            None => write!(f, "display: off | ")?,
        }
        match self.gps.speed() {
            Some(mph) => write!(f, "GPS: {:.1} mph", mph)?,
            None => write!(f, "GPS: no fix")?,
        }
        if let Some(can) = self.can {
            write!(f, " | {}", can.label())?;
        }
        Ok(())
    }
}

/// The running dashcam
pub struct DashcamSystem {
    group: Arc<RecordingGroup>,
    board: Arc<TelemetryBoard>,
    display_stats: Option<Arc<Mutex<DisplayStats>>>,
    display_workers: WorkerSet,
    telemetry_workers: WorkerSet,
    recorder_workers: WorkerSet,
}

impl DashcamSystem {
    /// Bring everything up. `config` must already be validated.
    pub fn start(config: &DashcamConfig, devices: &dyn Devices) -> Result<Self, SystemError> {
        let paths = config.recording.paths();
        paths.create()?;
        paths.archive_leftovers()?;
        info!("Video directory: {}", paths.root.display());

        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        let group = Arc::new(init_cameras(config, devices, clock.clone())?);
        let bus = Arc::new(FrameBus::new());
        let board = Arc::new(TelemetryBoard::new());

        let mut display_workers = WorkerSet::new();
        let mut telemetry_workers = WorkerSet::new();
        let mut recorder_workers = WorkerSet::new();

        let display_stats = start_display(
            config,
            &group,
            &bus,
            &board,
            &mut display_workers,
            &mut recorder_workers,
        )?;

        start_telemetry(config, devices, &board, &mut telemetry_workers)?;

        if group.start_all() {
            info!("Recording started");
        } else {
            warn!("No camera is recording");
        }
        SegmentScheduler::new(&config.recording, clock).spawn(&mut recorder_workers, group.clone())?;

        let guardian = DiskGuardian::new(config.disk.clone(), paths, Box::new(StatvfsUsage));
        if let Err(e) = guardian.check() {
            warn!("Initial disk check failed: {}", e);
        }
        guardian.spawn(&mut recorder_workers)?;

        info!("Dashcam running");
        Ok(Self {
            group,
            board,
            display_stats,
            display_workers,
            telemetry_workers,
            recorder_workers,
        })
    }

    pub fn status(&self) -> SystemStatus {
        SystemStatus {
            cameras: self.group.stats(),
            display: self
                .display_stats
                .as_ref()
                .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).clone()),
            gps: self.board.gps(),
            can: self.board.can_status(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.group.refresh_flag()
    }

    /// Stop recording, then telemetry, then the display.
    ///
    /// Returns the number of threads that missed their join deadline.
    pub fn shutdown(mut self) -> usize {
        info!("Shutting down...");
        let mut stuck = self.recorder_workers.shutdown(DEFAULT_JOIN_TIMEOUT);
        self.group.close_all();
        stuck += self.telemetry_workers.shutdown(DEFAULT_JOIN_TIMEOUT);
        stuck += self.display_workers.shutdown(DEFAULT_JOIN_TIMEOUT);
        if stuck > 0 {
            warn!("{} threads did not stop in time", stuck);
        }
        info!("Shutdown complete");
        stuck
    }
}

fn init_cameras(
    config: &DashcamConfig,
    devices: &dyn Devices,
    clock: Arc<dyn Clock>,
) -> Result<RecordingGroup, SystemError> {
    let paths = config.recording.paths();
    let mut group = RecordingGroup::new();
    let mut failed = Vec::new();

    for camera in config.cameras.enabled() {
        let mut recorder =
            CameraRecorder::new(camera.clone(), devices.camera(camera), paths.clone(), clock.clone());
        match recorder.init() {
            Ok(()) => {
                group.add(recorder);
            }
            Err(e) => {
                warn!("Skipping {} camera: {}", camera.role, e);
                failed.push(camera.role);
            }
        }
    }

    if group.is_empty() {
        return Err(SystemError::NoCamera);
    }
    if let Some(&role) = failed.first() {
        if !config.recording.continue_on_single_camera {
            group.close_all();
            return Err(SystemError::CameraRequired(role));
        }
        warn!("Continuing with a single camera");
    }
    Ok(group)
}

/// Configured display camera, else whichever camera came up
fn display_camera(group: &RecordingGroup, preferred: CameraRole) -> Option<SharedRecorder> {
    if let Some(recorder) = group.find(preferred) {
        return Some(recorder);
    }
    let fallback = group.recorders().first().cloned()?;
    let role = fallback.lock().unwrap_or_else(PoisonError::into_inner).role();
    warn!("{} camera unavailable, displaying {} camera", preferred, role);
    Some(fallback)
}

fn build_overlay(config: &OverlayConfig) -> Option<OverlayCache> {
    if !config.enabled {
        return None;
    }
    match TextOverlayRenderer::load(config) {
        Ok(renderer) => Some(OverlayCache::new(Box::new(renderer))),
        Err(e) => {
            warn!("Overlay disabled: {}", e);
            None
        }
    }
}

fn start_display(
    config: &DashcamConfig,
    group: &RecordingGroup,
    bus: &Arc<FrameBus>,
    board: &Arc<TelemetryBoard>,
    display_workers: &mut WorkerSet,
    recorder_workers: &mut WorkerSet,
) -> Result<Option<Arc<Mutex<DisplayStats>>>, SystemError> {
    if !config.display.enabled {
        info!("Display disabled");
        return Ok(None);
    }
    let Some(recorder) = display_camera(group, config.display.camera) else {
        return Ok(None);
    };

    let (camera, hardware_applied) = {
        let recorder = recorder.lock().unwrap_or_else(PoisonError::into_inner);
        (recorder.config().clone(), recorder.hardware_transform_applied())
    };
    let transform = TransformStage::new(
        camera.rotation,
        camera.hflip,
        camera.vflip,
        config.display.mirror_mode,
    )
    .with_hardware_applied(hardware_applied);

    let mut render = RenderLoop::new(
        config.display.clone(),
        bus.clone(),
        transform,
        create_backend(&config.display),
    )
    .with_recording_flag(group.recording_flag())
    .with_telemetry(board.clone());
    if let Some(cache) = build_overlay(&config.overlay) {
        render = render.with_overlay(cache, config.overlay.clone());
    }

    match render.start() {
        Ok(surface) => info!(
            "Display ready on {}: {}x{} showing {} camera",
            render.backend_name(),
            surface.width,
            surface.height,
            camera.role
        ),
        Err(e) => {
            error!("Display unavailable, continuing without it: {}", e);
            return Ok(None);
        }
    }

    let stats = render.stats_handle();
    render.spawn(display_workers)?;
    spawn_capture_loop(
        recorder_workers,
        recorder,
        bus.clone(),
        RecoveryManager::new(config.recovery.clone()),
    )?;
    Ok(Some(stats))
}

fn start_telemetry(
    config: &DashcamConfig,
    devices: &dyn Devices,
    board: &Arc<TelemetryBoard>,
    workers: &mut WorkerSet,
) -> Result<(), WorkerError> {
    let telemetry = &config.telemetry;
    if telemetry.gps_enabled {
        spawn_gps_feed(workers, telemetry, board.clone())?;
    }
    if telemetry.can_enabled {
        match devices.vehicle_bus() {
            Some(bus) => spawn_vehicle_feed(workers, telemetry, bus, board.clone())?,
            None => warn!("CAN enabled but no vehicle bus is available"),
        }
    }
    Ok(())
}
