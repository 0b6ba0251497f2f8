//! Render loop
//!
//! One thread: take → normalize → transform → fit → overlay → blend → pack →
//! present, then sleep out the rest of the frame budget.

use crate::backend::{PresentationBackend, SurfaceInfo};
use crate::compositor::blend;
use crate::overlay::{OverlayCache, OverlayConfig, OverlaySample, OverlayState};
use crate::packer::Packer;
use crate::transform::TransformStage;
use crate::{DisplayConfig, DisplayError};
use camera_capture::FrameBus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use telemetry::TelemetryBoard;
use tracing::{debug, error, info, warn};
use worker::{StopToken, WorkerError, WorkerSet};

/// A tick longer than this many budgets counts as a dropped frame
const DROP_FACTOR: f64 = 1.5;

/// Interval between FPS log lines
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Display statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DisplayStats {
    pub frames_presented: u64,
    /// Frames the backend refused to write
    pub frames_failed: u64,
    /// Ticks per second over the last report interval
    pub actual_fps: f64,
    pub target_fps: u32,
    pub mirror_mode: bool,
}

/// Per-stage time accumulated since the last report
#[derive(Debug, Clone, Default)]
pub struct RenderTiming {
    pub ticks: u32,
    pub take: Duration,
    pub transform: Duration,
    pub fit: Duration,
    pub overlay: Duration,
    pub blend: Duration,
    pub pack: Duration,
    pub present: Duration,
}

impl RenderTiming {
    fn avg_ms(&self, total: Duration) -> f64 {
        total.as_secs_f64() * 1000.0 / self.ticks.max(1) as f64
    }

    /// One-line summary of the average stage times
    pub fn summary(&self) -> String {
        format!(
            "take {:.1}ms, transform {:.1}ms, fit {:.1}ms, overlay {:.1}ms, blend {:.1}ms, pack {:.1}ms, present {:.1}ms",
            self.avg_ms(self.take),
            self.avg_ms(self.transform),
            self.avg_ms(self.fit),
            self.avg_ms(self.overlay),
            self.avg_ms(self.blend),
            self.avg_ms(self.pack),
            self.avg_ms(self.present),
        )
    }
}

/// Times one stage into its accumulator
fn timed<T>(slot: &mut Duration, f: impl FnOnce() -> T) -> T {
    let start = Instant::now();
    let out = f();
    *slot += start.elapsed();
    out
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Presentation pipeline for one display session
pub struct RenderLoop {
    config: DisplayConfig,
    bus: Arc<FrameBus>,
    transform: TransformStage,
    backend: Box<dyn PresentationBackend>,
    overlay: Option<(OverlayCache, OverlayConfig)>,
    telemetry: Option<Arc<TelemetryBoard>>,
    recording: Arc<AtomicBool>,
    packer: Option<Packer>,
    timing: RenderTiming,
    /// Write failures since the last report
    window_failures: u32,
    stats: Arc<Mutex<DisplayStats>>,
}

impl RenderLoop {
    pub fn new(
        config: DisplayConfig,
        bus: Arc<FrameBus>,
        transform: TransformStage,
        backend: Box<dyn PresentationBackend>,
    ) -> Self {
        let stats = DisplayStats {
            target_fps: config.fps,
            mirror_mode: config.mirror_mode,
            ..Default::default()
        };
        Self {
            config,
            bus,
            transform,
            backend,
            overlay: None,
            telemetry: None,
            recording: Arc::new(AtomicBool::new(false)),
            packer: None,
            timing: RenderTiming::default(),
            window_failures: 0,
            stats: Arc::new(Mutex::new(stats)),
        }
    }

    /// Draw the overlay from `cache` on every frame
    pub fn with_overlay(mut self, cache: OverlayCache, config: OverlayConfig) -> Self {
        self.overlay = Some((cache, config));
        self
    }

    /// Read speed, CAN and fuel from `board`
    pub fn with_telemetry(mut self, board: Arc<TelemetryBoard>) -> Self {
        self.telemetry = Some(board);
        self
    }

    /// Flag driving the REC indicator
    pub fn with_recording_flag(mut self, recording: Arc<AtomicBool>) -> Self {
        self.recording = recording;
        self
    }

    /// Shared statistics, updated once per report interval
    pub fn stats_handle(&self) -> Arc<Mutex<DisplayStats>> {
        self.stats.clone()
    }

    fn stats(&self) -> MutexGuard<'_, DisplayStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Acquire the output surface.
    ///
    /// Called before spawning so the caller can decide how to degrade.
    pub fn start(&mut self) -> Result<SurfaceInfo, DisplayError> {
        let surface = self.backend.start()?;
        self.packer = Some(Packer::new(surface.format, surface.width, surface.height));
        if self.transform.is_bypassed() {
            info!("Hardware transform active, software transform skipped");
        }
        Ok(surface)
    }

    fn sample(&self) -> OverlaySample {
        let board = self.telemetry.as_deref();
        OverlaySample {
            unix_time: unix_now(),
            speed_mph: board.and_then(|b| b.speed_mph()),
            recording: self.recording.load(Ordering::Relaxed),
            can_status: board.and_then(|b| b.can_status()),
            fuel_liters: board.and_then(|b| b.fuel_liters()),
        }
    }

    /// Render and present one frame.
    ///
    /// Shows black until the first frame arrives.
    pub fn tick(&mut self) -> Result<(), DisplayError> {
        let Some(surface) = self.backend.surface() else {
            return Err(DisplayError::Transient("display not started".to_string()));
        };
        let sample = self.sample();
        let mut timing = std::mem::take(&mut self.timing);
        timing.ticks += 1;

        let latest = timed(&mut timing.take, || self.bus.take());
        let result = match latest {
            None => {
                let packer = self.packer.get_or_insert_with(|| {
                    Packer::new(surface.format, surface.width, surface.height)
                });
                let black = packer.black();
                let start = Instant::now();
                let presented = self.backend.present(black);
                timing.present += start.elapsed();
                presented
            }
            Some(latest) => {
                let frame = timed(&mut timing.transform, || {
                    self.transform.apply(latest.to_rgb())
                });
                drop(latest);

                let mut frame = timed(&mut timing.fit, || {
                    if (frame.width, frame.height) == (surface.width, surface.height) {
                        frame
                    } else {
                        frame.resize(surface.width, surface.height)
                    }
                });

                if let Some((cache, config)) = &self.overlay {
                    let mask = timed(&mut timing.overlay, || {
                        let state = OverlayState::from_sample(config, &sample);
                        cache.refresh(&state, surface.width, surface.height)
                    });
                    if let Some(mask) = mask {
                        timed(&mut timing.blend, || {
                            blend(&mut frame.data, frame.width, frame.height, &mask)
                        });
                    }
                }

                let packer = self.packer.get_or_insert_with(|| {
                    Packer::new(surface.format, surface.width, surface.height)
                });
                let start = Instant::now();
                let packed = packer.pack(&frame.data);
                timing.pack += start.elapsed();

                let start = Instant::now();
                let presented = self.backend.present(packed);
                timing.present += start.elapsed();
                presented
            }
        };

        self.timing = timing;
        match &result {
            Ok(()) => self.stats().frames_presented += 1,
            Err(e) => self.record_failure(e),
        }
        result
    }

    /// Count a failed write; only the first one per report window is logged
    fn record_failure(&mut self, err: &DisplayError) {
        self.stats().frames_failed += 1;
        self.window_failures += 1;
        if self.window_failures == 1 {
            warn!("Frame write failed on {}: {}", self.backend.name(), err);
        }
    }

    /// Failures since the previous call
    fn take_failures(&mut self) -> u32 {
        std::mem::take(&mut self.window_failures)
    }

    /// Tick at the target rate until `token` stops, then release the surface
    pub fn run(mut self, token: StopToken) {
        if self.backend.surface().is_none() {
            if let Err(e) = self.start() {
                error!("Display start failed on {}: {}", self.backend.name(), e);
                return;
            }
        }

        let budget = self.config.frame_budget();
        let mut report_start = Instant::now();
        let mut ticks = 0u32;
        info!(
            "Render loop running at {} FPS on {} (mirror {})",
            self.config.fps,
            self.backend.name(),
            self.config.mirror_mode
        );

        while token.is_running() {
            let started = Instant::now();
            if let Err(e) = self.tick() {
                debug!("Frame dropped: {}", e);
            }
            ticks += 1;

            let since_report = report_start.elapsed();
            if since_report >= REPORT_INTERVAL {
                let failed = self.take_failures();
                if failed > 1 {
                    warn!(
                        "{} frame writes failed in the last {:.1}s",
                        failed,
                        since_report.as_secs_f64()
                    );
                }
                let fps = ticks as f64 / since_report.as_secs_f64();
                self.stats().actual_fps = fps;
                if self.config.log_fps {
                    info!("Display: {:.1} FPS | {}", fps, self.timing.summary());
                }
                self.timing = RenderTiming::default();
                report_start = Instant::now();
                ticks = 0;
            }

            let elapsed = started.elapsed();
            if elapsed.as_secs_f64() > budget.as_secs_f64() * DROP_FACTOR {
                if self.config.log_dropped_frames {
                    warn!(
                        "Frame took {:.1}ms, budget {:.1}ms",
                        elapsed.as_secs_f64() * 1000.0,
                        budget.as_secs_f64() * 1000.0
                    );
                }
                continue;
            }
            if !token.sleep(budget.saturating_sub(elapsed)) {
                break;
            }
        }

        self.backend.stop();
        info!("Render loop stopped");
    }

    /// Run the loop on its own thread in `workers`
    pub fn spawn(self, workers: &mut WorkerSet) -> Result<(), WorkerError> {
        workers.spawn("render", move |token| self.run(token))
    }
}
