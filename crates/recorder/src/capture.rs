//! Display capture loop
//!
//! Pulls frames from the display camera at its frame rate and publishes them
//! on the frame bus. Capture errors go to the recovery manager inline; the
//! loop ends once recovery gives up.

use crate::recorder::{lock, SharedRecorder};
use crate::recovery::{RecoveryManager, RecoveryOutcome};
use camera_capture::FrameBus;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use worker::{StopToken, WorkerError, WorkerSet};

fn run_capture_loop(
    recorder: &SharedRecorder,
    bus: &FrameBus,
    recovery: &mut RecoveryManager,
    interval: Duration,
    token: &StopToken,
) {
    while token.is_running() {
        let captured = lock(recorder).capture_frame();
        match captured {
            Ok(Some(frame)) => bus.update(frame),
            Ok(None) => {}
            Err(e) => {
                warn!("Display capture error: {}", e);
                match recovery.recover(recorder, token) {
                    RecoveryOutcome::Recovered | RecoveryOutcome::RetryPending => continue,
                    RecoveryOutcome::Exhausted => {
                        error!("Display camera disabled after repeated failures");
                        break;
                    }
                    RecoveryOutcome::Aborted => break,
                }
            }
        }

        if !token.sleep(interval) {
            break;
        }
    }
}

/// Spawn the capture thread for the display camera
pub fn spawn_capture_loop(
    workers: &mut WorkerSet,
    recorder: SharedRecorder,
    bus: Arc<FrameBus>,
    mut recovery: RecoveryManager,
) -> Result<(), WorkerError> {
    let (role, fps) = {
        let recorder = lock(&recorder);
        (recorder.role(), recorder.config().fps)
    };
    let interval = Duration::from_secs_f64(1.0 / fps.max(1) as f64);
    workers.spawn("capture", move |token| {
        info!("Starting capture loop for {} camera at {}fps", role, fps);
        run_capture_loop(&recorder, &bus, &mut recovery, interval, &token);
        info!("Capture loop for {} camera stopped", role);
    })
}
