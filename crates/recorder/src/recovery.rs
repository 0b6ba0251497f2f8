//! Bounded camera recovery
//!
//! Each recovery closes the failing camera, waits, and re-initializes it.
//! Consecutive recoveries are counted; a successful re-init resets the count.
//! Past the ceiling the camera is given up on and, if configured, the system
//! is rebooted.

use crate::recorder::{lock, CameraRecorder};
use crate::RecoveryConfig;
use std::io;
use std::process::Command;
use std::sync::Mutex;
use tracing::{error, info, warn};
use worker::StopToken;

/// Result of one recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Camera re-initialized; counter reset
    Recovered,
    /// Re-init failed; the next failure tries again
    RetryPending,
    /// Retry ceiling exceeded; the camera stays down
    Exhausted,
    /// Shutdown requested while waiting
    Aborted,
}

/// Last-resort system actions
pub trait SystemControl: Send {
    fn reboot(&self) -> io::Result<()>;
}

/// Reboots through the `reboot` command
pub struct RebootCommand;

impl SystemControl for RebootCommand {
    fn reboot(&self) -> io::Result<()> {
        let status = Command::new("reboot").status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("reboot exited with {}", status)))
        }
    }
}

pub struct RecoveryManager {
    config: RecoveryConfig,
    control: Box<dyn SystemControl>,
    failures: u32,
    rebooted: bool,
}

impl RecoveryManager {
    pub fn new(config: RecoveryConfig) -> Self {
        Self::with_control(config, Box::new(RebootCommand))
    }

    pub fn with_control(config: RecoveryConfig, control: Box<dyn SystemControl>) -> Self {
        Self {
            config,
            control,
            failures: 0,
            rebooted: false,
        }
    }

    /// Consecutive failures since the last successful recovery
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Try to bring `recorder` back after a capture or encode failure.
    ///
    /// A camera that was recording resumes recording after re-init.
    pub fn recover(&mut self, recorder: &Mutex<CameraRecorder>, token: &StopToken) -> RecoveryOutcome {
        self.failures += 1;
        if self.failures > self.config.camera_retry_attempts {
            self.give_up();
            return RecoveryOutcome::Exhausted;
        }
        warn!(
            "Attempting camera recovery ({}/{})...",
            self.failures, self.config.camera_retry_attempts
        );

        let was_recording = {
            let mut recorder = lock(recorder);
            let was_recording = recorder.is_recording();
            recorder.close();
            was_recording
        };

        if !token.sleep(self.config.retry_delay()) {
            return RecoveryOutcome::Aborted;
        }

        let mut recorder = lock(recorder);
        if let Err(e) = recorder.init() {
            warn!("Camera {} re-init failed: {}", recorder.role(), e);
            return RecoveryOutcome::RetryPending;
        }
        if was_recording {
            if let Err(e) = recorder.start_recording() {
                warn!("Camera {} did not resume recording: {}", recorder.role(), e);
            }
        }
        info!("Camera {} recovered", recorder.role());
        self.failures = 0;
        RecoveryOutcome::Recovered
    }

    fn give_up(&mut self) {
        if self.rebooted {
            return;
        }
        error!("Camera recovery failed after maximum retries");
        if self.config.camera_failure_reboot {
            error!("Rebooting system...");
            self.rebooted = true;
            if let Err(e) = self.control.reboot() {
                error!("Reboot failed: {}", e);
            }
        }
    }
}
