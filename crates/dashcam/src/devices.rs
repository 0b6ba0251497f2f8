//! Hardware collaborators
//!
//! Sensor drivers and the vehicle-bus decoder live outside this workspace and
//! are plugged in through [`Devices`]. [`SyntheticDevices`] stands in for both
//! on a bench.

use camera_capture::{Camera, CameraConfig, PatternCamera};
use std::time::Instant;
use telemetry::{BusStats, VehicleBus};

/// Source of cameras and the vehicle bus
pub trait Devices {
    /// Camera for `config`; opened later by its recorder
    fn camera(&self, config: &CameraConfig) -> Box<dyn Camera>;

    /// Decoded vehicle bus, if this build has one
    fn vehicle_bus(&self) -> Option<Box<dyn VehicleBus>>;
}

/// Test-pattern cameras and an always-busy vehicle bus
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticDevices;

impl Devices for SyntheticDevices {
    fn camera(&self, config: &CameraConfig) -> Box<dyn Camera> {
        Box::new(PatternCamera::new(config.clone()))
    }

    fn vehicle_bus(&self) -> Option<Box<dyn VehicleBus>> {
        Some(Box::new(SyntheticBus::new()))
    }
}

/// Connected bus burning fuel at a steady rate
pub struct SyntheticBus {
    started: Instant,
}

impl SyntheticBus {
    /// Roughly 8 L/h
    const LITERS_PER_SEC: f64 = 8.0 / 3600.0;

    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SyntheticBus {
    fn default() -> Self {
        Self::new()
    }
}

impl VehicleBus for SyntheticBus {
    fn stats(&self) -> BusStats {
        BusStats {
            connected: true,
            last_message_time: Some(Instant::now()),
        }
    }

    fn fuel_consumed_liters(&self) -> Option<f64> {
        Some(self.started.elapsed().as_secs_f64() * Self::LITERS_PER_SEC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camera_capture::CameraRole;
    use std::time::Duration;
    use telemetry::CanStatus;

    #[test]
    fn test_synthetic_camera_matches_config() {
        let camera = SyntheticDevices.camera(&CameraConfig::rear());
        assert_eq!(camera.role(), CameraRole::Rear);
        assert!(!camera.is_open());
    }

    #[test]
    fn test_synthetic_bus_reports_ok() {
        let bus = SyntheticDevices.vehicle_bus().unwrap();
        let status = CanStatus::from_stats(&bus.stats(), Instant::now(), Duration::from_secs(5));
        assert_eq!(status, CanStatus::Ok);
        assert!(bus.fuel_consumed_liters().unwrap() >= 0.0);
    }
}
