//! Telemetry feeds for the dashcam
//!
//! GPS fix computation and vehicle-bus decoding happen elsewhere; this crate
//! only polls their status snapshots on owned threads and publishes the few
//! scalar values the overlay needs through a [`TelemetryBoard`].

pub mod feed;
pub mod gps;
pub mod vehicle;

pub use feed::{spawn_gps_feed, spawn_vehicle_feed, TelemetryBoard};
pub use gps::{GpsSource, GpsStatus, GpsdClient};
pub use vehicle::{BusStats, CanStatus, VehicleBus};

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Telemetry error types
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Read failed: {0}")]
    Read(String),

    #[error("Malformed report: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Not connected")]
    NotConnected,
}

/// Telemetry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Poll gpsd for speed
    pub gps_enabled: bool,
    /// gpsd host
    pub gpsd_host: String,
    /// gpsd port
    pub gpsd_port: u16,
    /// Consecutive connection attempts before the GPS feed gives up
    pub gps_retry_attempts: u32,
    /// Delay between connection attempts (seconds)
    pub gps_retry_delay_secs: f64,
    /// Reports older than this are treated as a dead connection (seconds)
    pub gps_stale_after_secs: f64,
    /// Poll the vehicle bus for overlay text
    pub can_enabled: bool,
    /// A connected bus with no traffic for this long shows as idle (seconds)
    pub can_stale_after_secs: f64,
    /// Vehicle bus poll interval (milliseconds)
    pub can_poll_interval_ms: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            gps_enabled: true,
            gpsd_host: "127.0.0.1".to_string(),
            gpsd_port: 2947,
            gps_retry_attempts: 3,
            gps_retry_delay_secs: 2.0,
            gps_stale_after_secs: 10.0,
            can_enabled: false,
            can_stale_after_secs: 5.0,
            can_poll_interval_ms: 250,
        }
    }
}

impl TelemetryConfig {
    /// gpsd socket address as `host:port`
    pub fn gpsd_addr(&self) -> String {
        format!("{}:{}", self.gpsd_host, self.gpsd_port)
    }

    pub fn gps_retry_delay(&self) -> Duration {
        Duration::from_secs_f64(self.gps_retry_delay_secs.max(0.0))
    }

    pub fn gps_stale_after(&self) -> Duration {
        Duration::from_secs_f64(self.gps_stale_after_secs.max(0.0))
    }

    pub fn can_stale_after(&self) -> Duration {
        Duration::from_secs_f64(self.can_stale_after_secs.max(0.0))
    }

    pub fn can_poll_interval(&self) -> Duration {
        Duration::from_millis(self.can_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_gpsd_addr() {
        let config = TelemetryConfig::default();
        assert_eq!(config.gpsd_addr(), "127.0.0.1:2947");
        assert_eq!(config.gps_retry_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_negative_durations_clamp() {
        let config = TelemetryConfig {
            gps_retry_delay_secs: -1.0,
            can_poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.gps_retry_delay(), Duration::ZERO);
        assert_eq!(config.can_poll_interval(), Duration::from_millis(1));
    }
}
