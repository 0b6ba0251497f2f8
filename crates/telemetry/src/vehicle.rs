//! Vehicle-bus collaborator

use std::time::{Duration, Instant};

/// Connection snapshot reported by the vehicle bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Interface is up
    pub connected: bool,
    /// Arrival time of the most recent message
    pub last_message_time: Option<Instant>,
}

/// Decoded vehicle bus, polled for overlay text
pub trait VehicleBus: Send {
    fn stats(&self) -> BusStats;

    /// Fuel consumed since the last reset, in litres
    fn fuel_consumed_liters(&self) -> Option<f64>;
}

/// Bus health shown on the overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CanStatus {
    /// Connected with recent traffic
    Ok,
    /// Connected, but quiet for longer than the stale window
    Idle,
    /// Interface down
    Off,
}

impl CanStatus {
    /// Classify a stats snapshot at time `now`
    pub fn from_stats(stats: &BusStats, now: Instant, stale_after: Duration) -> Self {
        if !stats.connected {
            return CanStatus::Off;
        }
        match stats.last_message_time {
            Some(t) if now.saturating_duration_since(t) <= stale_after => CanStatus::Ok,
            _ => CanStatus::Idle,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            CanStatus::Ok => "CAN OK",
            CanStatus::Idle => "CAN IDLE",
            CanStatus::Off => "CAN OFF",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_can_status_classification() {
        let now = Instant::now();
        let stale = Duration::from_secs(5);

        let off = BusStats::default();
        assert_eq!(CanStatus::from_stats(&off, now, stale), CanStatus::Off);

        let silent = BusStats {
            connected: true,
            last_message_time: None,
        };
        assert_eq!(CanStatus::from_stats(&silent, now, stale), CanStatus::Idle);

        let fresh = BusStats {
            connected: true,
            last_message_time: Some(now),
        };
        assert_eq!(CanStatus::from_stats(&fresh, now, stale), CanStatus::Ok);
        assert_eq!(
            CanStatus::from_stats(&fresh, now + Duration::from_secs(6), stale),
            CanStatus::Idle
        );
    }

    #[test]
    fn test_labels() {
        assert_eq!(CanStatus::Ok.label(), "CAN OK");
        assert_eq!(CanStatus::Idle.label(), "CAN IDLE");
        assert_eq!(CanStatus::Off.label(), "CAN OFF");
    }

    proptest! {
        #[test]
        fn prop_status_follows_message_age(
            connected in any::<bool>(),
            age_ms in 0u64..20_000,
            stale_ms in 0u64..10_000,
        ) {
            let last = Instant::now();
            let stats = BusStats {
                connected,
                last_message_time: Some(last),
            };
            let status = CanStatus::from_stats(
                &stats,
                last + Duration::from_millis(age_ms),
                Duration::from_millis(stale_ms),
            );
            let expected = match (connected, age_ms <= stale_ms) {
                (false, _) => CanStatus::Off,
                (true, true) => CanStatus::Ok,
                (true, false) => CanStatus::Idle,
            };
            prop_assert_eq!(status, expected);
        }
    }
}
