//! Polling feed threads and the shared telemetry board
//!
//! Each feed owns its collaborator and writes single fields under their own
//! locks. The render thread only reads snapshots.

use crate::gps::{GpsSource, GpsStatus, GpsdClient};
use crate::vehicle::{CanStatus, VehicleBus};
use crate::{TelemetryConfig, TelemetryError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use worker::{StopToken, WorkerError, WorkerSet};

/// gpsd read timeout, short enough to notice a stop request promptly
const GPS_READ_TIMEOUT: Duration = Duration::from_millis(100);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Latest telemetry values, one lock per field
#[derive(Default)]
pub struct TelemetryBoard {
    gps: Mutex<GpsStatus>,
    can_status: Mutex<Option<CanStatus>>,
    fuel_liters: Mutex<Option<f64>>,
}

impl TelemetryBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_gps(&self, status: GpsStatus) {
        *lock(&self.gps) = status;
    }

    pub fn gps(&self) -> GpsStatus {
        lock(&self.gps).clone()
    }

    /// Speed in mph, `None` without a fix
    pub fn speed_mph(&self) -> Option<f64> {
        lock(&self.gps).speed()
    }

    pub fn set_can_status(&self, status: Option<CanStatus>) {
        *lock(&self.can_status) = status;
    }

    /// `None` when no vehicle bus is attached
    pub fn can_status(&self) -> Option<CanStatus> {
        *lock(&self.can_status)
    }

    pub fn set_fuel_liters(&self, liters: Option<f64>) {
        *lock(&self.fuel_liters) = liters;
    }

    pub fn fuel_liters(&self) -> Option<f64> {
        *lock(&self.fuel_liters)
    }
}

/// Spawn the gpsd polling thread
pub fn spawn_gps_feed(
    workers: &mut WorkerSet,
    config: &TelemetryConfig,
    board: Arc<TelemetryBoard>,
) -> Result<(), WorkerError> {
    let config = config.clone();
    let mut client = GpsdClient::new(config.gpsd_addr());
    workers.spawn("gps-feed", move |token| {
        run_gps_feed(&mut client, &config, &board, &token);
    })
}

fn run_gps_feed(
    client: &mut GpsdClient,
    config: &TelemetryConfig,
    board: &TelemetryBoard,
    token: &StopToken,
) {
    let attempts = config.gps_retry_attempts.max(1);
    let mut failures = 0u32;

    while token.is_running() {
        if !client.is_connected() {
            match client.connect(GPS_READ_TIMEOUT) {
                Ok(()) => failures = 0,
                Err(e) => {
                    failures += 1;
                    if failures >= attempts {
                        error!("GPS unavailable after {} attempts: {}", failures, e);
                        board.set_gps(GpsStatus::default());
                        return;
                    }
                    warn!("gpsd connection attempt {}/{} failed: {}", failures, attempts, e);
                    if !token.sleep(config.gps_retry_delay()) {
                        break;
                    }
                    continue;
                }
            }
        }

        match client.poll() {
            Ok(true) => board.set_gps(client.status()),
            Ok(false) => {}
            Err(TelemetryError::Parse(e)) => debug!("Skipping malformed gpsd report: {}", e),
            Err(e) => {
                warn!("GPS read error: {}", e);
                board.set_gps(client.status());
            }
        }

        if client
            .since_last_report()
            .is_some_and(|age| age > config.gps_stale_after())
        {
            warn!("GPS data is stale, reconnecting");
            client.disconnect();
            board.set_gps(client.status());
        }
    }

    client.disconnect();
    debug!("GPS feed stopped");
}

/// Spawn the vehicle-bus polling thread
pub fn spawn_vehicle_feed(
    workers: &mut WorkerSet,
    config: &TelemetryConfig,
    bus: Box<dyn VehicleBus>,
    board: Arc<TelemetryBoard>,
) -> Result<(), WorkerError> {
    let stale_after = config.can_stale_after();
    let interval = config.can_poll_interval();
    workers.spawn("vehicle-feed", move |token| {
        let mut last: Option<CanStatus> = None;
        loop {
            let status = CanStatus::from_stats(&bus.stats(), Instant::now(), stale_after);
            if last != Some(status) {
                info!("Vehicle bus: {}", status.label());
                last = Some(status);
            }
            board.set_can_status(Some(status));
            board.set_fuel_liters(bus.fuel_consumed_liters());

            if !token.sleep(interval) {
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle::BusStats;
    use std::io::Write;
    use std::net::TcpListener;
    use std::thread;

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_board_defaults() {
        let board = TelemetryBoard::new();
        assert_eq!(board.speed_mph(), None);
        assert_eq!(board.can_status(), None);
        assert_eq!(board.fuel_liters(), None);
    }

    #[test]
    fn test_gps_feed_publishes_speed() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            conn.write_all(b"{\"class\":\"TPV\",\"mode\":2,\"speed\":20.0}\n")
                .unwrap();
            // Keep the connection open briefly.
            thread::sleep(Duration::from_millis(300));
        });

        let config = TelemetryConfig {
            gpsd_port: port,
            ..Default::default()
        };
        let board = Arc::new(TelemetryBoard::new());
        let mut workers = WorkerSet::new();
        spawn_gps_feed(&mut workers, &config, board.clone()).unwrap();

        assert!(wait_for(|| board
            .speed_mph()
            .is_some_and(|mph| (mph - 44.7388).abs() < 1e-3)));

        assert_eq!(workers.shutdown(Duration::from_secs(2)), 0);
        server.join().unwrap();
    }

    #[test]
    fn test_gps_feed_gives_up_without_gpsd() {
        // Grab a free port, then close it so connects are refused.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let config = TelemetryConfig {
            gpsd_port: port,
            gps_retry_attempts: 2,
            gps_retry_delay_secs: 0.01,
            ..Default::default()
        };
        let board = Arc::new(TelemetryBoard::new());
        let mut workers = WorkerSet::new();
        spawn_gps_feed(&mut workers, &config, board.clone()).unwrap();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(workers.shutdown(Duration::from_secs(2)), 0);
        assert_eq!(board.speed_mph(), None);
    }

    struct FakeBus {
        stats: BusStats,
        fuel: Option<f64>,
    }

    impl VehicleBus for FakeBus {
        fn stats(&self) -> BusStats {
            self.stats
        }

        fn fuel_consumed_liters(&self) -> Option<f64> {
            self.fuel
        }
    }

    #[test]
    fn test_vehicle_feed_publishes_status_and_fuel() {
        let bus = FakeBus {
            stats: BusStats {
                connected: true,
                last_message_time: Some(Instant::now()),
            },
            fuel: Some(3.5),
        };
        let config = TelemetryConfig {
            can_poll_interval_ms: 5,
            can_stale_after_secs: 3600.0,
            ..Default::default()
        };
        let board = Arc::new(TelemetryBoard::new());
        let mut workers = WorkerSet::new();
        spawn_vehicle_feed(&mut workers, &config, Box::new(bus), board.clone()).unwrap();

        assert!(wait_for(|| board.can_status().is_some()));
        assert_eq!(board.can_status(), Some(CanStatus::Ok));
        assert_eq!(board.fuel_liters(), Some(3.5));
        assert_eq!(workers.shutdown(Duration::from_secs(2)), 0);
    }
}
