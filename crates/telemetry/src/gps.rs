//! GPS status and a minimal gpsd JSON client
//!
//! gpsd streams one JSON object per line once `?WATCH` is enabled. Only `TPV`
//! (time-position-velocity) reports matter for the overlay; everything else
//! is skipped.

use crate::TelemetryError;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// m/s to mph
pub const MS_TO_MPH: f64 = 2.23694;

const WATCH_COMMAND: &[u8] = b"?WATCH={\"enable\":true,\"json\":true}\n";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// GPS snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GpsStatus {
    /// 2D or 3D fix
    pub has_fix: bool,
    /// Ground speed (mph)
    pub speed_mph: f64,
    pub latitude: f64,
    pub longitude: f64,
    /// Altitude (m)
    pub altitude: f64,
    /// Course over ground (degrees)
    pub heading: f64,
    /// Satellites used
    pub satellites: u32,
}

impl GpsStatus {
    /// Speed for display, `None` without a fix
    pub fn speed(&self) -> Option<f64> {
        self.has_fix.then_some(self.speed_mph)
    }
}

/// Anything that can hand out a GPS snapshot
pub trait GpsSource: Send {
    fn status(&self) -> GpsStatus;
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Report {
    class: String,
    mode: u8,
    lat: Option<f64>,
    lon: Option<f64>,
    alt: Option<f64>,
    speed: Option<f64>,
    track: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct SkyReport {
    #[serde(rename = "uSat")]
    used: Option<u32>,
}

/// Apply one gpsd line to `status`.
///
/// Returns `true` if the line was a TPV report.
pub fn apply_report(status: &mut GpsStatus, line: &str) -> Result<bool, TelemetryError> {
    let report: Report = serde_json::from_str(line)?;
    match report.class.as_str() {
        "TPV" => {
            status.has_fix = report.mode >= 2;
            status.latitude = report.lat.unwrap_or(0.0);
            status.longitude = report.lon.unwrap_or(0.0);
            status.altitude = report.alt.unwrap_or(0.0);
            status.speed_mph = report.speed.unwrap_or(0.0) * MS_TO_MPH;
            status.heading = report.track.unwrap_or(0.0);
            Ok(true)
        }
        "SKY" => {
            let sky: SkyReport = serde_json::from_str(line)?;
            if let Some(used) = sky.used {
                status.satellites = used;
            }
            Ok(false)
        }
        _ => Ok(false),
    }
}

/// gpsd client over TCP
pub struct GpsdClient {
    addr: String,
    reader: Option<BufReader<TcpStream>>,
    status: GpsStatus,
    last_report: Option<Instant>,
    line: String,
}

impl GpsdClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            reader: None,
            status: GpsStatus::default(),
            last_report: None,
            line: String::new(),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn is_connected(&self) -> bool {
        self.reader.is_some()
    }

    /// Connect and enable JSON watch mode. Reads time out after `read_timeout`.
    pub fn connect(&mut self, read_timeout: Duration) -> Result<(), TelemetryError> {
        self.disconnect();

        let connect_err = |source| TelemetryError::Connect {
            addr: self.addr.clone(),
            source,
        };
        let sock = self
            .addr
            .to_socket_addrs()
            .map_err(connect_err)?
            .next()
            .ok_or_else(|| {
                connect_err(std::io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    "address did not resolve",
                ))
            })?;

        let mut stream = TcpStream::connect_timeout(&sock, CONNECT_TIMEOUT).map_err(connect_err)?;
        stream
            .set_read_timeout(Some(read_timeout.max(Duration::from_millis(1))))
            .map_err(connect_err)?;
        stream.write_all(WATCH_COMMAND).map_err(connect_err)?;

        info!("Connected to gpsd at {}", self.addr);
        self.reader = Some(BufReader::new(stream));
        self.last_report = Some(Instant::now());
        Ok(())
    }

    /// Drop the connection and forget the fix
    pub fn disconnect(&mut self) {
        if self.reader.take().is_some() {
            debug!("Disconnected from gpsd at {}", self.addr);
        }
        self.status.has_fix = false;
        self.last_report = None;
    }

    /// Read at most one line.
    ///
    /// Returns `Ok(true)` when a TPV report updated the status and `Ok(false)`
    /// on timeout or for other report classes.
    pub fn poll(&mut self) -> Result<bool, TelemetryError> {
        let reader = self.reader.as_mut().ok_or(TelemetryError::NotConnected)?;

        // A timed-out read may leave a partial line behind; keep accumulating.
        match reader.read_line(&mut self.line) {
            Ok(0) => {
                self.disconnect();
                Err(TelemetryError::Read("connection closed by gpsd".to_string()))
            }
            Ok(_) => {
                let line = std::mem::take(&mut self.line);
                let line = line.trim();
                if line.is_empty() {
                    return Ok(false);
                }
                let tpv = apply_report(&mut self.status, line)?;
                if tpv {
                    self.last_report = Some(Instant::now());
                }
                Ok(tpv)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(false),
            Err(e) => {
                self.disconnect();
                Err(TelemetryError::Read(e.to_string()))
            }
        }
    }

    /// Time since the last TPV report (or since connecting)
    pub fn since_last_report(&self) -> Option<Duration> {
        self.last_report.map(|t| t.elapsed())
    }
}

impl GpsSource for GpsdClient {
    fn status(&self) -> GpsStatus {
        self.status.clone()
    }
}
