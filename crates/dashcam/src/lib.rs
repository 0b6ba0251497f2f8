//! Dashcam Application
//!
//! Configuration, logging and the wiring that turns the display, recorder
//! and telemetry crates into one running device.

pub mod config;
pub mod devices;
pub mod logging;
pub mod system;

pub use config::{CameraSettings, ConfigError, DashcamConfig, DEFAULT_CONFIG_PATH};
pub use devices::{Devices, SyntheticBus, SyntheticDevices};
pub use logging::init_logging;
pub use system::{DashcamSystem, SystemError, SystemStatus};
