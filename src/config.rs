//! Configuration System using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, `config/scale_daq.toml` by default)
//! 2. Environment variables (prefixed with `SCALE_DAQ_`, nested keys split on `__`)
//!
//! Every field has a default, so an empty or missing file yields a usable
//! configuration.
//!
//! # Example
//! ```no_run
//! use scale_daq::config::Settings;
//!
//! let settings = Settings::load()?;
//! println!("Sampling at {} Hz", settings.acquisition.sample_rate_hz);
//! # Ok::<(), scale_daq::error::DaqError>(())
//! ```

use crate::error::{AppResult, DaqError};
use crate::logging::LogFormat;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/scale_daq.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Application settings
    pub application: ApplicationConfig,
    /// Polling, gridding and retention
    pub acquisition: AcquisitionConfig,
    /// Wired serial scales
    pub serial: SerialConfig,
    /// Wireless scales
    pub wireless: WirelessConfig,
    /// Synthetic noise scale
    pub synthetic: SyntheticConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Console log layout
    pub log_format: LogFormat,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Scale DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }
}

/// Consumer-side timing and Series retention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Grid rate of the reconciled Series in Hz
    pub sample_rate_hz: f64,
    /// How often the active source is drained (~30 Hz)
    pub poll_interval_ms: u64,
    /// How often backends are enumerated (~1 Hz)
    pub discovery_interval_ms: u64,
    /// Maximum retained Series entries; oldest are evicted first
    pub series_capacity: usize,
    /// Window of the "current reading" running average
    pub display_average_window_secs: f64,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: 10.0,
            poll_interval_ms: 33,
            discovery_interval_ms: 1000,
            series_capacity: 100_000,
            display_average_window_secs: 1.0,
        }
    }
}

impl AcquisitionConfig {
    /// Poll cadence as a `Duration`.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Discovery cadence as a `Duration`.
    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

/// Wired serial scale settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SerialConfig {
    /// Enumerate serial ports during discovery
    pub enabled: bool,
    /// Initial baud rate for new serial scales
    pub baud_rate: u32,
    /// How long to wait for the first byte after the port opens
    pub link_timeout_ms: u64,
    /// Per-byte read timeout; expiry ends the acquisition loop
    pub read_timeout_ms: u64,
    /// Longest line (including CRLF) accepted from the scale
    pub max_packet_size: usize,
    /// Readings buffered between the loop and the consumer
    pub buffer_capacity: usize,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            baud_rate: 9600,
            link_timeout_ms: 5000,
            read_timeout_ms: 1000,
            max_packet_size: 20,
            buffer_capacity: 10_000,
        }
    }
}

/// Wireless scale settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WirelessConfig {
    /// Run wireless scans during discovery
    pub enabled: bool,
    /// Only devices advertising this name are offered as scales
    pub name_filter: String,
    /// Socket read timeout; expiry ends the acquisition loop
    pub read_timeout_ms: u64,
    /// Per-line byte budget
    pub max_packet_size: usize,
    /// Readings buffered between the loop and the consumer
    pub buffer_capacity: usize,
    /// Devices reported by the bundled scanner
    pub peers: Vec<PeerConfig>,
}

impl Default for WirelessConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name_filter: "HC-05".to_string(),
            read_timeout_ms: 10_000,
            max_packet_size: 10,
            buffer_capacity: 10_000,
            peers: Vec::new(),
        }
    }
}

/// A statically known wireless device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerConfig {
    /// Advertised device name
    pub name: String,
    /// Connection address understood by the link connector (e.g. `host:port`)
    pub address: String,
}

/// Synthetic scale settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyntheticConfig {
    /// Offer the synthetic scale during discovery
    pub enabled: bool,
    /// Native rate of generated samples
    pub sample_rate_hz: f64,
    /// Standard deviation of the generated noise (raw counts)
    pub noise_std_dev: f64,
    /// Fixed RNG seed; `None` draws from the OS
    pub seed: Option<u64>,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_rate_hz: 80.0,
            noise_std_dev: 100.0,
            seed: None,
        }
    }
}

impl Settings {
    /// Load configuration from the default file and environment variables
    ///
    /// Environment variables override the file with prefix `SCALE_DAQ_`.
    /// Example: `SCALE_DAQ_SERIAL__BAUD_RATE=115200`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Settings = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCALE_DAQ_").split("__"))
            .extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        crate::logging::parse_log_level(&self.application.log_level)?;

        let acq = &self.acquisition;
        if !(acq.sample_rate_hz.is_finite() && acq.sample_rate_hz > 0.0) {
            return Err(DaqError::InvalidSampleRate(acq.sample_rate_hz));
        }
        if acq.poll_interval_ms == 0 || acq.discovery_interval_ms == 0 {
            return Err(DaqError::Configuration(
                "poll_interval_ms and discovery_interval_ms must be non-zero".to_string(),
            ));
        }
        if acq.series_capacity == 0 {
            return Err(DaqError::Configuration(
                "series_capacity must be non-zero".to_string(),
            ));
        }
        if !(acq.display_average_window_secs.is_finite() && acq.display_average_window_secs >= 0.0)
        {
            return Err(DaqError::Configuration(format!(
                "Invalid display_average_window_secs {}",
                acq.display_average_window_secs
            )));
        }

        if self.serial.baud_rate == 0 {
            return Err(DaqError::Configuration("baud_rate must be non-zero".into()));
        }
        // CRLF alone needs two bytes
        if self.serial.max_packet_size < 3 || self.wireless.max_packet_size < 3 {
            return Err(DaqError::Configuration(
                "max_packet_size must be at least 3 bytes".to_string(),
            ));
        }
        if self.serial.buffer_capacity == 0 || self.wireless.buffer_capacity == 0 {
            return Err(DaqError::Configuration(
                "buffer_capacity must be non-zero".to_string(),
            ));
        }
        if self.serial.read_timeout_ms == 0 || self.wireless.read_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "read_timeout_ms must be non-zero".to_string(),
            ));
        }

        let syn = &self.synthetic;
        if !(syn.sample_rate_hz.is_finite() && syn.sample_rate_hz > 0.0) {
            return Err(DaqError::InvalidSampleRate(syn.sample_rate_hz));
        }
        if !(syn.noise_std_dev.is_finite() && syn.noise_std_dev >= 0.0) {
            return Err(DaqError::Configuration(format!(
                "Invalid noise_std_dev {}",
                syn.noise_std_dev
            )));
        }

        Ok(())
    }
}
