//! Structured logging setup.
//!
//! Everything in the crate logs through `tracing`. This module installs the
//! global `tracing-subscriber` stack for the binary (and for tests that want
//! output):
//! - the level comes from `application.log_level`, unless `RUST_LOG` is set
//! - the layout comes from `application.log_format` (compact, pretty or JSON)
//! - thread names are printed, since every acquisition loop runs on its own
//!   named thread (`serial-/dev/ttyUSB0`, `wireless-...`)
//!
//! # Example
//! ```no_run
//! use scale_daq::{config::Settings, logging};
//! use tracing::info;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::load()?;
//! logging::init_from_settings(&settings)?;
//! info!("Application started");
//! # Ok(())
//! # }
//! ```

use crate::config::Settings;
use crate::error::{AppResult, DaqError};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Console layout of log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One line per event
    #[default]
    Compact,
    /// Multi-line, colored (for development)
    Pretty,
    /// One JSON object per event (for log shippers)
    Json,
}

/// Subscriber options.
#[derive(Debug, Clone)]
pub struct Logging {
    /// Maximum level when `RUST_LOG` is unset
    pub level: Level,
    /// Line layout
    pub format: LogFormat,
    /// Print the emitting thread's name
    pub thread_names: bool,
    /// Print file and line of the call site
    pub source_location: bool,
    /// Color output (ignored for JSON)
    pub ansi: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Compact,
            thread_names: true,
            source_location: false,
            ansi: true,
        }
    }
}

impl Logging {
    /// Options taken from the `[application]` section.
    pub fn from_settings(settings: &Settings) -> AppResult<Self> {
        Ok(Self {
            level: parse_log_level(&settings.application.log_level)?,
            format: settings.application.log_format,
            ..Self::default()
        })
    }

    /// Install as the global subscriber.
    ///
    /// If a global subscriber is already in place (an embedding application,
    /// a test harness) it is left alone and this returns `Ok(())`.
    pub fn install(self) -> AppResult<()> {
        if tracing::dispatcher::has_been_set() {
            return Ok(());
        }
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.as_str().to_lowercase()));

        let base = fmt::layer()
            .with_thread_names(self.thread_names)
            .with_file(self.source_location)
            .with_line_number(self.source_location);
        let layer = match self.format {
            LogFormat::Compact => base.compact().with_ansi(self.ansi).boxed(),
            LogFormat::Pretty => base.pretty().with_ansi(self.ansi).boxed(),
            LogFormat::Json => base.json().with_ansi(false).boxed(),
        };

        match tracing_subscriber::registry()
            .with(layer.with_filter(filter))
            .try_init()
        {
            Ok(()) => Ok(()),
            // Lost the race against another installer between the check and here
            Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
            Err(e) => Err(DaqError::Configuration(format!(
                "Failed to install logging: {}",
                e
            ))),
        }
    }
}

/// Install logging as configured in `settings`.
pub fn init_from_settings(settings: &Settings) -> AppResult<()> {
    Logging::from_settings(settings)?.install()
}

/// Case-insensitive level name to a `tracing` level.
pub fn parse_log_level(level: &str) -> AppResult<Level> {
    level.trim().parse::<Level>().map_err(|_| {
        DaqError::Configuration(format!(
            "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
            level
        ))
    })
}
