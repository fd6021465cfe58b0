//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, for the crate. Using the
//! `thiserror` crate, it gives a single consistent way to report failures that are
//! allowed to reach a caller: configuration problems, file I/O, malformed user input
//! such as an unknown unit name.
//!
//! ## What is *not* an error
//!
//! Faults inside an acquisition loop (a garbled line, a port that vanished, a socket
//! that timed out) never become a `DaqError`. They are logged where they happen and
//! the only thing a caller observes is `ReadingSource::is_open()` turning `false`.
//! Likewise a degenerate calibration is not an error: it is simply a missing fit.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors surfaced by the public API.
#[derive(Error, Debug)]
pub enum DaqError {
    /// Parsing or merging the layered configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// The configuration parsed but holds a value that makes no sense.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or device I/O outside an acquisition loop.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Writing a delimited file failed.
    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// A unit name outside the conversion table.
    #[error("Unknown units '{0}'. Must be one of: N, kg, lbs")]
    UnknownUnits(String),

    /// Sample rates must be positive and finite.
    #[error("Invalid sample rate {0} Hz: must be positive and finite")]
    InvalidSampleRate(f64),

    /// No tracked source has the requested key.
    #[error("No reading source with key '{0}'")]
    SourceNotFound(String),

    /// Functionality compiled out via cargo features.
    #[error("Feature '{0}' is not enabled. Please build with --features {0}")]
    FeatureNotEnabled(String),
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}
