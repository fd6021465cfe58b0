//! # Scale DAQ Core Library
//!
//! Acquisition of force readings from load-cell scales, reconciliation of the
//! irregular stream into a fixed-interval series, and linear calibration into
//! physical units. The binary (`main.rs`) is a thin headless front end; display
//! layers build on the same library API.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the `ReadingSource` capability, its serial, wireless and
//!   synthetic backends, the bounded hand-off channel and source discovery.
//! - **`data`**: the reconciled `Series`, the `Reconciler` that grids and merges
//!   batches into it, and the recording/calibration file formats.
//! - **`calibration`**: calibration points, the least-squares `LinearFit` and the
//!   unit table.
//! - **`session`**: consumer-side state (series, calibration, units) with change
//!   notifications.
//! - **`app`**: `DaqApp`, which owns the registry and the active source and runs
//!   the poll and discovery timers.
//! - **`config`**: layered configuration loaded with figment. See `config::Settings`.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the crate-wide `DaqError`.

pub mod app;
pub mod calibration;
pub mod config;
pub mod data;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod session;

pub use error::{AppResult, DaqError};
