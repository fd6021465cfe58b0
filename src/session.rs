//! Consumer-side state of one acquisition session.
//!
//! [`ScaleSession`] owns everything that is mutated only by the polling side:
//! the reconciled [`Series`], the [`Reconciler`] that feeds it, the
//! [`Calibration`] and the active display units. Display code listens to
//! [`SessionEvent`]s (series changes) and [`CalibrationEvent`]s (point and fit
//! changes) instead of reaching into the state.

use crate::calibration::{Calibration, CalibrationEvent, CalibrationPoint, LinearFit, Units};
use crate::config::AcquisitionConfig;
use crate::data::recording;
use crate::data::{MergeOutcome, Reconciler, Series, SeriesPoint};
use crate::error::AppResult;
use crate::hardware::Reading;
use std::path::Path;
use tokio::sync::broadcast;
use tracing::info;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Series changes for display listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A new point was appended
    ReadingAdded(SeriesPoint),
    /// The last point absorbed more samples
    LastReadingUpdated(SeriesPoint),
    /// The series was emptied
    Cleared,
}

/// Series, reconciliation, calibration and units for one scale session.
#[derive(Debug)]
pub struct ScaleSession {
    series: Series,
    reconciler: Reconciler,
    calibration: Calibration,
    units: Units,
    average_window: f64,
    events: broadcast::Sender<SessionEvent>,
}

impl ScaleSession {
    /// Empty session gridded at the configured sample rate.
    pub fn new(config: &AcquisitionConfig) -> AppResult<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self {
            series: Series::new(config.series_capacity),
            reconciler: Reconciler::new(config.sample_rate_hz)?,
            calibration: Calibration::new(),
            units: Units::Newtons,
            average_window: config.display_average_window_secs,
            events,
        })
    }

    /// Subscribe to series changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Subscribe to calibration point and fit changes.
    pub fn subscribe_calibration(&self) -> broadcast::Receiver<CalibrationEvent> {
        self.calibration.subscribe()
    }

    // -------------------------------------------------------------------------
    // Series
    // -------------------------------------------------------------------------

    /// Reconcile a drained batch into the series.
    pub fn add_readings(&mut self, readings: &[Reading]) -> MergeOutcome {
        let outcome = self.reconciler.merge_readings(&mut self.series, readings);
        self.publish(&outcome);
        outcome
    }

    /// Reconcile a single sample into the series.
    pub fn add_reading(&mut self, time: f64, value: f64) -> MergeOutcome {
        let outcome = self
            .reconciler
            .merge_samples(&mut self.series, [(time, value)]);
        self.publish(&outcome);
        outcome
    }

    fn publish(&self, outcome: &MergeOutcome) {
        // No listeners is fine
        if let Some(point) = outcome.updated_last {
            let _ = self.events.send(SessionEvent::LastReadingUpdated(point));
        }
        for point in &outcome.appended {
            let _ = self.events.send(SessionEvent::ReadingAdded(*point));
        }
    }

    /// Empty the series and forget the boundary weight.
    pub fn clear(&mut self) {
        self.series.clear();
        self.reconciler.reset();
        let _ = self.events.send(SessionEvent::Cleared);
    }

    /// The reconciled series.
    pub fn series(&self) -> &Series {
        &self.series
    }

    /// Points with `t0 <= time <= t1`.
    pub fn series_slice(&self, t0: f64, t1: f64) -> Vec<SeriesPoint> {
        self.series.slice(t0, t1)
    }

    /// Current grid rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        self.reconciler.sample_rate()
    }

    /// Change the grid rate; existing points stay where they are.
    pub fn set_sample_rate(&mut self, sample_rate_hz: f64) -> AppResult<()> {
        self.reconciler.set_sample_rate(sample_rate_hz)?;
        info!(sample_rate_hz, "Sample rate changed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Units and calibration
    // -------------------------------------------------------------------------

    /// Units used for display and for new calibration points.
    pub fn units(&self) -> Units {
        self.units
    }

    /// Switch the active units.
    pub fn set_units(&mut self, units: Units) {
        self.units = units;
    }

    /// The calibration set.
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Current fit in canonical units.
    pub fn fit(&self) -> Option<LinearFit> {
        self.calibration.fit()
    }

    /// Add a point whose real value is in the active units.
    pub fn add_calibration_point(&mut self, measured: f64, real: f64) -> bool {
        self.calibration.add_point(measured, real, self.units)
    }

    /// Remove calibration points (real values in Newtons).
    pub fn remove_calibration_points(&mut self, points: &[CalibrationPoint]) -> usize {
        self.calibration.remove_points(points)
    }

    /// Convert a raw value into the active units. `None` without a fit.
    pub fn to_real(&self, measured: f64) -> Option<f64> {
        self.calibration
            .fit()
            .map(|fit| fit.measured_to_real(measured, self.units))
    }

    /// Mean raw value over the trailing display window of the series.
    pub fn current_raw_average(&self) -> Option<f64> {
        let last = self.series.last()?;
        let (sum, count) = self
            .series
            .since(last.time - self.average_window)
            .fold((0.0, 0usize), |(sum, n), p| (sum + p.value, n + 1));
        (count > 0).then(|| sum / count as f64)
    }

    /// Trailing average in the active units, or raw when no fit exists.
    pub fn current_reading(&self) -> Option<f64> {
        let raw = self.current_raw_average()?;
        Some(self.to_real(raw).unwrap_or(raw))
    }

    // -------------------------------------------------------------------------
    // Files
    // -------------------------------------------------------------------------

    /// Replace the series with a recording, re-gridded at the current rate.
    ///
    /// Returns the number of rows read. The series is left untouched when the
    /// file cannot be opened.
    pub fn open_recording(&mut self, path: impl AsRef<Path>) -> AppResult<usize> {
        let rows = recording::load_recording(path)?;
        self.clear();
        let outcome = self
            .reconciler
            .merge_samples(&mut self.series, rows.iter().copied());
        self.publish(&outcome);
        Ok(rows.len())
    }

    /// Save the points with `t0 <= time <= t1`. An empty range writes nothing.
    pub fn save_recording(&self, path: impl AsRef<Path>, t0: f64, t1: f64) -> AppResult<usize> {
        recording::save_recording(path, &self.series.slice(t0, t1))
    }

    /// Save the whole retained series.
    pub fn save_all(&self, path: impl AsRef<Path>) -> AppResult<usize> {
        let points: Vec<SeriesPoint> = self.series.iter().copied().collect();
        recording::save_recording(path, &points)
    }

    /// Replace the calibration with the points in a file.
    pub fn open_calibration(&mut self, path: impl AsRef<Path>) -> AppResult<usize> {
        let pairs = recording::load_calibration(path)?;
        self.calibration
            .replace(Calibration::from_pairs(pairs, Units::Newtons));
        Ok(self.calibration.len())
    }

    /// Save the calibration in canonical units. An empty calibration writes nothing.
    pub fn save_calibration(&self, path: impl AsRef<Path>) -> AppResult<usize> {
        recording::save_calibration(path, &self.calibration.pairs_in(Units::Newtons))
    }
}
