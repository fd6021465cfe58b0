//! Linear calibration from raw scale counts to physical force.
//!
//! A [`Calibration`] is a de-duplicated set of [`CalibrationPoint`]s, each pairing
//! a measured raw value with a known real value. Real values are always stored in
//! the canonical unit (Newtons); points entered in other units are converted on
//! the way in.
//!
//! Whenever the point set changes the least-squares [`LinearFit`] is recomputed
//! synchronously. The fit is purely derived: it is `None` with fewer than two
//! points, or when the points cannot define a line (all measured values equal,
//! non-finite input).
//!
//! ```text
//! real_N = slope * measured + intercept
//! ```
//!
//! Listeners subscribe to [`CalibrationEvent`]s to learn about changes.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::sync::broadcast;

/// Capacity of the calibration notification channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Units
// =============================================================================

/// Closed table of force units. Factors are relative to one Newton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Units {
    /// Newtons (canonical)
    #[default]
    #[serde(rename = "N")]
    Newtons,
    /// Kilograms-force
    #[serde(rename = "kg")]
    Kilograms,
    /// Pounds-force
    #[serde(rename = "lbs")]
    Pounds,
}

impl Units {
    /// Every unit in the table.
    pub const ALL: [Units; 3] = [Units::Newtons, Units::Kilograms, Units::Pounds];

    /// How many of this unit make up one Newton.
    pub fn per_newton(self) -> f64 {
        // 1N = .1019kg = .2248lbs
        match self {
            Units::Newtons => 1.0,
            Units::Kilograms => 0.101971621298,
            Units::Pounds => 0.2248089431,
        }
    }

    /// Short symbol, as used in files and on the command line.
    pub fn symbol(self) -> &'static str {
        match self {
            Units::Newtons => "N",
            Units::Kilograms => "kg",
            Units::Pounds => "lbs",
        }
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Units {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "N" | "n" => Ok(Units::Newtons),
            "kg" | "KG" | "Kg" => Ok(Units::Kilograms),
            "lbs" | "lb" | "LBS" => Ok(Units::Pounds),
            other => Err(DaqError::UnknownUnits(other.to_string())),
        }
    }
}

/// Convert `value` expressed in `from` into `to`.
pub fn convert_between(value: f64, from: Units, to: Units) -> f64 {
    value * (to.per_newton() / from.per_newton())
}

// =============================================================================
// Points and fit
// =============================================================================

/// One (raw reading, known force) pair. `real` is in Newtons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationPoint {
    /// Raw value reported by the scale
    pub measured: f64,
    /// Known force in Newtons
    pub real: f64,
}

impl CalibrationPoint {
    /// Create a point from a real value given in `units`.
    pub fn new(measured: f64, real: f64, units: Units) -> Self {
        Self {
            measured,
            real: convert_between(real, units, Units::Newtons),
        }
    }
}

/// `real = slope * measured + intercept`, in Newtons.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LinearFit {
    /// Newtons per raw count
    pub slope: f64,
    /// Newtons at a raw reading of zero
    pub intercept: f64,
}

impl LinearFit {
    /// Ordinary least-squares regression of `real` on `measured`.
    ///
    /// Returns `None` for fewer than two points and for any input that cannot
    /// define a finite, non-vertical line.
    pub fn fit(points: &[CalibrationPoint]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }
        let n = points.len() as f64;
        let mean_x = points.iter().map(|p| p.measured).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.real).sum::<f64>() / n;
        if !(mean_x.is_finite() && mean_y.is_finite()) {
            return None;
        }

        let (mut sxx, mut sxy, mut sum_sq) = (0.0, 0.0, 0.0);
        for p in points {
            let dx = p.measured - mean_x;
            sxx += dx * dx;
            sxy += dx * (p.real - mean_y);
            sum_sq += p.measured * p.measured;
        }

        // Rank-deficient: measured values are (numerically) all the same
        if !(sxx.is_finite() && sxx > f64::EPSILON * sum_sq) {
            return None;
        }

        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        if !(slope.is_finite() && intercept.is_finite()) {
            return None;
        }
        Some(Self { slope, intercept })
    }

    /// Raw reading to force in `units`.
    pub fn measured_to_real(&self, measured: f64, units: Units) -> f64 {
        let newtons = self.slope * measured + self.intercept;
        convert_between(newtons, Units::Newtons, units)
    }

    /// Force in `units` back to the raw reading; `None` for a flat fit.
    pub fn real_to_measured(&self, real: f64, units: Units) -> Option<f64> {
        if self.slope == 0.0 {
            return None;
        }
        let newtons = convert_between(real, units, Units::Newtons);
        Some((newtons - self.intercept) / self.slope)
    }

    /// The same line with its output expressed in `units`.
    pub fn in_units(&self, units: Units) -> Self {
        Self {
            slope: convert_between(self.slope, Units::Newtons, units),
            intercept: convert_between(self.intercept, Units::Newtons, units),
        }
    }
}

impl fmt::Display for LinearFit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.intercept >= 0.0 { '+' } else { '-' };
        write!(
            f,
            "{} x {} {}",
            significant(self.slope, 3),
            sign,
            significant(self.intercept.abs(), 3)
        )
    }
}

/// `value` rounded to `digits` significant digits. Fixed-point output keeps at
/// least one decimal; magnitudes below 1e-4 or at or above `10^(digits-1)`
/// switch to exponent form (`1.23e+03`).
fn significant(value: f64, digits: usize) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{:.1}", value);
    }
    let digits = digits.max(1);
    let sci = format!("{:.*e}", digits - 1, value);
    let Some((mantissa, exponent)) = sci.split_once('e') else {
        return sci;
    };
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if exponent < -4 || exponent >= digits as i32 - 1 {
        let mantissa = if mantissa.contains('.') {
            mantissa.trim_end_matches('0').trim_end_matches('.')
        } else {
            mantissa
        };
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", mantissa, sign, exponent.abs())
    } else {
        // exponent < digits - 1 here, so at least one decimal is printed
        let decimals = (digits as i32 - 1 - exponent) as usize;
        let fixed = format!("{:.*}", decimals, value);
        let trimmed = fixed.trim_end_matches('0');
        if trimmed.ends_with('.') {
            format!("{}0", trimmed)
        } else {
            trimmed.to_string()
        }
    }
}

// =============================================================================
// Calibration set
// =============================================================================

/// Change notifications for display listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibrationEvent {
    /// The point set changed; carries the full new set.
    PointsChanged(Vec<CalibrationPoint>),
    /// The derived fit changed (possibly to `None`).
    FitChanged(Option<LinearFit>),
}

/// De-duplicated calibration points plus their derived fit.
#[derive(Debug)]
pub struct Calibration {
    points: Vec<CalibrationPoint>,
    fit: Option<LinearFit>,
    events: broadcast::Sender<CalibrationEvent>,
}

impl Default for Calibration {
    fn default() -> Self {
        Self::new()
    }
}

impl Calibration {
    /// An empty calibration with no fit.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            points: Vec::new(),
            fit: None,
            events,
        }
    }

    /// Build from `(measured, real)` pairs given in `units`.
    pub fn from_pairs<I>(pairs: I, units: Units) -> Self
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut cal = Self::new();
        for (measured, real) in pairs {
            let point = CalibrationPoint::new(measured, real, units);
            if !cal.points.contains(&point) {
                cal.points.push(point);
            }
        }
        cal.fit = LinearFit::fit(&cal.points);
        cal
    }

    /// Subscribe to point and fit changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CalibrationEvent> {
        self.events.subscribe()
    }

    /// Points in insertion order, real values in Newtons.
    pub fn points(&self) -> &[CalibrationPoint] {
        &self.points
    }

    /// Current fit, if the points define one.
    pub fn fit(&self) -> Option<LinearFit> {
        self.fit
    }

    /// Whether a fit is available.
    pub fn has_fit(&self) -> bool {
        self.fit.is_some()
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// True when no points are present.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Add a point whose real value is given in `units`.
    ///
    /// Returns `false` (and emits nothing) if an identical point exists.
    pub fn add_point(&mut self, measured: f64, real: f64, units: Units) -> bool {
        let point = CalibrationPoint::new(measured, real, units);
        if self.points.contains(&point) {
            return false;
        }
        self.points.push(point);
        self.refit();
        true
    }

    /// Remove a point (real value in Newtons). Unknown points are ignored.
    pub fn remove_point(&mut self, point: &CalibrationPoint) -> bool {
        let before = self.points.len();
        self.points.retain(|p| p != point);
        if self.points.len() == before {
            return false;
        }
        self.refit();
        true
    }

    /// Remove several points, refitting once. Returns how many were removed.
    pub fn remove_points(&mut self, points: &[CalibrationPoint]) -> usize {
        let before = self.points.len();
        self.points.retain(|p| !points.contains(p));
        let removed = before - self.points.len();
        if removed > 0 {
            self.refit();
        }
        removed
    }

    /// Replace the whole point set (e.g. after loading a file).
    pub fn replace(&mut self, other: Calibration) {
        self.points = other.points;
        self.refit();
    }

    /// Points re-expressed in `units`, as `(measured, real)` pairs.
    pub fn pairs_in(&self, units: Units) -> Vec<(f64, f64)> {
        self.points
            .iter()
            .map(|p| (p.measured, convert_between(p.real, Units::Newtons, units)))
            .collect()
    }

    fn refit(&mut self) {
        let old_fit = self.fit;
        self.fit = LinearFit::fit(&self.points);
        // Nobody listening is fine
        let _ = self
            .events
            .send(CalibrationEvent::PointsChanged(self.points.clone()));
        if self.fit != old_fit {
            let _ = self.events.send(CalibrationEvent::FitChanged(self.fit));
        }
    }
}

impl fmt::Display for Calibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.fit {
            Some(fit) => write!(f, "{} calibration for {} points", fit, self.points.len()),
            None => write!(f, "Unfit calibration for {} points", self.points.len()),
        }
    }
}
