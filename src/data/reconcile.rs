//! Fixed-interval reconciliation of irregular readings.
//!
//! Scales deliver samples whenever they like; the series has to be evenly
//! spaced. Each drained batch is first snapped onto the sample grid and
//! averaged per grid cell ([`downsample`]), then stitched onto the tail of the
//! series by [`Reconciler::merge_samples`].
//!
//! A grid cell regularly straddles two polls: half its samples arrive in one
//! batch and half in the next. Rather than appending that cell twice, the first
//! bucket of a batch that lands within one interval of the last series point is
//! folded into it with a running average weighted by how many raw samples each
//! side holds.
//!
//! ```
//! use scale_daq::data::reconcile::downsample;
//!
//! let buckets = downsample([(1.0, 4.0), (3.0, 6.0), (4.0, 8.0)], 5.0);
//! assert_eq!(buckets[0].time, 0.0);
//! assert_eq!(buckets[1].value, 7.0);
//! assert_eq!(buckets[1].count, 2);
//! ```

use super::series::{Series, SeriesPoint};
use crate::error::{AppResult, DaqError};
use crate::hardware::Reading;
use std::collections::BTreeMap;
use tracing::debug;

/// Fraction of a grid cell treated as float noise when comparing grid times.
///
/// Neighbouring grid points at epoch-scale timestamps can sit a few ULPs closer
/// than one interval apart; they must still count as separate cells.
const CELL_SLACK: f64 = 1e-3;

/// Grid cell of a batch: snapped time, mean value and sample count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bucket {
    /// Grid time (`k * interval`)
    pub time: f64,
    /// Mean of the values in the cell
    pub value: f64,
    /// Raw samples in the cell
    pub count: usize,
}

/// Index of the grid line nearest to `t` (ties away from zero).
pub fn grid_index(t: f64, interval: f64) -> i64 {
    (t / interval).round() as i64
}

/// Nearest multiple of `interval`. Snapping a snapped time returns it unchanged.
pub fn snap_to_grid(t: f64, interval: f64) -> f64 {
    grid_index(t, interval) as f64 * interval
}

/// Group `(time, value)` samples by grid cell and average each cell.
///
/// Buckets come back sorted by time. Samples with a non-finite time or value
/// are ignored.
pub fn downsample<I>(samples: I, interval: f64) -> Vec<Bucket>
where
    I: IntoIterator<Item = (f64, f64)>,
{
    let mut cells: BTreeMap<i64, (f64, usize)> = BTreeMap::new();
    for (t, v) in samples {
        if !t.is_finite() || !v.is_finite() {
            continue;
        }
        let cell = cells.entry(grid_index(t, interval)).or_insert((0.0, 0));
        cell.0 += v;
        cell.1 += 1;
    }
    cells
        .into_iter()
        .map(|(k, (sum, count))| Bucket {
            time: k as f64 * interval,
            value: sum / count as f64,
            count,
        })
        .collect()
}

/// Changes a merge made to the series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergeOutcome {
    /// New value of the last point when the first bucket was folded into it
    pub updated_last: Option<SeriesPoint>,
    /// Points appended after it
    pub appended: Vec<SeriesPoint>,
}

impl MergeOutcome {
    /// Whether the series was left untouched.
    pub fn is_empty(&self) -> bool {
        self.updated_last.is_none() && self.appended.is_empty()
    }
}

/// Stateful merger of batches into a [`Series`].
#[derive(Debug, Clone)]
pub struct Reconciler {
    interval: f64,
    /// Raw samples already averaged into the series' last point
    num_samples_last_reading: usize,
}

impl Reconciler {
    /// Reconciler gridding at `sample_rate_hz`.
    pub fn new(sample_rate_hz: f64) -> AppResult<Self> {
        Ok(Self {
            interval: interval_for(sample_rate_hz)?,
            num_samples_last_reading: 0,
        })
    }

    /// Current grid interval in seconds.
    pub fn sample_interval(&self) -> f64 {
        self.interval
    }

    /// Current grid rate in Hz.
    pub fn sample_rate(&self) -> f64 {
        1.0 / self.interval
    }

    /// Change the grid rate. Only later merges are affected.
    pub fn set_sample_rate(&mut self, sample_rate_hz: f64) -> AppResult<()> {
        self.interval = interval_for(sample_rate_hz)?;
        Ok(())
    }

    /// Raw-sample weight of the series' last point.
    pub fn num_samples_last_reading(&self) -> usize {
        self.num_samples_last_reading
    }

    /// Forget the boundary weight (after the series is cleared).
    pub fn reset(&mut self) {
        self.num_samples_last_reading = 0;
    }

    /// Merge drained readings, in arrival order.
    pub fn merge_readings(&mut self, series: &mut Series, readings: &[Reading]) -> MergeOutcome {
        self.merge_samples(
            series,
            readings.iter().map(|r| (r.timestamp, r.value as f64)),
        )
    }

    /// Grid a batch and stitch it onto the end of `series`.
    ///
    /// An empty batch is a no-op. Buckets that would land at or before the
    /// series' last point without merging are discarded so times stay strictly
    /// increasing.
    pub fn merge_samples<I>(&mut self, series: &mut Series, samples: I) -> MergeOutcome
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let buckets = downsample(samples, self.interval);
        let mut outcome = MergeOutcome::default();
        let Some(first) = buckets.first().copied() else {
            return outcome;
        };

        let mut rest = buckets.as_slice();
        if let Some(last) = series.last() {
            let gap_cells = (first.time - last.time).abs() / self.interval;
            if gap_cells < 1.0 - CELL_SLACK {
                let nslr = self.num_samples_last_reading as f64;
                let n0 = first.count as f64;
                let merged = SeriesPoint::new(
                    first.time.max(last.time),
                    (last.value * nslr + first.value * n0) / (nslr + n0),
                );
                series.replace_last(merged);
                outcome.updated_last = Some(merged);
                self.num_samples_last_reading += first.count;
                rest = &buckets[1..];
            }
        }

        for bucket in rest {
            if let Some(last) = series.last() {
                if bucket.time <= last.time {
                    debug!(
                        time = bucket.time,
                        last = last.time,
                        "Discarded bucket older than the series tail"
                    );
                    continue;
                }
            }
            let point = SeriesPoint::new(bucket.time, bucket.value);
            series.push(point);
            outcome.appended.push(point);
            self.num_samples_last_reading = bucket.count;
        }
        outcome
    }
}

fn interval_for(sample_rate_hz: f64) -> AppResult<f64> {
    if sample_rate_hz.is_finite() && sample_rate_hz > 0.0 {
        Ok(1.0 / sample_rate_hz)
    } else {
        Err(DaqError::InvalidSampleRate(sample_rate_hz))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn downsample_example() {
        let buckets = downsample([(1.0, 4.0), (3.0, 6.0), (4.0, 8.0)], 5.0);
        assert_eq!(
            buckets,
            vec![
                Bucket { time: 0.0, value: 4.0, count: 1 },
                Bucket { time: 5.0, value: 7.0, count: 2 },
            ]
        );
    }

    #[test]
    fn ties_round_away_from_zero() {
        assert_eq!(grid_index(2.5, 5.0), 1);
        assert_eq!(grid_index(-2.5, 5.0), -1);
        assert_eq!(snap_to_grid(7.4, 5.0), 5.0);
    }

    #[test]
    fn snapping_is_idempotent() {
        let interval = 0.1;
        for i in 0..1000 {
            let t = 1_700_000_000.0 + i as f64 * 0.0137;
            let once = snap_to_grid(t, interval);
            assert_eq!(snap_to_grid(once, interval), once);
        }
    }

    #[test]
    fn identical_timestamps_share_a_bucket() {
        let buckets = downsample([(2.0, 1.0), (2.0, 3.0), (2.0, 5.0)], 1.0);
        assert_eq!(buckets, vec![Bucket { time: 2.0, value: 3.0, count: 3 }]);
    }

    #[test]
    fn non_finite_samples_are_ignored() {
        let buckets = downsample([(f64::NAN, 1.0), (1.0, f64::INFINITY), (1.0, 2.0)], 1.0);
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].count, 1);
    }

    #[test]
    fn boundary_merge_example() {
        let mut reconciler = Reconciler::new(0.2).unwrap();
        let mut series = Series::new(100);

        // (4.0, 10) and (6.0, 10) both snap to 5.0: last point (5.0, 10.0), weight 2
        reconciler.merge_samples(&mut series, [(4.0, 10.0), (6.0, 10.0)]);
        assert_eq!(series.last(), Some(SeriesPoint::new(5.0, 10.0)));
        assert_eq!(reconciler.num_samples_last_reading(), 2);

        let outcome =
            reconciler.merge_samples(&mut series, [(5.0, 20.0), (5.5, 20.0), (4.6, 20.0)]);
        assert_eq!(outcome.updated_last, Some(SeriesPoint::new(5.0, 16.0)));
        assert!(outcome.appended.is_empty());
        assert_eq!(series.len(), 1);
        assert_eq!(reconciler.num_samples_last_reading(), 5);
    }

    #[test]
    fn merge_then_append_tracks_last_bucket_weight() {
        let mut reconciler = Reconciler::new(1.0).unwrap();
        let mut series = Series::new(100);
        reconciler.merge_samples(&mut series, [(0.9, 1.0), (1.1, 3.0)]);
        assert_eq!(series.last(), Some(SeriesPoint::new(1.0, 2.0)));

        let outcome = reconciler.merge_samples(
            &mut series,
            [(1.2, 5.0), (2.0, 7.0), (3.1, 8.0), (2.9, 10.0)],
        );
        // (2 * 2 + 5 * 1) / 3
        let updated = outcome.updated_last.unwrap();
        assert_eq!(updated.time, 1.0);
        assert!(approx(updated.value, 3.0));
        assert_eq!(
            outcome.appended,
            vec![SeriesPoint::new(2.0, 7.0), SeriesPoint::new(3.0, 9.0)]
        );
        assert_eq!(reconciler.num_samples_last_reading(), 2);
    }

    #[test]
    fn gap_of_one_interval_appends() {
        let mut reconciler = Reconciler::new(1.0).unwrap();
        let mut series = Series::new(100);
        reconciler.merge_samples(&mut series, [(1.0, 1.0)]);
        let outcome = reconciler.merge_samples(&mut series, [(2.0, 2.0)]);
        assert!(outcome.updated_last.is_none());
        assert_eq!(outcome.appended, vec![SeriesPoint::new(2.0, 2.0)]);
        assert_eq!(series.len(), 2);
    }

    #[test]
    fn adjacent_grid_points_never_merge() {
        let mut reconciler = Reconciler::new(10.0).unwrap();
        let mut series = Series::new(100);
        for i in 0..50 {
            reconciler.merge_samples(&mut series, [(i as f64 * 0.1, 1.0)]);
        }
        assert_eq!(series.len(), 50);
    }

    #[test]
    fn empty_batch_is_noop() {
        let mut reconciler = Reconciler::new(10.0).unwrap();
        let mut series = Series::new(100);
        reconciler.merge_samples(&mut series, [(1.0, 1.0), (1.0, 3.0)]);
        let before = series.clone();

        let outcome = reconciler.merge_readings(&mut series, &[]);
        assert!(outcome.is_empty());
        assert_eq!(series.iter().collect::<Vec<_>>(), before.iter().collect::<Vec<_>>());
        assert_eq!(reconciler.num_samples_last_reading(), 2);
    }

    #[test]
    fn stale_batch_does_not_break_ordering() {
        let mut reconciler = Reconciler::new(1.0).unwrap();
        let mut series = Series::new(100);
        reconciler.merge_samples(&mut series, [(10.0, 1.0)]);
        let outcome = reconciler.merge_samples(&mut series, [(3.0, 1.0), (4.0, 1.0)]);
        assert!(outcome.is_empty());
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn irregular_stream_stays_gridded_and_increasing() {
        let mut reconciler = Reconciler::new(10.0).unwrap();
        let interval = reconciler.sample_interval();
        let mut series = Series::new(10_000);

        // 80 Hz-ish jittered source drained in uneven chunks
        let mut t = 1_700_000_000.0;
        let mut batch = Vec::new();
        for i in 0..2_000u64 {
            t += 0.0125 + ((i * 7919) % 13) as f64 * 1e-4;
            batch.push(Reading::new(t, (i % 50) as i64));
            if i % (3 + i % 5) == 0 {
                reconciler.merge_readings(&mut series, &batch);
                batch.clear();
            }
        }
        reconciler.merge_readings(&mut series, &batch);

        let points: Vec<SeriesPoint> = series.iter().copied().collect();
        assert!(points.len() > 100);
        for p in &points {
            let k = (p.time / interval).round();
            assert!((p.time - k * interval).abs() < 1e-6);
        }
        for pair in points.windows(2) {
            assert!(pair[1].time > pair[0].time);
        }
    }

    #[test]
    fn rejects_bad_sample_rates() {
        assert!(matches!(Reconciler::new(0.0), Err(DaqError::InvalidSampleRate(_))));
        assert!(Reconciler::new(-1.0).is_err());
        let mut r = Reconciler::new(10.0).unwrap();
        assert!(r.set_sample_rate(f64::NAN).is_err());
        assert!(approx(r.sample_rate(), 10.0));
        r.set_sample_rate(20.0).unwrap();
        assert!(approx(r.sample_interval(), 0.05));
    }
}
