//! The canonical reconciled series.
//!
//! A capped ring of `(time, value)` points kept in strictly increasing time
//! order. When full, pushing evicts the oldest point.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// One gridded point of the series.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    /// Grid time in seconds
    pub time: f64,
    /// Averaged raw value
    pub value: f64,
}

impl SeriesPoint {
    /// Create a point.
    pub fn new(time: f64, value: f64) -> Self {
        Self { time, value }
    }
}

/// Bounded, time-ordered sequence of [`SeriesPoint`]s.
#[derive(Debug, Clone)]
pub struct Series {
    points: VecDeque<SeriesPoint>,
    capacity: usize,
}

impl Series {
    /// Empty series retaining at most `capacity` points (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            points: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a point, returning the evicted oldest point if the series was full.
    ///
    /// Callers keep times increasing; the reconciler never pushes a time at or
    /// before the current last point.
    pub fn push(&mut self, point: SeriesPoint) -> Option<SeriesPoint> {
        let evicted = if self.points.len() >= self.capacity {
            self.points.pop_front()
        } else {
            None
        };
        self.points.push_back(point);
        evicted
    }

    /// Most recent point.
    pub fn last(&self) -> Option<SeriesPoint> {
        self.points.back().copied()
    }

    /// Oldest retained point.
    pub fn first(&self) -> Option<SeriesPoint> {
        self.points.front().copied()
    }

    /// Overwrite the most recent point. Returns `false` on an empty series.
    pub fn replace_last(&mut self, point: SeriesPoint) -> bool {
        match self.points.back_mut() {
            Some(last) => {
                *last = point;
                true
            }
            None => false,
        }
    }

    /// Drop every point.
    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// Number of retained points.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Whether no points are retained.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Maximum number of retained points.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &SeriesPoint> + '_ {
        self.points.iter()
    }

    /// Points with `t0 <= time <= t1`, oldest first.
    pub fn slice(&self, t0: f64, t1: f64) -> Vec<SeriesPoint> {
        if !(t0 <= t1) {
            return Vec::new();
        }
        let start = self.points.partition_point(|p| p.time < t0);
        let end = self.points.partition_point(|p| p.time <= t1);
        self.points.range(start..end).copied().collect()
    }

    /// Points whose time is at or after `since`.
    pub fn since(&self, since: f64) -> impl Iterator<Item = &SeriesPoint> + '_ {
        let start = self.points.partition_point(|p| p.time < since);
        self.points.range(start..)
    }
}
