//! Gaussian-noise scale for running without hardware.
//!
//! No thread is involved: each `read()` fabricates the samples that would have
//! arrived at `sample_rate_hz` between the previous read and now.

use super::discovery::{Backend, BackendKind, Candidate};
use super::worker::SourceState;
use super::{now_secs, Reading, ReadingSource};
use crate::config::SyntheticConfig;
use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use std::fmt;
use std::sync::Arc;

/// Key of the single synthetic source.
pub const SYNTHETIC_KEY: &str = "synthetic";

struct Generator {
    rng: ChaCha8Rng,
    last: f64,
    state: SourceState,
}

/// Scale producing normally distributed integer noise.
pub struct SyntheticScale {
    period: f64,
    std_dev: f64,
    inner: Mutex<Generator>,
}

impl fmt::Debug for SyntheticScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyntheticScale")
            .field("period", &self.period)
            .field("std_dev", &self.std_dev)
            .field("state", &self.inner.lock().state)
            .finish()
    }
}

impl SyntheticScale {
    /// Create a scale from its configuration. A fixed `seed` makes values reproducible.
    pub fn new(config: &SyntheticConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            period: 1.0 / config.sample_rate_hz,
            std_dev: config.noise_std_dev,
            inner: Mutex::new(Generator {
                rng,
                last: 0.0,
                state: SourceState::Idle,
            }),
        }
    }

    /// Samples spaced one period apart from the previous read up to (excluding) `now`.
    ///
    /// Returns nothing while closed.
    pub fn read_until(&self, now: f64) -> Vec<Reading> {
        let mut gen = self.inner.lock();
        if gen.state != SourceState::Running || now <= gen.last {
            return Vec::new();
        }
        let start = gen.last;
        let count = ((now - start) / self.period).ceil() as usize;
        let mut readings = Vec::with_capacity(count);
        for i in 0..count {
            let t = start + i as f64 * self.period;
            if t >= now {
                break;
            }
            let noise = gen.rng.sample::<f64, _>(StandardNormal) * self.std_dev;
            readings.push(Reading::new(t, noise as i64));
        }
        gen.last = now;
        readings
    }

    fn open_at(&self, now: f64) {
        let mut gen = self.inner.lock();
        if gen.state != SourceState::Running {
            gen.last = now;
            gen.state = SourceState::Running;
        }
    }
}

impl ReadingSource for SyntheticScale {
    fn key(&self) -> &str {
        SYNTHETIC_KEY
    }

    fn name(&self) -> String {
        "Synthetic Scale".to_string()
    }

    fn open(&self) {
        self.open_at(now_secs());
    }

    fn is_open(&self) -> bool {
        self.inner.lock().state == SourceState::Running
    }

    fn close(&self) {
        let mut gen = self.inner.lock();
        if gen.state == SourceState::Running {
            gen.state = SourceState::Stopped;
        }
    }

    fn read(&self) -> Vec<Reading> {
        self.read_until(now_secs())
    }

    fn state(&self) -> SourceState {
        self.inner.lock().state
    }
}

/// Always offers exactly one [`SyntheticScale`].
pub struct SyntheticBackend {
    config: SyntheticConfig,
}

impl SyntheticBackend {
    /// Backend for the given generator settings.
    pub fn new(config: SyntheticConfig) -> Self {
        Self { config }
    }
}

impl Backend for SyntheticBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Synthetic
    }

    fn available(&self) -> Vec<Candidate> {
        let config = self.config.clone();
        vec![Candidate::new(SYNTHETIC_KEY, move || {
            Arc::new(SyntheticScale::new(&config)) as Arc<dyn ReadingSource>
        })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> SyntheticScale {
        SyntheticScale::new(&SyntheticConfig {
            seed: Some(seed),
            ..SyntheticConfig::default()
        })
    }

    #[test]
    fn closed_scale_produces_nothing() {
        let scale = seeded(1);
        assert!(scale.read_until(1_000.0).is_empty());
        scale.close();
        scale.close();
        assert_eq!(scale.state(), SourceState::Idle);
    }

    #[test]
    fn samples_follow_the_period() {
        let scale = seeded(7);
        scale.open_at(100.0);
        // 80 Hz over one second
        let readings = scale.read_until(101.0);
        assert_eq!(readings.len(), 80);
        assert_eq!(readings[0].timestamp, 100.0);
        for pair in readings.windows(2) {
            let dt = pair[1].timestamp - pair[0].timestamp;
            assert!((dt - 1.0 / 80.0).abs() < 1e-9);
        }
        assert!(readings.iter().all(|r| r.timestamp < 101.0));

        // the next read starts where the previous one stopped
        let next = scale.read_until(101.5);
        assert_eq!(next[0].timestamp, 101.0);
        assert_eq!(next.len(), 40);
    }

    #[test]
    fn same_seed_same_values() {
        let a = seeded(42);
        let b = seeded(42);
        a.open_at(0.0);
        b.open_at(0.0);
        assert_eq!(a.read_until(2.0), b.read_until(2.0));
    }

    #[test]
    fn noise_has_expected_spread() {
        let scale = seeded(3);
        scale.open_at(0.0);
        let values: Vec<f64> = scale
            .read_until(500.0)
            .iter()
            .map(|r| r.value as f64)
            .collect();
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        assert!(mean.abs() < 5.0, "mean {}", mean);
        assert!((var.sqrt() - 100.0).abs() < 5.0, "std dev {}", var.sqrt());
    }

    #[test]
    fn reopen_after_close() {
        let scale = seeded(5);
        scale.open_at(10.0);
        scale.close();
        assert_eq!(scale.state(), SourceState::Stopped);
        assert!(scale.read_until(11.0).is_empty());
        scale.open_at(20.0);
        assert!(scale.is_open());
        assert_eq!(scale.read_until(20.5).len(), 40);
    }

    #[test]
    fn backend_offers_one_source() {
        let backend = SyntheticBackend::new(SyntheticConfig::default());
        let candidates = backend.available();
        assert_eq!(candidates.len(), 1);
        let source = candidates.into_iter().next().unwrap().build();
        assert_eq!(source.key(), SYNTHETIC_KEY);
        assert_eq!(source.name(), "Synthetic Scale");
    }
}
