//! Discovery of reading sources across backends.
//!
//! Each [`Backend`] only reports what it can offer right now as a list of
//! [`Candidate`]s. [`DiscoveryRegistry::poll`] diffs that against the sources it
//! already tracks for the backend: sources that vanished are closed and
//! dropped, new keys are constructed. Identity is the candidate key alone.

use super::{ReadingSource, SourceState};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Which transport a backend enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum BackendKind {
    /// Wired serial ports
    Serial,
    /// Wireless serial links
    Wireless,
    /// Generated noise
    Synthetic,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Serial => write!(f, "serial"),
            BackendKind::Wireless => write!(f, "wireless"),
            BackendKind::Synthetic => write!(f, "synthetic"),
        }
    }
}

type Constructor = Box<dyn FnOnce() -> Arc<dyn ReadingSource> + Send>;

/// A source a backend could provide, not yet constructed.
pub struct Candidate {
    /// Stable identity (port path, device address, ...)
    pub key: String,
    constructor: Constructor,
}

impl Candidate {
    /// Pair a key with the constructor that builds its source.
    pub fn new<F>(key: impl Into<String>, constructor: F) -> Self
    where
        F: FnOnce() -> Arc<dyn ReadingSource> + Send + 'static,
    {
        Self {
            key: key.into(),
            constructor: Box::new(constructor),
        }
    }

    /// Construct the source.
    pub fn build(self) -> Arc<dyn ReadingSource> {
        (self.constructor)()
    }
}

impl fmt::Debug for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Candidate")
            .field("key", &self.key)
            .finish_non_exhaustive()
    }
}

/// Enumeration capability of one transport.
///
/// `available` is called on the discovery cadence and must not block for long;
/// slow enumeration belongs on a background thread.
pub trait Backend: Send + Sync {
    /// Transport this backend enumerates.
    fn kind(&self) -> BackendKind;

    /// Sources that can be offered right now.
    fn available(&self) -> Vec<Candidate>;

    /// Whether tracked sources whose loop has ended should be dropped (and
    /// re-created on the next poll if still available).
    fn drops_stopped_sources(&self) -> bool {
        false
    }

    /// Baud rate for sources constructed from now on.
    fn set_baud_rate(&self, _baud_rate: u32) {}
}

/// Keys that appeared and vanished during one poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryChanges {
    /// Newly constructed sources
    pub added: Vec<String>,
    /// Closed and dropped sources
    pub removed: Vec<String>,
}

impl DiscoveryChanges {
    /// Whether the live set stayed the same.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

struct Tracked {
    backend: Box<dyn Backend>,
    sources: BTreeMap<String, Arc<dyn ReadingSource>>,
}

/// The single owned set of live sources, grouped by backend.
#[derive(Default)]
pub struct DiscoveryRegistry {
    tracked: Vec<Tracked>,
}

impl fmt::Debug for DiscoveryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for t in &self.tracked {
            map.entry(&t.backend.kind(), &t.sources.keys().collect::<Vec<_>>());
        }
        map.finish()
    }
}

impl DiscoveryRegistry {
    /// Registry with no backends.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a backend; it is polled in registration order.
    pub fn register(&mut self, backend: Box<dyn Backend>) {
        info!(backend = %backend.kind(), "Registered discovery backend");
        self.tracked.push(Tracked {
            backend,
            sources: BTreeMap::new(),
        });
    }

    /// Reconcile every backend's tracked sources with what it offers now.
    pub fn poll(&mut self) -> DiscoveryChanges {
        let mut changes = DiscoveryChanges::default();

        for tracked in &mut self.tracked {
            let kind = tracked.backend.kind();

            if tracked.backend.drops_stopped_sources() {
                let stopped: Vec<String> = tracked
                    .sources
                    .iter()
                    .filter(|(_, s)| s.state() == SourceState::Stopped)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in stopped {
                    if let Some(source) = tracked.sources.remove(&key) {
                        source.close();
                        debug!(backend = %kind, %key, "Pruned stopped source");
                        changes.removed.push(key);
                    }
                }
            }

            let mut available: HashMap<String, Candidate> = HashMap::new();
            for candidate in tracked.backend.available() {
                available.entry(candidate.key.clone()).or_insert(candidate);
            }

            let gone: Vec<String> = tracked
                .sources
                .keys()
                .filter(|k| !available.contains_key(*k))
                .cloned()
                .collect();
            for key in gone {
                if let Some(source) = tracked.sources.remove(&key) {
                    source.close();
                    debug!(backend = %kind, %key, "Source no longer available");
                    changes.removed.push(key);
                }
            }

            let mut fresh: Vec<Candidate> = available
                .into_values()
                .filter(|c| !tracked.sources.contains_key(&c.key))
                .collect();
            fresh.sort_by(|a, b| a.key.cmp(&b.key));
            for candidate in fresh {
                let key = candidate.key.clone();
                tracked.sources.insert(key.clone(), candidate.build());
                debug!(backend = %kind, %key, "Source discovered");
                changes.added.push(key);
            }
        }

        if !changes.is_empty() {
            info!(
                added = changes.added.len(),
                removed = changes.removed.len(),
                "Available sources changed"
            );
        }
        changes
    }

    /// Every tracked source, grouped by backend, ordered by key within one.
    pub fn sources(&self) -> Vec<Arc<dyn ReadingSource>> {
        self.tracked
            .iter()
            .flat_map(|t| t.sources.values().cloned())
            .collect()
    }

    /// Every tracked source tagged with its backend.
    pub fn sources_by_kind(&self) -> Vec<(BackendKind, Arc<dyn ReadingSource>)> {
        self.tracked
            .iter()
            .flat_map(|t| {
                let kind = t.backend.kind();
                t.sources.values().map(move |s| (kind, Arc::clone(s)))
            })
            .collect()
    }

    /// Look a source up by key.
    pub fn get(&self, key: &str) -> Option<Arc<dyn ReadingSource>> {
        self.tracked
            .iter()
            .find_map(|t| t.sources.get(key).cloned())
    }

    /// Number of tracked sources.
    pub fn len(&self) -> usize {
        self.tracked.iter().map(|t| t.sources.len()).sum()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a baud rate to every backend and every tracked source.
    pub fn set_baud_rate(&self, baud_rate: u32) {
        for tracked in &self.tracked {
            tracked.backend.set_baud_rate(baud_rate);
            for source in tracked.sources.values() {
                source.set_baud_rate(baud_rate);
            }
        }
    }

    /// Close and drop every tracked source.
    pub fn close_all(&mut self) {
        for tracked in &mut self.tracked {
            for (_, source) in std::mem::take(&mut tracked.sources) {
                source.close();
            }
        }
    }
}
