//! The core application state and logic.
//!
//! [`DaqApp`] wires the pieces together: a [`DiscoveryRegistry`] built from the
//! settings, at most one active [`ReadingSource`], and the [`ScaleSession`]
//! that reconciles what the active source delivers. [`DaqApp::run`] drives the
//! two timers: a fast poll that drains the active source and a slow discovery
//! tick that refreshes the available sources.
use crate::{
    config::Settings,
    error::{AppResult, DaqError},
    hardware::{
        DiscoveryChanges, DiscoveryRegistry, ReadingSource, SyntheticBackend, WirelessBackend,
    },
    session::ScaleSession,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::{
    sync::broadcast,
    time::{self, MissedTickBehavior},
};
use tracing::{info, warn};

/// How often the current reading is logged while running.
const STATUS_INTERVAL: Duration = Duration::from_secs(1);

/// Source-level notifications for display listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// The set of available sources changed
    SourcesChanged(DiscoveryChanges),
    /// A source was selected, or the selection cleared
    SourceSelected(Option<String>),
    /// The active source's acquisition loop ended
    SourceDisconnected(String),
}

/// The main application struct that holds all state.
pub struct DaqApp {
    settings: Settings,
    registry: DiscoveryRegistry,
    active: Option<Arc<dyn ReadingSource>>,
    disconnect_reported: bool,
    session: ScaleSession,
    baud_rate: u32,
    events: broadcast::Sender<AppEvent>,
}

impl DaqApp {
    /// Creates a new `DaqApp` with the backends enabled in `settings`.
    pub fn new(settings: Settings) -> AppResult<Self> {
        let registry = Self::build_registry(&settings);
        Self::with_registry(settings, registry)
    }

    /// Creates a new `DaqApp` around an existing registry.
    pub fn with_registry(settings: Settings, registry: DiscoveryRegistry) -> AppResult<Self> {
        let session = ScaleSession::new(&settings.acquisition)?;
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            baud_rate: settings.serial.baud_rate,
            settings,
            registry,
            active: None,
            disconnect_reported: false,
            session,
            events,
        })
    }

    /// Registry with one backend per enabled transport.
    pub fn build_registry(settings: &Settings) -> DiscoveryRegistry {
        let mut registry = DiscoveryRegistry::new();
        if settings.serial.enabled {
            #[cfg(feature = "instrument_serial")]
            registry.register(Box::new(crate::hardware::SerialBackend::new(
                settings.serial.clone(),
            )));
            #[cfg(not(feature = "instrument_serial"))]
            warn!("Serial scales requested but the instrument_serial feature is disabled");
        }
        if settings.wireless.enabled {
            registry.register(Box::new(WirelessBackend::new(settings.wireless.clone())));
        }
        if settings.synthetic.enabled {
            registry.register(Box::new(SyntheticBackend::new(settings.synthetic.clone())));
        }
        registry
    }

    /// The loaded settings.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Subscribe to source-level events.
    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    /// The session fed by the active source.
    pub fn session(&self) -> &ScaleSession {
        &self.session
    }

    /// Mutable access to the session (calibration, units, files).
    pub fn session_mut(&mut self) -> &mut ScaleSession {
        &mut self.session
    }

    /// The discovery registry.
    pub fn registry(&self) -> &DiscoveryRegistry {
        &self.registry
    }

    /// Re-run discovery once.
    pub fn update_available_sources(&mut self) -> DiscoveryChanges {
        let changes = self.registry.poll();
        if !changes.is_empty() {
            let _ = self.events.send(AppEvent::SourcesChanged(changes.clone()));
        }
        changes
    }

    /// `(key, name)` of every available source.
    pub fn available_sources(&self) -> Vec<(String, String)> {
        self.registry
            .sources()
            .iter()
            .map(|s| (s.key().to_string(), s.name()))
            .collect()
    }

    /// The selected source, if any.
    pub fn active_source(&self) -> Option<&Arc<dyn ReadingSource>> {
        self.active.as_ref()
    }

    /// Select the source with `key`, or deselect with `None`.
    ///
    /// The previously active source is closed, the new one opened, and anything
    /// it buffered before selection is discarded. Switching to a different
    /// source also clears the session's series.
    pub fn use_source(&mut self, key: Option<&str>) -> AppResult<()> {
        let next = match key {
            Some(key) => Some(
                self.registry
                    .get(key)
                    .ok_or_else(|| DaqError::SourceNotFound(key.to_string()))?,
            ),
            None => None,
        };

        let previous = self.active.take();
        let same = match (&previous, &next) {
            (Some(p), Some(n)) => std::ptr::addr_eq(Arc::as_ptr(p), Arc::as_ptr(n)),
            _ => false,
        };
        if let Some(previous) = previous.filter(|_| !same) {
            previous.close();
            info!(source = %previous.name(), "Closed source");
        }

        if let Some(source) = &next {
            if !same {
                // Readings from different scales never share a series
                self.session.clear();
            }
            source.open();
            // Stale data from before selection
            let stale = source.read();
            info!(source = %source.name(), discarded = stale.len(), "Using source");
        }
        self.disconnect_reported = false;
        self.active = next;
        let _ = self.events.send(AppEvent::SourceSelected(
            self.active.as_ref().map(|s| s.key().to_string()),
        ));
        Ok(())
    }

    /// Drain the active source into the session. Returns the number of readings.
    pub fn poll_active(&mut self) -> usize {
        let Some(source) = self.active.clone() else {
            return 0;
        };
        let readings = source.read();
        if !readings.is_empty() {
            self.session.add_readings(&readings);
        }
        if !source.is_open() && !self.disconnect_reported {
            self.disconnect_reported = true;
            warn!(source = %source.name(), "Source disconnected");
            let _ = self
                .events
                .send(AppEvent::SourceDisconnected(source.key().to_string()));
        }
        readings.len()
    }

    /// Current baud rate for serial scales.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Change the serial baud rate everywhere, including future scales.
    pub fn set_baud_rate(&mut self, baud_rate: u32) {
        self.baud_rate = baud_rate;
        self.registry.set_baud_rate(baud_rate);
        info!(baud_rate, "Baud rate changed");
    }

    /// Poll and discover until `shutdown` completes, then close every source.
    pub async fn run<F>(&mut self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        let mut poll = time::interval(self.settings.acquisition.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut discovery = time::interval(self.settings.acquisition.discovery_interval());
        discovery.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut status = time::interval(STATUS_INTERVAL);
        status.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::pin!(shutdown);

        info!("Acquisition loop started");
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = discovery.tick() => {
                    self.update_available_sources();
                }
                _ = poll.tick() => {
                    self.poll_active();
                }
                _ = status.tick() => self.log_status(),
            }
        }
        self.shutdown();
        Ok(())
    }

    fn log_status(&self) {
        let Some(source) = &self.active else {
            return;
        };
        match self.session.current_reading() {
            Some(value) => info!(
                source = %source.name(),
                reading = format!("{:.3}", value),
                units = %self.session.units(),
                calibrated = self.session.fit().is_some(),
                points = self.session.series().len(),
                "Current reading"
            ),
            None => info!(source = %source.name(), "Waiting for readings"),
        }
    }

    /// Close the active source and every tracked source.
    pub fn shutdown(&mut self) {
        if let Some(source) = self.active.take() {
            source.close();
        }
        self.registry.close_all();
        info!("All sources closed");
    }
}

impl Drop for DaqApp {
    fn drop(&mut self) {
        if let Some(source) = self.active.take() {
            source.close();
        }
        self.registry.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::synthetic::SYNTHETIC_KEY;
    use crate::session::SessionEvent;
    use crate::hardware::{Backend, BackendKind, Candidate, Reading, SourceState};
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct BenchScale {
        key: String,
        open: AtomicBool,
    }

    impl ReadingSource for BenchScale {
        fn key(&self) -> &str {
            &self.key
        }
        fn name(&self) -> String {
            format!("Bench {}", self.key)
        }
        fn open(&self) {
            self.open.store(true, Ordering::Release);
        }
        fn is_open(&self) -> bool {
            self.open.load(Ordering::Acquire)
        }
        fn close(&self) {
            self.open.store(false, Ordering::Release);
        }
        fn read(&self) -> Vec<Reading> {
            Vec::new()
        }
        fn state(&self) -> SourceState {
            if self.is_open() {
                SourceState::Running
            } else {
                SourceState::Idle
            }
        }
    }

    struct BenchBackend;

    impl Backend for BenchBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Serial
        }
        fn available(&self) -> Vec<Candidate> {
            ["a", "b"]
                .into_iter()
                .map(|key| {
                    Candidate::new(key, move || {
                        Arc::new(BenchScale {
                            key: key.to_string(),
                            open: AtomicBool::new(false),
                        }) as Arc<dyn ReadingSource>
                    })
                })
                .collect()
        }
    }

    fn bench_app() -> DaqApp {
        let mut registry = DiscoveryRegistry::new();
        registry.register(Box::new(BenchBackend));
        let mut app = DaqApp::with_registry(synthetic_only(), registry).unwrap();
        app.update_available_sources();
        app
    }

    fn synthetic_only() -> Settings {
        let mut settings = Settings::default();
        settings.serial.enabled = false;
        settings.wireless.enabled = false;
        settings.synthetic.seed = Some(11);
        settings
    }

    #[test]
    fn unknown_source_is_an_error() {
        let mut app = DaqApp::new(synthetic_only()).unwrap();
        app.update_available_sources();
        assert!(matches!(
            app.use_source(Some("/dev/nothing")),
            Err(DaqError::SourceNotFound(_))
        ));
        assert!(app.active_source().is_none());
    }

    #[test]
    fn switching_sources_closes_previous() {
        let mut app = DaqApp::new(synthetic_only()).unwrap();
        let mut events = app.subscribe();
        app.update_available_sources();
        assert!(matches!(events.try_recv(), Ok(AppEvent::SourcesChanged(_))));
        assert_eq!(
            app.available_sources(),
            vec![(SYNTHETIC_KEY.to_string(), "Synthetic Scale".to_string())]
        );

        app.use_source(Some(SYNTHETIC_KEY)).unwrap();
        let source = Arc::clone(app.active_source().unwrap());
        assert!(source.is_open());
        assert_eq!(
            events.try_recv().unwrap(),
            AppEvent::SourceSelected(Some(SYNTHETIC_KEY.to_string()))
        );

        // re-selecting keeps it open
        app.use_source(Some(SYNTHETIC_KEY)).unwrap();
        assert!(source.is_open());

        app.use_source(None).unwrap();
        assert!(!source.is_open());
        assert!(app.active_source().is_none());
    }

    #[test]
    fn switching_sources_clears_series() {
        let mut app = bench_app();
        app.use_source(Some("a")).unwrap();
        app.session_mut().add_reading(1.0, 100.0);
        assert_eq!(app.session().series().len(), 1);

        // same source again keeps the data
        app.use_source(Some("a")).unwrap();
        assert_eq!(app.session().series().len(), 1);

        let mut events = app.session().subscribe();
        app.use_source(Some("b")).unwrap();
        assert!(app.session().series().is_empty());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::Cleared);

        // no weight carried over from the previous scale
        app.session_mut().add_reading(1.0, 10.0);
        let outcome = app.session_mut().add_reading(1.0, 20.0);
        assert_eq!(outcome.updated_last.map(|p| p.value), Some(15.0));
    }

    #[test]
    fn deselecting_keeps_series() {
        let mut app = bench_app();
        app.use_source(Some("a")).unwrap();
        app.session_mut().add_reading(1.0, 100.0);
        app.use_source(None).unwrap();
        assert_eq!(app.session().series().len(), 1);
        assert!(!app.registry().get("a").unwrap().is_open());
    }

    #[test]
    fn disconnect_is_reported_once() {
        let mut app = DaqApp::new(synthetic_only()).unwrap();
        app.update_available_sources();
        app.use_source(Some(SYNTHETIC_KEY)).unwrap();
        let mut events = app.subscribe();

        app.active_source().unwrap().close();
        app.poll_active();
        app.poll_active();
        assert_eq!(
            events.try_recv().unwrap(),
            AppEvent::SourceDisconnected(SYNTHETIC_KEY.to_string())
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn baud_rate_is_remembered() {
        let mut app = DaqApp::new(synthetic_only()).unwrap();
        assert_eq!(app.baud_rate(), 9600);
        app.set_baud_rate(57_600);
        assert_eq!(app.baud_rate(), 57_600);
    }
}
