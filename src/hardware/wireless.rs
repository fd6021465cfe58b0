//! Wireless serial scales (radio serial bridges such as HC-05 modules).
//!
//! The transport is reached through a [`LinkConnector`]; the bundled
//! [`TcpConnector`] talks to serial-over-IP bridges. Device enumeration goes
//! through a [`DeviceScanner`], which can be slow, so [`WirelessBackend`] runs it
//! on a background thread behind a single-flight flag and always answers
//! discovery from the result of the last completed scan.
//!
//! Compared to the wired backend, a line that overruns the small packet budget
//! means the connection is lost, and the loop ends.

use super::channel::{BufferedChannel, OverflowPolicy, PutOutcome};
use super::discovery::{Backend, BackendKind, Candidate};
use super::worker::{AcquisitionWorker, CancelToken, SourceState};
use super::{now_secs, parse_reading, read_crlf_line, Line, Reading, ReadingSource};
use crate::config::{PeerConfig, WirelessConfig};
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Opens a byte stream to a wireless device.
pub trait LinkConnector: Send + Sync {
    /// Connect to `address`; reads on the stream must time out after `read_timeout`.
    fn connect(&self, address: &str, read_timeout: Duration)
        -> io::Result<Box<dyn Read + Send>>;
}

/// Connects to serial-over-IP bridges (`host:port`).
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl LinkConnector for TcpConnector {
    fn connect(
        &self,
        address: &str,
        read_timeout: Duration,
    ) -> io::Result<Box<dyn Read + Send>> {
        let addr = address.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for '{}'", address),
            )
        })?;
        let stream = TcpStream::connect_timeout(&addr, read_timeout)?;
        stream.set_read_timeout(Some(read_timeout))?;
        Ok(Box::new(stream))
    }
}

/// A device seen by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    /// Advertised name
    pub name: String,
    /// Address handed to the [`LinkConnector`]
    pub address: String,
}

impl From<&PeerConfig> for DiscoveredDevice {
    fn from(peer: &PeerConfig) -> Self {
        Self {
            name: peer.name.clone(),
            address: peer.address.clone(),
        }
    }
}

/// Enumerates nearby wireless devices. May block.
pub trait DeviceScanner: Send + Sync {
    /// Every device currently visible, regardless of name.
    fn scan(&self) -> anyhow::Result<Vec<DiscoveredDevice>>;
}

/// Reports the peers listed in the configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticPeerScanner {
    peers: Vec<DiscoveredDevice>,
}

impl StaticPeerScanner {
    /// Scanner over a fixed peer list.
    pub fn new(peers: &[PeerConfig]) -> Self {
        Self {
            peers: peers.iter().map(DiscoveredDevice::from).collect(),
        }
    }
}

impl DeviceScanner for StaticPeerScanner {
    fn scan(&self) -> anyhow::Result<Vec<DiscoveredDevice>> {
        Ok(self.peers.clone())
    }
}

/// A scale behind a wireless serial link.
pub struct WirelessScale {
    device: DiscoveredDevice,
    config: WirelessConfig,
    connector: Arc<dyn LinkConnector>,
    channel: BufferedChannel<Reading>,
    worker: AcquisitionWorker,
}

impl fmt::Debug for WirelessScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WirelessScale")
            .field("device", &self.device)
            .field("state", &self.worker.state())
            .finish()
    }
}

impl WirelessScale {
    /// Scale for `device`, reached through `connector`.
    pub fn new(
        device: DiscoveredDevice,
        config: WirelessConfig,
        connector: Arc<dyn LinkConnector>,
    ) -> Self {
        let channel = BufferedChannel::new(config.buffer_capacity, OverflowPolicy::Block);
        Self {
            device,
            config,
            connector,
            channel,
            worker: AcquisitionWorker::new(),
        }
    }
}

impl ReadingSource for WirelessScale {
    fn key(&self) -> &str {
        &self.device.address
    }

    fn name(&self) -> String {
        format!("Wireless Scale {}", self.device.name)
    }

    fn open(&self) {
        let address = self.device.address.clone();
        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);
        let max_packet = self.config.max_packet_size;
        let connector = Arc::clone(&self.connector);
        let channel = self.channel.clone();
        self.worker
            .start(format!("wireless-{}", address), move |cancel| {
                run_link(
                    &address,
                    connector.as_ref(),
                    read_timeout,
                    max_packet,
                    &channel,
                    &cancel,
                )
            });
    }

    fn is_open(&self) -> bool {
        self.worker.is_alive()
    }

    fn close(&self) {
        self.worker.stop();
    }

    fn read(&self) -> Vec<Reading> {
        self.channel.drain()
    }

    fn state(&self) -> SourceState {
        self.worker.state()
    }
}

fn run_link(
    address: &str,
    connector: &dyn LinkConnector,
    read_timeout: Duration,
    max_packet: usize,
    channel: &BufferedChannel<Reading>,
    cancel: &CancelToken,
) {
    let mut stream = match connector.connect(address, read_timeout) {
        Ok(stream) => stream,
        Err(e) => {
            error!(%address, error = %e, "Failed to connect to wireless scale");
            return;
        }
    };
    info!(%address, "Wireless scale connected");

    while !cancel.is_cancelled() {
        match read_crlf_line(stream.as_mut(), max_packet) {
            Ok(Line::Complete(line)) => match parse_reading(&line) {
                Some(value) => {
                    let reading = Reading::new(now_secs(), value);
                    if channel.put(reading, cancel) == PutOutcome::Cancelled {
                        break;
                    }
                }
                None => {
                    warn!(
                        %address,
                        line = %String::from_utf8_lossy(&line),
                        "Dropped unparseable line"
                    );
                }
            },
            Ok(Line::Overlong) => {
                error!(%address, max_packet, "No line terminator in packet budget; link lost");
                return;
            }
            Err(e) => {
                error!(%address, error = %e, "Wireless link lost");
                return;
            }
        }
    }
    info!(%address, "Wireless scale disconnected");
}

/// Offers one [`WirelessScale`] per scanned device whose name matches the filter.
pub struct WirelessBackend {
    config: WirelessConfig,
    scanner: Arc<dyn DeviceScanner>,
    connector: Arc<dyn LinkConnector>,
    scanning: Arc<AtomicBool>,
    found: Arc<Mutex<Vec<DiscoveredDevice>>>,
}

impl WirelessBackend {
    /// Backend scanning the configured peers and connecting over TCP.
    pub fn new(config: WirelessConfig) -> Self {
        let scanner = Arc::new(StaticPeerScanner::new(&config.peers));
        Self::with_transport(config, scanner, Arc::new(TcpConnector))
    }

    /// Backend with a custom scanner and connector.
    pub fn with_transport(
        config: WirelessConfig,
        scanner: Arc<dyn DeviceScanner>,
        connector: Arc<dyn LinkConnector>,
    ) -> Self {
        Self {
            config,
            scanner,
            connector,
            scanning: Arc::new(AtomicBool::new(false)),
            found: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Whether a scan is in flight.
    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::Acquire)
    }

    /// Start a background scan unless one is already running.
    ///
    /// Returns `true` if a new scan was started.
    pub fn start_scan(&self) -> bool {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let scanner = Arc::clone(&self.scanner);
        let found = Arc::clone(&self.found);
        let flag = Arc::clone(&self.scanning);
        let name_filter = self.config.name_filter.clone();
        let spawned = thread::Builder::new()
            .name("wireless-scan".to_string())
            .spawn(move || {
                let _clear = ScanFlag(flag);
                match scanner.scan() {
                    Ok(devices) => {
                        let matching: Vec<DiscoveredDevice> = devices
                            .into_iter()
                            .filter(|d| d.name == name_filter)
                            .collect();
                        debug!(count = matching.len(), "Wireless scan finished");
                        *found.lock() = matching;
                    }
                    Err(e) => warn!(error = %e, "Wireless scan failed"),
                }
            });
        match spawned {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "Failed to spawn wireless scan thread");
                self.scanning.store(false, Ordering::Release);
                false
            }
        }
    }
}

/// Clears the single-flight flag when the scan thread ends.
struct ScanFlag(Arc<AtomicBool>);

impl Drop for ScanFlag {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Backend for WirelessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Wireless
    }

    fn available(&self) -> Vec<Candidate> {
        self.start_scan();
        self.found
            .lock()
            .iter()
            .map(|device| {
                let device = device.clone();
                let config = self.config.clone();
                let connector = Arc::clone(&self.connector);
                Candidate::new(device.address.clone(), move || {
                    Arc::new(WirelessScale::new(device, config, connector))
                        as Arc<dyn ReadingSource>
                })
            })
            .collect()
    }

    fn drops_stopped_sources(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    struct ScriptConnector {
        script: Vec<u8>,
    }

    impl LinkConnector for ScriptConnector {
        fn connect(
            &self,
            _address: &str,
            _read_timeout: Duration,
        ) -> io::Result<Box<dyn Read + Send>> {
            Ok(Box::new(Cursor::new(self.script.clone())))
        }
    }

    /// Blocks every scan until released.
    struct GatedScanner {
        calls: AtomicUsize,
        release: Arc<AtomicBool>,
        devices: Vec<DiscoveredDevice>,
    }

    impl DeviceScanner for GatedScanner {
        fn scan(&self) -> anyhow::Result<Vec<DiscoveredDevice>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            Ok(self.devices.clone())
        }
    }

    fn device(name: &str, address: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            name: name.into(),
            address: address.into(),
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn reads_until_link_closes() {
        let connector = Arc::new(ScriptConnector {
            script: b"10\r\nxx\r\n-3\r\n".to_vec(),
        });
        let scale =
            WirelessScale::new(device("HC-05", "bt-1"), WirelessConfig::default(), connector);
        scale.open();
        assert!(wait_until(|| !scale.is_open()));
        let values: Vec<i64> = scale.read().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![10, -3]);
        assert_eq!(scale.state(), SourceState::Stopped);
    }

    #[test]
    fn overrun_ends_the_link() {
        let connector = Arc::new(ScriptConnector {
            script: b"1\r\n123456789012\r\n2\r\n".to_vec(),
        });
        let scale =
            WirelessScale::new(device("HC-05", "bt-2"), WirelessConfig::default(), connector);
        scale.open();
        assert!(wait_until(|| !scale.is_open()));
        let values: Vec<i64> = scale.read().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![1]);
    }

    #[test]
    fn scans_are_single_flight_and_filtered() {
        let release = Arc::new(AtomicBool::new(false));
        let scanner = Arc::new(GatedScanner {
            calls: AtomicUsize::new(0),
            release: Arc::clone(&release),
            devices: vec![
                device("HC-05", "98:d3:00:00:00:01"),
                device("Headphones", "aa:bb"),
            ],
        });
        let backend = WirelessBackend::with_transport(
            WirelessConfig::default(),
            scanner.clone(),
            Arc::new(TcpConnector),
        );

        // nothing known until the first scan completes
        assert!(backend.available().is_empty());
        assert!(backend.is_scanning());
        assert!(backend.available().is_empty());
        assert!(!backend.start_scan());
        assert!(wait_until(|| scanner.calls.load(Ordering::SeqCst) == 1));

        release.store(true, Ordering::SeqCst);
        assert!(wait_until(|| !backend.is_scanning()));

        let keys: Vec<String> = backend.available().into_iter().map(|c| c.key).collect();
        assert_eq!(keys, vec!["98:d3:00:00:00:01"]);
    }

    #[test]
    fn static_scanner_reports_configured_peers() {
        let peers = vec![PeerConfig {
            name: "HC-05".into(),
            address: "127.0.0.1:9".into(),
        }];
        let scanner = StaticPeerScanner::new(&peers);
        assert_eq!(scanner.scan().unwrap(), vec![device("HC-05", "127.0.0.1:9")]);
    }

    #[test]
    fn naming_and_close_before_open() {
        let scale = WirelessScale::new(
            device("HC-05", "98:d3:00:00:00:01"),
            WirelessConfig::default(),
            Arc::new(TcpConnector),
        );
        assert_eq!(scale.key(), "98:d3:00:00:00:01");
        assert_eq!(scale.name(), "Wireless Scale HC-05");
        scale.close();
        scale.close();
        assert!(!scale.is_open());
        assert!(scale.read().is_empty());
    }
}
