//! Wired serial scales.
//!
//! The scale streams one integer per CRLF-terminated line. Many boards reboot
//! when the port opens, so the loop first waits up to `link_timeout_ms` for the
//! first byte. After that every byte must arrive within `read_timeout_ms`;
//! a timeout, a disconnect or any other I/O error ends the loop and closes the
//! port. Lines that do not parse as integers are noise and are dropped.
//!
//! Baud-rate changes travel over a command channel and are applied by the loop
//! itself between lines, without reopening the port.

use super::channel::{BufferedChannel, OverflowPolicy};
use super::discovery::{Backend, BackendKind, Candidate};
use super::worker::{AcquisitionWorker, CancelToken, SourceState};
use super::{now_secs, parse_reading, read_crlf_line, Line, Reading, ReadingSource};
use crate::config::SerialConfig;
use parking_lot::Mutex;
use std::fmt;
use std::io::{self, Read};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Interval between checks for the first byte after opening.
const LINK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Byte-level access to an opened serial port.
pub trait SerialLink: Read + Send {
    /// Bytes waiting in the receive buffer.
    fn bytes_available(&mut self) -> io::Result<u32>;

    /// Reconfigure the line speed in place.
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;
}

impl SerialLink for Box<dyn serialport::SerialPort> {
    fn bytes_available(&mut self) -> io::Result<u32> {
        self.bytes_to_read().map_err(io::Error::from)
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        (**self)
            .set_baud_rate(baud_rate)
            .map_err(io::Error::from)
    }
}

/// Opens a port by path at a baud rate with a per-byte read timeout.
pub type LinkOpener =
    Arc<dyn Fn(&str, u32, Duration) -> io::Result<Box<dyn SerialLink>> + Send + Sync>;

fn open_system_port(
    path: &str,
    baud_rate: u32,
    timeout: Duration,
) -> io::Result<Box<dyn SerialLink>> {
    let port = serialport::new(path, baud_rate)
        .timeout(timeout)
        .open()
        .map_err(io::Error::from)?;
    Ok(Box::new(port))
}

/// Commands accepted by a running serial loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SerialCommand {
    SetBaudRate(u32),
}

/// A scale on a wired serial port.
pub struct SerialScale {
    port: String,
    config: SerialConfig,
    baud_rate: AtomicU32,
    opener: LinkOpener,
    channel: BufferedChannel<Reading>,
    worker: AcquisitionWorker,
    commands: Mutex<Option<mpsc::UnboundedSender<SerialCommand>>>,
}

impl fmt::Debug for SerialScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialScale")
            .field("port", &self.port)
            .field("baud_rate", &self.baud_rate.load(Ordering::Relaxed))
            .field("state", &self.worker.state())
            .finish()
    }
}

impl SerialScale {
    /// Scale on `port` that will open at `baud_rate`.
    pub fn new(port: impl Into<String>, baud_rate: u32, config: SerialConfig) -> Self {
        Self::with_opener(port, baud_rate, config, Arc::new(open_system_port))
    }

    /// Scale whose port is produced by `opener` instead of the OS.
    pub fn with_opener(
        port: impl Into<String>,
        baud_rate: u32,
        config: SerialConfig,
        opener: LinkOpener,
    ) -> Self {
        let channel = BufferedChannel::new(config.buffer_capacity, OverflowPolicy::DropOldest);
        Self {
            port: port.into(),
            config,
            baud_rate: AtomicU32::new(baud_rate),
            opener,
            channel,
            worker: AcquisitionWorker::new(),
            commands: Mutex::new(None),
        }
    }

    /// Baud rate the port uses (or will use on the next open).
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::Relaxed)
    }
}

impl ReadingSource for SerialScale {
    fn key(&self) -> &str {
        &self.port
    }

    fn name(&self) -> String {
        format!("Serial Scale at {}", self.port)
    }

    fn open(&self) {
        // Held across start so a concurrent baud change reaches the new loop
        let mut commands = self.commands.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        let acquisition = SerialAcquisition {
            port: self.port.clone(),
            baud_rate: self.baud_rate(),
            config: self.config.clone(),
            opener: Arc::clone(&self.opener),
            channel: self.channel.clone(),
            commands: rx,
        };
        if self
            .worker
            .start(format!("serial-{}", self.port), move |cancel| {
                acquisition.run(&cancel)
            })
        {
            *commands = Some(tx);
        }
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

    fn set_baud_rate(&self, baud_rate: u32) {
        self.baud_rate.store(baud_rate, Ordering::Relaxed);
        if let Some(tx) = self.commands.lock().as_ref() {
            // A closed receiver means the loop has ended; the rate applies on reopen
            let _ = tx.send(SerialCommand::SetBaudRate(baud_rate));
        }
    }
}

/// Everything the acquisition thread owns.
struct SerialAcquisition {
    port: String,
    baud_rate: u32,
    config: SerialConfig,
    opener: LinkOpener,
    channel: BufferedChannel<Reading>,
    commands: mpsc::UnboundedReceiver<SerialCommand>,
}

impl SerialAcquisition {
    fn run(mut self, cancel: &CancelToken) {
        let read_timeout = Duration::from_millis(self.config.read_timeout_ms);
        let mut link = match (self.opener)(&self.port, self.baud_rate, read_timeout) {
            Ok(link) => link,
            Err(e) => {
                error!(port = %self.port, error = %e, "Failed to open serial port");
                return;
            }
        };
        info!(port = %self.port, baud = self.baud_rate, "Serial port opened");

        match self.wait_for_link(link.as_mut(), cancel) {
            Ok(true) => {}
            Ok(false) => {
                info!(port = %self.port, "Serial port closed before link came up");
                return;
            }
            Err(e) => {
                error!(port = %self.port, error = %e, "Serial link never came up");
                return;
            }
        }

        while !cancel.is_cancelled() {
            self.apply_commands(link.as_mut());

            match read_crlf_line(link.as_mut(), self.config.max_packet_size) {
                Ok(Line::Complete(line)) => match parse_reading(&line) {
                    Some(value) => {
                        self.channel.put(Reading::new(now_secs(), value), cancel);
                    }
                    None => {
                        warn!(
                            port = %self.port,
                            line = %String::from_utf8_lossy(&line),
                            "Dropped unparseable line"
                        );
                    }
                },
                Ok(Line::Overlong) => {
                    warn!(
                        port = %self.port,
                        max = self.config.max_packet_size,
                        "Dropped line without terminator"
                    );
                }
                Err(e) => {
                    error!(port = %self.port, error = %e, "Serial link lost");
                    return;
                }
            }
        }
        info!(port = %self.port, "Serial port closed");
    }

    /// Wait for the first byte. `Ok(false)` means cancelled while waiting.
    fn wait_for_link(&self, link: &mut dyn SerialLink, cancel: &CancelToken) -> io::Result<bool> {
        let deadline = Instant::now() + Duration::from_millis(self.config.link_timeout_ms);
        loop {
            if cancel.is_cancelled() {
                return Ok(false);
            }
            if link.bytes_available()? > 0 {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "no data within link timeout",
                ));
            }
            thread::sleep(LINK_POLL_INTERVAL);
        }
    }

    fn apply_commands(&mut self, link: &mut dyn SerialLink) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SerialCommand::SetBaudRate(baud) => match link.set_baud_rate(baud) {
                    Ok(()) => {
                        self.baud_rate = baud;
                        info!(port = %self.port, baud, "Baud rate changed");
                    }
                    Err(e) => {
                        warn!(port = %self.port, baud, error = %e, "Failed to change baud rate")
                    }
                },
            }
        }
    }
}

/// Offers one [`SerialScale`] per serial port the OS reports.
pub struct SerialBackend {
    config: SerialConfig,
    baud_rate: Arc<AtomicU32>,
}

impl SerialBackend {
    /// Backend creating scales at the configured baud rate.
    pub fn new(config: SerialConfig) -> Self {
        let baud_rate = Arc::new(AtomicU32::new(config.baud_rate));
        Self { config, baud_rate }
    }
}

impl Backend for SerialBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Serial
    }

    fn available(&self) -> Vec<Candidate> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!(error = %e, "Could not enumerate serial ports");
                return Vec::new();
            }
        };
        ports
            .into_iter()
            .map(|info| {
                let port = info.port_name;
                let config = self.config.clone();
                let baud_rate = Arc::clone(&self.baud_rate);
                Candidate::new(port.clone(), move || {
                    Arc::new(SerialScale::new(
                        port,
                        baud_rate.load(Ordering::Relaxed),
                        config,
                    )) as Arc<dyn ReadingSource>
                })
            })
            .collect()
    }

    fn set_baud_rate(&self, baud_rate: u32) {
        self.baud_rate.store(baud_rate, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// In-memory port fed from a script; an empty script times out.
    struct ScriptedLink {
        data: VecDeque<u8>,
        repeat: Option<Vec<u8>>,
        byte_delay: Duration,
        bauds: Arc<Mutex<Vec<u32>>>,
    }

    impl Read for ScriptedLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.data.is_empty() {
                if let Some(chunk) = &self.repeat {
                    self.data.extend(chunk.iter().copied());
                }
            }
            if !self.byte_delay.is_zero() {
                thread::sleep(self.byte_delay);
            }
            match self.data.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                }
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "timed out")),
            }
        }
    }

    impl SerialLink for ScriptedLink {
        fn bytes_available(&mut self) -> io::Result<u32> {
            Ok(self.data.len() as u32 + u32::from(self.repeat.is_some()))
        }

        fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
            self.bauds.lock().push(baud_rate);
            Ok(())
        }
    }

    fn test_config() -> SerialConfig {
        SerialConfig {
            link_timeout_ms: 200,
            read_timeout_ms: 50,
            ..SerialConfig::default()
        }
    }

    fn scripted(
        data: &[u8],
        repeat: Option<&[u8]>,
        byte_delay: Duration,
    ) -> (LinkOpener, Arc<Mutex<Vec<u32>>>) {
        let bauds = Arc::new(Mutex::new(Vec::new()));
        let data = data.to_vec();
        let repeat = repeat.map(<[u8]>::to_vec);
        let log = Arc::clone(&bauds);
        let opener: LinkOpener = Arc::new(move |_: &str, baud: u32, _: Duration| {
            log.lock().push(baud);
            Ok(Box::new(ScriptedLink {
                data: data.iter().copied().collect(),
                repeat: repeat.clone(),
                byte_delay,
                bauds: Arc::clone(&log),
            }) as Box<dyn SerialLink>)
        });
        (opener, bauds)
    }

    fn wait_closed(scale: &SerialScale) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while scale.is_open() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!scale.is_open());
    }

    #[test]
    fn parses_lines_and_stops_on_timeout() {
        let (opener, bauds) = scripted(b"123\r\n45\r\nabc\r\n-7\r\n", None, Duration::ZERO);
        let scale = SerialScale::with_opener("/dev/ttyFAKE0", 9600, test_config(), opener);
        scale.open();
        wait_closed(&scale);

        let values: Vec<i64> = scale.read().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![123, 45, -7]);
        assert_eq!(*bauds.lock(), vec![9600]);
        assert_eq!(scale.state(), SourceState::Stopped);
        assert!(scale.read().is_empty());
    }

    #[test]
    fn overlong_garbage_is_dropped() {
        let (opener, _) = scripted(b"abcdefghijklmnopqrstuvwxyz\r\n5\r\n", None, Duration::ZERO);
        let scale = SerialScale::with_opener("/dev/ttyFAKE1", 9600, test_config(), opener);
        scale.open();
        wait_closed(&scale);
        let values: Vec<i64> = scale.read().iter().map(|r| r.value).collect();
        assert_eq!(values, vec![5]);
    }

    #[test]
    fn silent_port_hits_link_timeout() {
        let (opener, _) = scripted(b"", None, Duration::ZERO);
        let scale = SerialScale::with_opener("/dev/ttyFAKE2", 9600, test_config(), opener);
        scale.open();
        wait_closed(&scale);
        assert!(scale.read().is_empty());
    }

    #[test]
    fn open_failure_leaves_source_closed() {
        let opener: LinkOpener = Arc::new(|_: &str, _: u32, _: Duration| {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such port"))
        });
        let scale = SerialScale::with_opener("/dev/missing", 9600, test_config(), opener);
        scale.open();
        wait_closed(&scale);
        assert!(scale.read().is_empty());
    }

    #[test]
    fn close_before_open_and_twice() {
        let (opener, _) = scripted(b"", None, Duration::ZERO);
        let scale = SerialScale::with_opener("/dev/ttyFAKE3", 9600, test_config(), opener);
        scale.close();
        scale.close();
        assert!(!scale.is_open());
        assert_eq!(scale.state(), SourceState::Idle);
    }

    #[test]
    fn baud_change_applies_without_reopen() {
        let (opener, bauds) = scripted(b"", Some(b"1\r\n"), Duration::from_millis(1));
        let scale = SerialScale::with_opener("/dev/ttyFAKE4", 9600, test_config(), opener);
        scale.open();
        assert!(scale.is_open());

        scale.set_baud_rate(115_200);
        let deadline = Instant::now() + Duration::from_secs(3);
        while !bauds.lock().contains(&115_200) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(*bauds.lock(), vec![9600, 115_200]);
        assert_eq!(scale.baud_rate(), 115_200);

        scale.close();
        wait_closed(&scale);
        assert!(scale.read().iter().all(|r| r.value == 1));
    }

    #[test]
    fn reopen_after_close_starts_fresh_loop() {
        let (opener, bauds) = scripted(b"", Some(b"2\r\n"), Duration::from_millis(1));
        let scale = SerialScale::with_opener("/dev/ttyFAKE5", 9600, test_config(), opener);
        scale.open();
        scale.close();
        wait_closed(&scale);

        scale.set_baud_rate(19_200);
        scale.open();
        assert!(scale.is_open());
        scale.close();
        wait_closed(&scale);
        assert_eq!(*bauds.lock(), vec![9600, 19_200]);
    }

    #[test]
    fn close_then_open_without_waiting_keeps_running() {
        let (opener, bauds) = scripted(b"", Some(b"1\r\n"), Duration::from_millis(20));
        let scale = SerialScale::with_opener("/dev/ttyFAKE6", 9600, test_config(), opener);
        scale.open();
        thread::sleep(Duration::from_millis(100));

        // The first loop is still inside a byte read here
        scale.close();
        scale.open();
        assert!(scale.is_open());

        thread::sleep(Duration::from_millis(300));
        assert!(scale.is_open());
        assert_eq!(scale.state(), SourceState::Running);
        // Second loop opened the port again
        assert_eq!(*bauds.lock(), vec![9600, 9600]);

        scale.close();
        wait_closed(&scale);
        assert_eq!(scale.state(), SourceState::Stopped);
    }

    #[test]
    fn close_after_queued_open_stops_both() {
        let (opener, _) = scripted(b"", Some(b"1\r\n"), Duration::from_millis(20));
        let scale = SerialScale::with_opener("/dev/ttyFAKE7", 9600, test_config(), opener);
        scale.open();
        thread::sleep(Duration::from_millis(50));
        scale.close();
        scale.open();
        scale.close();
        wait_closed(&scale);

        thread::sleep(Duration::from_millis(200));
        assert!(!scale.is_open());
        assert_eq!(scale.state(), SourceState::Stopped);
    }

    #[test]
    fn naming() {
        let scale = SerialScale::new("/dev/ttyUSB0", 9600, SerialConfig::default());
        assert_eq!(scale.key(), "/dev/ttyUSB0");
        assert_eq!(scale.name(), "Serial Scale at /dev/ttyUSB0");
    }
}
