//! Scale hardware: the `ReadingSource` capability and its backends.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                     DiscoveryRegistry                         │
//! │   SerialBackend      WirelessBackend      SyntheticBackend    │
//! ├───────────────────────────────────────────────────────────────┤
//! │               ReadingSource (capability trait)                │
//! │   SerialScale        WirelessScale        SyntheticScale      │
//! ├───────────────────────────────────────────────────────────────┤
//! │   acquisition thread ──put──▶ BufferedChannel ──drain──▶ read │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each hardware-backed source owns one acquisition thread that blocks on
//! byte-level I/O and pushes timestamped [`Reading`]s into a bounded
//! [`channel::BufferedChannel`]. The consumer drains that channel with
//! [`ReadingSource::read`], which never blocks.
//!
//! No I/O failure crosses `read()`. A source whose loop has ended reports
//! `is_open() == false`, and that is the only signal a caller gets.

pub mod channel;
pub mod discovery;
#[cfg(feature = "instrument_serial")]
pub mod serial;
pub mod synthetic;
pub mod wireless;
pub mod worker;

use std::fmt;
use std::io::{self, Read};
use std::time::{SystemTime, UNIX_EPOCH};

pub use channel::{BufferedChannel, OverflowPolicy, PutOutcome};
pub use discovery::{Backend, BackendKind, Candidate, DiscoveryChanges, DiscoveryRegistry};
#[cfg(feature = "instrument_serial")]
pub use serial::{SerialBackend, SerialScale};
pub use synthetic::{SyntheticBackend, SyntheticScale};
pub use wireless::{WirelessBackend, WirelessScale};
pub use worker::{CancelToken, SourceState};

/// One raw sample: wall-clock seconds and the integer the scale reported.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    /// Raw scale counts
    pub value: i64,
}

impl Reading {
    /// Create a reading.
    pub fn new(timestamp: f64, value: i64) -> Self {
        Self { timestamp, value }
    }
}

/// Current wall-clock time in float seconds.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// One framed line from a byte stream.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Line {
    /// Bytes before the CRLF terminator
    Complete(Vec<u8>),
    /// `max_packet` bytes arrived without a terminator
    Overlong,
}

/// Read one CRLF-terminated line a byte at a time.
///
/// Byte-level errors (including timeouts) are returned untouched; a zero-length
/// read is reported as `UnexpectedEof`.
pub(crate) fn read_crlf_line<R: Read + ?Sized>(
    reader: &mut R,
    max_packet: usize,
) -> io::Result<Line> {
    let mut buf = Vec::with_capacity(max_packet);
    let mut byte = [0u8; 1];
    while buf.len() < max_packet {
        match reader.read(&mut byte) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "link closed by peer",
                ))
            }
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n") {
                    buf.truncate(buf.len() - 2);
                    return Ok(Line::Complete(buf));
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Line::Overlong)
}

/// Parse a line body as a signed integer reading.
pub(crate) fn parse_reading(line: &[u8]) -> Option<i64> {
    std::str::from_utf8(line).ok()?.trim().parse().ok()
}

/// Capability shared by every scale backend.
///
/// All methods take `&self`; sources are shared as `Arc<dyn ReadingSource>`
/// between the registry and the consumer.
pub trait ReadingSource: Send + Sync + fmt::Debug {
    /// Stable identity within its backend (port path, device address, ...).
    fn key(&self) -> &str;

    /// Human-readable name for selection lists.
    fn name(&self) -> String;

    /// Begin acquisition. Calling it while already running does nothing.
    fn open(&self);

    /// Whether acquisition is currently live.
    fn is_open(&self) -> bool;

    /// Ask the acquisition loop to stop. Safe before `open()` and when repeated.
    fn close(&self);

    /// Drain everything buffered so far. Never blocks; empty if nothing arrived.
    fn read(&self) -> Vec<Reading>;

    /// Lifecycle state; `Stopped` means a loop ran and has ended.
    fn state(&self) -> SourceState;

    /// Apply a new baud rate. Backends without one ignore it.
    fn set_baud_rate(&self, _baud_rate: u32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frames_crlf_lines() {
        let mut input = Cursor::new(b"123\r\n-4\r\n".to_vec());
        assert_eq!(
            read_crlf_line(&mut input, 20).unwrap(),
            Line::Complete(b"123".to_vec())
        );
        assert_eq!(
            read_crlf_line(&mut input, 20).unwrap(),
            Line::Complete(b"-4".to_vec())
        );
        let err = read_crlf_line(&mut input, 20).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn bare_lf_does_not_terminate() {
        let mut input = Cursor::new(b"12\n34\r\n".to_vec());
        assert_eq!(
            read_crlf_line(&mut input, 20).unwrap(),
            Line::Complete(b"12\n34".to_vec())
        );
    }

    #[test]
    fn overlong_line_is_flagged() {
        let mut input = Cursor::new(b"0123456789\r\n".to_vec());
        assert_eq!(read_crlf_line(&mut input, 5).unwrap(), Line::Overlong);
    }

    #[test]
    fn parses_integers_only() {
        assert_eq!(parse_reading(b"1500"), Some(1500));
        assert_eq!(parse_reading(b" -20 "), Some(-20));
        assert_eq!(parse_reading(b"12.5"), None);
        assert_eq!(parse_reading(b""), None);
        assert_eq!(parse_reading(&[0xff, 0xfe]), None);
    }
}
