//! Byte-stream connections to a MicroPython device.
//!
//! A [`Connection`] is a uniform, timeout-aware byte pipe over which the REPL
//! driver talks to a device. Two backends exist: a plain serial port
//! ([`SerialConnection`]) and MicroPython's WebREPL-over-WebSocket
//! ([`WebReplConnection`]).

mod serial;
mod webrepl;

use std::io;
use std::ops::{Deref, DerefMut};
#[cfg(unix)]
use std::os::unix::io::RawFd;
use std::time::Duration;

use thiserror::Error;

pub use self::serial::SerialConnection;
pub use self::webrepl::WebReplConnection;

#[derive(Debug, Error)]
pub enum ConnectionError {
    /// The textual connection specification could not be understood.
    #[error("invalid connection specification: {0}")]
    Spec(String),

    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    /// The WebSocket opening handshake did not complete as expected.
    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    /// The WebREPL password prompt exchange failed.
    #[error("WebREPL authentication failed (device said {0:?})")]
    Authentication(String),

    /// A WebSocket frame arrived with reserved bits set.
    #[error("WebSocket frame with reserved bits set ({0:#04x})")]
    ReservedBits(u8),

    /// A WebSocket frame that this minimal client cannot handle.
    #[error("WebSocket protocol error: {0}")]
    Protocol(String),
}

/// A bidirectional byte stream to a MicroPython device.
///
/// Reads observe the connection's current timeout and return whatever bytes
/// arrived before it elapsed; a timeout is a short (possibly empty) read, not
/// an error. After [`Connection::close`], reads return no bytes and writes
/// report zero bytes written.
pub trait Connection: Send + std::fmt::Debug {
    /// Read up to `num_bytes` bytes, returning however many were received
    /// before the timeout.
    fn read(&mut self, num_bytes: usize) -> io::Result<Vec<u8>>;

    /// Read until `sentinel` has been received, returning everything read up
    /// to and including it. On timeout, returns whatever was received, which
    /// will not end with the sentinel; callers must check.
    fn read_until(&mut self, sentinel: &[u8]) -> io::Result<Vec<u8>>;

    /// Return any already-received bytes without waiting.
    fn read_buffered(&mut self) -> io::Result<Vec<u8>>;

    /// Write the given bytes, returning how many were actually written.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Flush any buffered written bytes out to the device.
    fn flush(&mut self) -> io::Result<()>;

    /// Close the connection. Further reads return nothing and writes write
    /// nothing.
    fn close(&mut self) -> io::Result<()>;

    /// The current read timeout.
    fn timeout(&self) -> Duration;

    /// Change the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// The file descriptor to wait on when multiplexing reads from this
    /// connection, or `None` once closed.
    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd>;
}

/// Create a connection from a text-based specification.
///
/// Supported specifications:
///
/// * `/dev/ttyACM0` or `COM1`: serial at 9600 baud.
/// * `/dev/ttyACM0:115200`: serial at the given baud rate (the split is on
///   the last colon).
/// * `ws://10.0.0.111/?password-here`: WebREPL. The password is everything
///   after the last `?` and is stripped from the URL. Port 8266 (not 80) is
///   assumed when absent.
pub fn from_specification(spec: &str) -> Result<Box<dyn Connection>, ConnectionError> {
    if spec.starts_with("ws://") {
        let (url, password) = spec.rsplit_once('?').ok_or_else(|| {
            ConnectionError::Spec(format!(
                "expected '?password-here' suffix to ws:// device path: {spec}"
            ))
        })?;
        Ok(Box::new(WebReplConnection::connect(url, password)?))
    } else {
        let (port, baud_rate) = match spec.rsplit_once(':') {
            Some((port, baud)) => {
                let baud_rate = baud.parse::<u32>().map_err(|_| {
                    ConnectionError::Spec(format!("invalid baud rate {baud:?} in {spec:?}"))
                })?;
                (port, baud_rate)
            }
            None => (spec, 9600),
        };
        Ok(Box::new(SerialConnection::open(port, baud_rate)?))
    }
}

/// Scoped timeout override for a connection.
///
/// Dereferences to the underlying connection; the previous timeout is
/// restored when the guard is dropped, on every exit path.
pub struct TimeoutOverride<'a> {
    conn: &'a mut dyn Connection,
    previous: Duration,
}

pub fn timeout_override(
    conn: &mut dyn Connection,
    timeout: Duration,
) -> io::Result<TimeoutOverride<'_>> {
    let previous = conn.timeout();
    conn.set_timeout(timeout)?;
    Ok(TimeoutOverride { conn, previous })
}

impl<'a> Deref for TimeoutOverride<'a> {
    type Target = dyn Connection + 'a;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl DerefMut for TimeoutOverride<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.conn
    }
}

impl Drop for TimeoutOverride<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.conn.set_timeout(self.previous) {
            log::warn!("failed to restore connection timeout: {}", err);
        }
    }
}

/// Shared deadline-driven read loop: pull single bytes from `read_byte` until
/// `stop` says we're done or the deadline passes. `read_byte` is expected to
/// block for at most the remaining time it is given.
pub(crate) fn read_with_deadline(
    timeout: Duration,
    mut read_byte: impl FnMut(Duration) -> io::Result<Option<u8>>,
    mut stop: impl FnMut(&[u8]) -> bool,
) -> io::Result<Vec<u8>> {
    let deadline = std::time::Instant::now() + timeout;
    let mut out = Vec::new();

    while !stop(&out) {
        let now = std::time::Instant::now();
        if now >= deadline {
            break;
        }
        match read_byte(deadline - now)? {
            Some(byte) => out.push(byte),
            None => break,
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specification_serial_default_baudrate() {
        // Opening the port fails (no such device), but the parse must get as
        // far as trying the right name.
        for name in ["COM2", "/dev/nonexistent-upyt-test"] {
            match from_specification(name) {
                Err(ConnectionError::Serial(_)) => (),
                other => panic!("expected serial error, got {other:?}"),
            }
        }
    }

    #[test]
    fn specification_serial_bad_baudrate() {
        match from_specification("/dev/ttyACM0:fast") {
            Err(ConnectionError::Spec(_)) => (),
            other => panic!("expected spec error, got {other:?}"),
        }
    }

    #[test]
    fn specification_ws_requires_password() {
        match from_specification("ws://foo.bar/baz") {
            Err(ConnectionError::Spec(_)) => (),
            other => panic!("expected spec error, got {other:?}"),
        }
    }

    #[test]
    fn read_with_deadline_stops_on_condition() {
        let mut source = b"hello world".iter().copied();
        let out = read_with_deadline(
            Duration::from_secs(10),
            |_remaining| Ok(source.next()),
            |buf| buf.ends_with(b"o w"),
        )
        .unwrap();
        assert_eq!(out, b"hello w");
    }

    #[test]
    fn read_with_deadline_stops_on_eof() {
        let mut source = b"abc".iter().copied();
        let out = read_with_deadline(
            Duration::from_secs(10),
            |_remaining| Ok(source.next()),
            |_buf| false,
        )
        .unwrap();
        assert_eq!(out, b"abc");
    }
}
