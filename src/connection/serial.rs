//! Serial-port backend.

use std::io::{self, Read, Write};
#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use serialport::SerialPort;

use super::{read_with_deadline, Connection, ConnectionError};

#[cfg(unix)]
type NativePort = serialport::TTYPort;
#[cfg(windows)]
type NativePort = serialport::COMPort;

/// Default read timeout, matching what the REPL driver is tuned for.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// A [`Connection`] backed by an OS serial port.
#[derive(Debug)]
pub struct SerialConnection {
    port: Option<NativePort>,
    timeout: Duration,
}

impl SerialConnection {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, ConnectionError> {
        let port = serialport::new(path, baud_rate)
            .timeout(DEFAULT_TIMEOUT)
            .open_native()?;

        Ok(SerialConnection {
            port: Some(port),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Point the port's own timeout at our deadline, converting the error
    /// type along the way.
    fn arm_timeout(port: &mut NativePort, remaining: Duration) -> io::Result<()> {
        port.set_timeout(remaining)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

impl Connection for SerialConnection {
    fn read(&mut self, num_bytes: usize) -> io::Result<Vec<u8>> {
        let Some(port) = self.port.as_mut() else {
            return Ok(Vec::new());
        };

        let deadline = Instant::now() + self.timeout;
        let mut out = Vec::with_capacity(num_bytes);
        let mut buf = [0u8; 512];

        while out.len() < num_bytes {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            Self::arm_timeout(port, deadline - now)?;

            let want = (num_bytes - out.len()).min(buf.len());
            match port.read(&mut buf[..want]) {
                Ok(0) => break,
                Ok(count) => out.extend_from_slice(&buf[..count]),
                Err(err) if is_timeout(&err) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(out)
    }

    fn read_until(&mut self, sentinel: &[u8]) -> io::Result<Vec<u8>> {
        let timeout = self.timeout;
        let Some(port) = self.port.as_mut() else {
            return Ok(Vec::new());
        };

        read_with_deadline(
            timeout,
            |remaining| {
                Self::arm_timeout(port, remaining)?;
                let mut byte = [0u8; 1];
                loop {
                    match port.read(&mut byte) {
                        Ok(0) => return Ok(None),
                        Ok(_) => return Ok(Some(byte[0])),
                        Err(err) if is_timeout(&err) => return Ok(None),
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err),
                    }
                }
            },
            |buf| buf.ends_with(sentinel),
        )
    }

    fn read_buffered(&mut self) -> io::Result<Vec<u8>> {
        let Some(port) = self.port.as_mut() else {
            return Ok(Vec::new());
        };

        let waiting = port
            .bytes_to_read()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }

        let mut out = vec![0u8; waiting];
        let mut filled = 0;
        while filled < waiting {
            match port.read(&mut out[filled..]) {
                Ok(0) => break,
                Ok(count) => filled += count,
                Err(err) if is_timeout(&err) => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        out.truncate(filled);
        Ok(out)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let Some(port) = self.port.as_mut() else {
            return Ok(0);
        };
        port.write_all(data)?;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(port) = self.port.as_mut() {
            port.flush()?;
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.port = None;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    #[cfg(unix)]
    fn raw_fd(&self) -> Option<RawFd> {
        self.port.as_ref().map(|port| port.as_raw_fd())
    }
}
