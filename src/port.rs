//! Abstract duplex byte channel: timed read, exclusive write,
//! best-effort rx flush. The Port does not enforce half-duplex settling
//! time itself — the Bus does.

use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use crate::error::BusError;

/// Fixed serial configuration for the STS3215 family. Not user-tunable.
pub const BAUD_RATE: u32 = 1_000_000;

/// A single-owner, half-duplex-on-the-wire duplex byte channel.
pub trait Port: Send {
    /// Transmit all of `bytes` before returning.
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError>;

    /// Read any bytes available before `deadline`. An empty read after the
    /// deadline elapses is a timeout, not success.
    fn read(&mut self, deadline: Duration) -> Result<Vec<u8>, BusError>;

    /// Best-effort, non-blocking drain of pending inbound bytes.
    fn flush_rx(&mut self);

    /// Release the underlying channel.
    fn close(&mut self);
}

/// Native serial port implementation, backed by the `serialport` crate.
/// Opened at the fixed STS3215 baud rate, 8N1, no flow control.
pub struct SerialPort {
    inner: Box<dyn serialport::SerialPort>,
    last_timeout: Duration,
}

impl SerialPort {
    /// Open `path` at the fixed STS3215 baud rate.
    pub fn open(path: &str) -> Result<SerialPort, BusError> {
        let default_timeout = Duration::from_millis(150);
        let inner = serialport::new(path, BAUD_RATE)
            .timeout(default_timeout)
            .open()
            .map_err(|e| BusError::Io {
                id: None,
                source: std::io::Error::new(ErrorKind::Other, e),
            })?;
        Ok(SerialPort {
            inner,
            last_timeout: default_timeout,
        })
    }

    fn ensure_timeout(&mut self, deadline: Duration) -> Result<(), BusError> {
        if deadline != self.last_timeout {
            self.inner
                .set_timeout(deadline)
                .map_err(|e| BusError::Io {
                    id: None,
                    source: std::io::Error::new(ErrorKind::Other, e),
                })?;
            self.last_timeout = deadline;
        }
        Ok(())
    }
}

impl Port for SerialPort {
    fn write(&mut self, bytes: &[u8]) -> Result<(), BusError> {
        self.inner
            .write_all(bytes)
            .map_err(|source| BusError::Io { id: None, source })?;
        self.inner
            .flush()
            .map_err(|source| BusError::Io { id: None, source })
    }

    fn read(&mut self, deadline: Duration) -> Result<Vec<u8>, BusError> {
        self.ensure_timeout(deadline)?;
        let start = Instant::now();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match self.inner.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::TimedOut => break,
                Err(e) => return Err(BusError::Io { id: None, source: e }),
            }
        }
        if buf.is_empty() && start.elapsed() >= deadline {
            // Genuinely no bytes arrived before the deadline. Returning an
            // empty Vec lets the Bus decide (short reply vs. true timeout)
            // rather than conflating the two here.
        }
        Ok(buf)
    }

    fn flush_rx(&mut self) {
        let mut buf = [0u8; 256];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }

    fn close(&mut self) {
        // serialport::SerialPort has no explicit close; dropping the
        // trait object releases the OS handle.
    }
}

