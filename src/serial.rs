use std::fs;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use serialport::{DataBits, Parity, StopBits};

use crate::error::{Error, Result};

/// Budget for opening a port; enforced by a supervisor thread so one
/// unresponsive device cannot stall hardware detection.
pub const OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Default baud rate for the SMARTRO card terminal (8N1).
pub const CARD_BAUD: u32 = 115_200;
/// Baud rate for the LV77 bill validator (8E1).
pub const CASH_BAUD: u32 = 9_600;

/// File name of the persistent working-port hint.
pub const WORKING_PORT_FILE: &str = "working_port.txt";

/// Parity configuration for an open port.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ParityMode {
    None,
    Odd,
    Even,
}

impl From<ParityMode> for Parity {
    fn from(p: ParityMode) -> Self {
        match p {
            ParityMode::None => Parity::None,
            ParityMode::Odd => Parity::Odd,
            ParityMode::Even => Parity::Even,
        }
    }
}

impl From<ParityMode> for &'static str {
    fn from(p: ParityMode) -> Self {
        match p {
            ParityMode::None => "N",
            ParityMode::Odd => "O",
            ParityMode::Even => "E",
        }
    }
}

impl std::fmt::Display for ParityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Byte-stream seam between the protocol engines and the OS serial port.
///
/// Real ports are [`SerialPort`]; tests substitute scripted doubles. A read
/// may return zero bytes on timeout but never blocks indefinitely.
pub trait BytePort: Send {
    /// Write all bytes or fail.
    fn write_all(&mut self, bytes: &[u8]) -> Result<()>;

    /// Read up to `buf.len()` bytes, waiting at most `timeout`.
    /// Returns the number of bytes read; zero indicates a timeout.
    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Reconfigure the baud rate of an open port.
    fn set_baud(&mut self, baud: u32) -> Result<()>;

    /// Reconfigure the parity of an open port.
    fn set_parity(&mut self, parity: ParityMode) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Close the port. Idempotent.
    fn close(&mut self);

    /// The OS name this port was opened with (e.g. `COM3`).
    fn name(&self) -> &str;
}

/// Read a single byte with a timeout. Returns `Ok(None)` when nothing
/// arrived in time.
pub fn read_byte(port: &mut dyn BytePort, timeout: Duration) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match port.read_some(&mut buf, timeout)? {
        0 => Ok(None),
        _ => Ok(Some(buf[0])),
    }
}

/// An exclusively-owned OS serial port.
///
/// The handle is held by exactly one adapter; `is_open` reflects the handle
/// state after every operation, and a failed operation that closes the
/// handle leaves `is_open` false.
pub struct SerialPort {
    inner: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    baud: u32,
}

impl SerialPort {
    /// Open `name` at `baud`, 8 data bits, 1 stop bit, no parity.
    ///
    /// Fails with a `SerialPort` error when the OS denies access or the
    /// device does not exist, and with `Timeout` when the open call itself
    /// exceeds [`OPEN_TIMEOUT`].
    pub fn open(name: &str, baud: u32) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let port_name = name.to_string();

        // The open call can wedge on half-dead USB adapters; run it on a
        // supervisor thread and give up after the budget.
        thread::Builder::new()
            .name(format!("open-{port_name}"))
            .spawn(move || {
                let result = serialport::new(&port_name, baud)
                    .data_bits(DataBits::Eight)
                    .stop_bits(StopBits::One)
                    .parity(Parity::None)
                    .timeout(Duration::from_millis(100))
                    .open();
                let _ = tx.send(result);
            })
            .map_err(|e| Error::failure(format!("failed to spawn open supervisor: {e}")))?;

        match rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(Ok(inner)) => {
                log::info!("opened {name} at {baud}");
                Ok(Self {
                    inner: Some(inner),
                    name: name.to_string(),
                    baud,
                })
            }
            Ok(Err(err)) => Err(classify_open_error(name, err)),
            Err(_) => Err(Error::timeout(format!(
                "opening {name} exceeded {}ms",
                OPEN_TIMEOUT.as_millis()
            ))),
        }
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }
}

fn classify_open_error(name: &str, err: serialport::Error) -> Error {
    match err.kind() {
        serialport::ErrorKind::NoDevice => Error::serial(format!("port not found: {name}")),
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            Error::serial(format!("port busy: {name}"))
        }
        _ => Error::serial(format!("failed to open {name}: {err}")),
    }
}

impl BytePort for SerialPort {
    fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let Some(port) = self.inner.as_mut() else {
            return Err(Error::serial("write on closed port"));
        };
        port.write_all(bytes)
            .and_then(|_| port.flush())
            .map_err(|e| {
                self.inner = None;
                Error::serial(format!("write failed on {}: {e}", self.name))
            })
    }

    fn read_some(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let Some(port) = self.inner.as_mut() else {
            return Err(Error::serial("read on closed port"));
        };
        if let Err(e) = port.set_timeout(timeout) {
            return Err(Error::serial(format!("set_timeout failed: {e}")));
        }
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => {
                self.inner = None;
                Err(Error::serial(format!(
                    "read failed on {}: {e}",
                    self.name
                )))
            }
        }
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        let Some(port) = self.inner.as_mut() else {
            return Err(Error::serial("set_baud on closed port"));
        };
        port.set_baud_rate(baud)?;
        self.baud = baud;
        Ok(())
    }

    fn set_parity(&mut self, parity: ParityMode) -> Result<()> {
        let Some(port) = self.inner.as_mut() else {
            return Err(Error::serial("set_parity on closed port"));
        };
        port.set_parity(parity.into())?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.is_some()
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            log::info!("closed {}", self.name);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Placeholder for an adapter constructed before its hardware is reachable.
///
/// Every operation fails as a closed port; a real port is swapped in once
/// detection or reconnect succeeds.
pub struct ClosedPort {
    name: String,
}

impl ClosedPort {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

impl BytePort for ClosedPort {
    fn write_all(&mut self, _bytes: &[u8]) -> Result<()> {
        Err(Error::serial("port is not open"))
    }

    fn read_some(&mut self, _buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        Err(Error::serial("port is not open"))
    }

    fn set_baud(&mut self, _baud: u32) -> Result<()> {
        Err(Error::serial("port is not open"))
    }

    fn set_parity(&mut self, _parity: ParityMode) -> Result<()> {
        Err(Error::serial("port is not open"))
    }

    fn is_open(&self) -> bool {
        false
    }

    fn close(&mut self) {}

    fn name(&self) -> &str {
        &self.name
    }
}

/// Ordered list of serial port names known to the OS.
///
/// With `registry_only` set, only the OS enumeration is consulted (fast).
/// Otherwise, when enumeration comes back empty, COM1..COM20 are probed by
/// attempting a short open.
pub fn enumerate_ports(registry_only: bool) -> Vec<String> {
    let mut names: Vec<String> = serialport::available_ports()
        .map(|ports| ports.into_iter().map(|p| p.port_name).collect())
        .unwrap_or_default();
    names.sort();

    if names.is_empty() && !registry_only {
        for n in 1..=20 {
            let candidate = format!("COM{n}");
            if serialport::new(&candidate, 9600)
                .timeout(Duration::from_millis(50))
                .open()
                .is_ok()
            {
                names.push(candidate);
            }
        }
    }

    names
}

fn working_port_path() -> PathBuf {
    std::env::temp_dir().join(WORKING_PORT_FILE)
}

/// Persist the last port a terminal was found on, as a detection hint.
pub fn save_working_port(name: &str) -> Result<()> {
    fs::write(working_port_path(), name)
        .map_err(|e| Error::failure(format!("failed to save working port: {e}")))
}

/// Load the persisted working-port hint; a missing file yields an empty
/// string.
pub fn load_working_port() -> String {
    fs::read_to_string(working_port_path())
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}


#[cfg(test)]
mod tests {
    use super::script::ScriptPort;
    use super::*;

    #[test]
    fn test_read_byte_timeout_returns_none() {
        let mut port = ScriptPort::new();
        let byte = read_byte(&mut port, Duration::from_millis(5)).unwrap();
        assert_eq!(byte, None);
    }

    #[test]
    fn test_script_port_feeds_and_records() {
        let mut port = ScriptPort::new();
        port.feed(&[0x8f, 0x41]);

        let byte = read_byte(&mut port, Duration::from_millis(5)).unwrap();
        assert_eq!(byte, Some(0x8f));

        port.write_all(&[0x02]).unwrap();
        assert_eq!(port.written(), vec![0x02]);
    }

    #[test]
    fn test_script_port_close_is_observed() {
        let mut port = ScriptPort::new();
        assert!(port.is_open());
        port.close();
        assert!(!port.is_open());
        assert!(port.write_all(&[0x0c]).is_err());
    }

    #[test]
    fn test_working_port_roundtrip() {
        save_working_port("COM9").unwrap();
        assert_eq!(load_working_port(), "COM9");
    }

    #[test]
    fn test_parity_display() {
        assert_eq!(ParityMode::Even.to_string(), "E");
        assert_eq!(ParityMode::None.to_string(), "N");
    }
}
