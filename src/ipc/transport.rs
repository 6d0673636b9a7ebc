use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::ipc::MAX_MESSAGE_SIZE;

#[cfg(unix)]
pub(crate) type RawListener = std::os::unix::net::UnixListener;
#[cfg(unix)]
pub(crate) type RawStream = std::os::unix::net::UnixStream;

#[cfg(not(unix))]
pub(crate) type RawListener = std::net::TcpListener;
#[cfg(not(unix))]
pub(crate) type RawStream = std::net::TcpStream;

/// Loopback port used where Unix sockets are unavailable.
#[cfg(not(unix))]
const LOOPBACK_PORT: u16 = 47611;

/// Filesystem path backing the local channel on Unix platforms.
#[cfg(unix)]
pub fn endpoint_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("{name}.sock"))
}

#[cfg(not(unix))]
pub fn endpoint_path(name: &str) -> PathBuf {
    PathBuf::from(format!(r"\\.\pipe\{name}"))
}

/// Outcome of one framed read attempt.
#[derive(Debug)]
pub enum FrameRead {
    Message(Vec<u8>),
    /// Nothing arrived within the timeout; the connection is still up.
    Timeout,
    /// The peer hung up.
    Closed,
}

/// Write one length-prefixed message: LE u32 length, then the body.
pub fn write_frame<W: Write>(writer: &mut W, body: &[u8]) -> Result<()> {
    if body.len() > MAX_MESSAGE_SIZE {
        return Err(Error::ipc(format!(
            "message of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte cap",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(body)?;
    writer.flush()?;
    Ok(())
}

fn is_timeout(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}

/// Read one length-prefixed message.
///
/// The stream must carry a read timeout; a timeout before the first header
/// byte yields `Timeout`, mid-message timeouts keep reading (the peer is
/// mid-write). A length above the cap is a protocol violation and surfaces
/// as an error so the caller drops the connection.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<FrameRead> {
    let mut header = [0u8; 4];
    let mut have = 0usize;
    while have < header.len() {
        match reader.read(&mut header[have..]) {
            Ok(0) => return Ok(FrameRead::Closed),
            Ok(n) => have += n,
            Err(err) if is_timeout(&err) => {
                if have == 0 {
                    return Ok(FrameRead::Timeout);
                }
            }
            Err(err) => return Err(Error::ipc(format!("header read failed: {err}"))),
        }
    }

    let length = u32::from_le_bytes(header) as usize;
    if length > MAX_MESSAGE_SIZE {
        return Err(Error::ipc(format!(
            "peer announced {length} bytes, above the {MAX_MESSAGE_SIZE} byte cap"
        )));
    }

    let mut body = vec![0u8; length];
    let mut have = 0usize;
    while have < length {
        match reader.read(&mut body[have..]) {
            Ok(0) => return Ok(FrameRead::Closed),
            Ok(n) => have += n,
            Err(err) if is_timeout(&err) => {}
            Err(err) => return Err(Error::ipc(format!("body read failed: {err}"))),
        }
    }
    Ok(FrameRead::Message(body))
}

/// Shared writing half of a client connection.
///
/// Both the response path and the event broadcast write here; the mutex
/// keeps frames whole.
pub struct MessageWriter {
    stream: Mutex<RawStream>,
}

impl MessageWriter {
    pub fn new(stream: RawStream) -> Self {
        Self {
            stream: Mutex::new(stream),
        }
    }

    pub fn send(&self, body: &str) -> Result<()> {
        let mut stream = self.stream.lock().unwrap();
        write_frame(&mut *stream, body.as_bytes())
    }

    pub fn shutdown(&self) {
        let stream = self.stream.lock().unwrap();
        let _ = stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Reading half of a client connection.
pub struct MessageReader {
    stream: RawStream,
}

impl MessageReader {
    pub fn new(stream: RawStream, read_timeout: Duration) -> Result<Self> {
        stream
            .set_read_timeout(Some(read_timeout))
            .map_err(|e| Error::ipc(format!("set_read_timeout failed: {e}")))?;
        Ok(Self { stream })
    }

    pub fn recv(&mut self) -> Result<FrameRead> {
        read_frame(&mut self.stream)
    }
}

/// Listener for the well-known local channel. Accepts at most one client at
/// a time; the accept loop polls so a stop flag can be observed once a
/// second.
pub struct Listener {
    inner: RawListener,
    #[cfg(unix)]
    path: PathBuf,
}

impl Listener {
    pub fn bind(name: &str) -> Result<Self> {
        #[cfg(unix)]
        {
            let path = endpoint_path(name);
            // A previous run may have left its socket file behind.
            let _ = std::fs::remove_file(&path);
            let inner = RawListener::bind(&path)
                .map_err(|e| Error::ipc(format!("failed to bind {}: {e}", path.display())))?;
            inner
                .set_nonblocking(true)
                .map_err(|e| Error::ipc(format!("set_nonblocking failed: {e}")))?;
            log::info!("[IPC] listening on {}", path.display());
            Ok(Self { inner, path })
        }
        #[cfg(not(unix))]
        {
            let _ = name;
            let inner = RawListener::bind(("127.0.0.1", LOOPBACK_PORT))
                .map_err(|e| Error::ipc(format!("failed to bind loopback: {e}")))?;
            inner
                .set_nonblocking(true)
                .map_err(|e| Error::ipc(format!("set_nonblocking failed: {e}")))?;
            log::info!("[IPC] listening on 127.0.0.1:{LOOPBACK_PORT}");
            Ok(Self { inner })
        }
    }

    /// Wait up to `timeout` for one client.
    pub fn accept_timeout(&self, timeout: Duration) -> Result<Option<RawStream>> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match self.inner.accept() {
                Ok((stream, _addr)) => {
                    stream
                        .set_nonblocking(false)
                        .map_err(|e| Error::ipc(format!("set_nonblocking failed: {e}")))?;
                    return Ok(Some(stream));
                }
                Err(err) if is_timeout(&err) => {
                    if std::time::Instant::now() >= deadline {
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(err) => return Err(Error::ipc(format!("accept failed: {err}"))),
            }
        }
    }

    /// Connect to this listener's endpoint (client side, used in tests and
    /// by the companion client library).
    pub fn connect(name: &str) -> Result<RawStream> {
        #[cfg(unix)]
        {
            let path = endpoint_path(name);
            RawStream::connect(&path)
                .map_err(|e| Error::ipc(format!("connect to {} failed: {e}", path.display())))
        }
        #[cfg(not(unix))]
        {
            let _ = name;
            RawStream::connect(("127.0.0.1", LOOPBACK_PORT))
                .map_err(|e| Error::ipc(format!("connect failed: {e}")))
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}
