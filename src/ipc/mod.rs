//! IPC core: framed local transport, typed messages, the command router,
//! the worker queue for long device operations, and event broadcast.

/// Command, response and event message types
pub mod message;
/// Command router
pub mod router;
/// IPC server: accept loop, client thread, broadcast
pub mod server;
/// Length-prefixed framing over a local stream
pub mod transport;
/// Single-thread FIFO for heavy device work
pub mod worker;

pub use message::{Command, CommandType, Event, EventType, IpcErrorCode, Response, ResponseStatus};
pub use router::Router;
pub use server::IpcServer;
pub use worker::WorkerQueue;

/// Well-known channel name. On Windows this is the trailing component of
/// `\\.\pipe\DeviceControllerService`; elsewhere it names a socket in the
/// temp directory.
pub const CHANNEL_NAME: &str = "DeviceControllerService";

/// Protocol version stamped on every message.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Hard cap on one framed message body.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;
