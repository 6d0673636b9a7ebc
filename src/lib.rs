//! # Kiosk hardware-control daemon
//!
//! This crate fronts a family of kiosk peripherals (a SMARTRO card payment
//! terminal, an LV77/ICT-104U bill validator, a camera and a printer) behind
//! a single request/response plus event stream over a framed local IPC
//! channel.
//!
//! The layering, leaves first:
//!
//! * [`serial`]: blocking serial port access with per-read timeouts and port
//!   enumeration, plus the [`serial::BytePort`] seam the protocol engines are
//!   written against.
//! * [`smartro`]: the framed binary card-terminal protocol: frame codec with
//!   BCC integrity, ACK/NACK handshake, a background receive thread, and the
//!   retrying payment-approval campaign.
//! * [`lv77`]: the single-byte bill-validator protocol: power-up sync,
//!   polling loop and the escrow accept/reject state machine.
//! * [`device`]: the vendor-agnostic [`device::PaymentTerminal`] contract,
//!   the probe-based [`device::TerminalFactory`] and the process-wide
//!   [`device::DeviceManager`].
//! * [`camera`], [`printer`]: surface contracts for the remaining
//!   peripherals.
//! * [`ipc`]: length-prefixed JSON message framing, the command router, a
//!   worker queue for long device operations and the event broadcast path.
//! * [`daemon`]: wiring and lifecycle.
//!
//! Message and enum types follow one convention throughout: canonical wire
//! strings are provided via `From` conversions in both directions, and every
//! public enum carries a `Display` impl writing that canonical form.

/// Camera adapter surface
pub mod camera;
/// Configuration file handling
pub mod config;
/// Daemon wiring and lifecycle
pub mod daemon;
/// Device abstraction, factory and manager
pub mod device;
/// Library error types
pub mod error;
/// IPC transport, messages, router and worker queue
pub mod ipc;
/// Logging convenience helpers
pub mod logging;
/// LV77 bill-validator protocol engine
pub mod lv77;
/// Printer adapter surface
pub mod printer;
/// Serial port access
pub mod serial;
/// SMARTRO card-terminal protocol engine
pub mod smartro;

pub use error::{Error, ErrorCode, Result};

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
///
/// Used for IPC message timestamps; never fails for clocks set after 1970.
pub fn epoch_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
