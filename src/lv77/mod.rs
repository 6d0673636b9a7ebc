//! LV77 / ICT-104U bill-validator protocol engine.
//!
//! A single-byte command protocol at 9600 8E1: power-up sync, a continuous
//! status poll loop, and an escrow decision per validated bill. The only
//! multi-byte reply is bill-validated (`0x81` followed by the bill type).

use std::time::Duration;

/// LV77 cash-acceptor adapter
pub mod adapter;
/// Link management and the poll loop
pub mod comm;
/// Wire bytes, bill table and status strings
pub mod protocol;

pub use adapter::Lv77CashAcceptor;
pub use comm::Lv77Comm;

/// Vendor tag used by the factory and in logs.
pub const VENDOR_NAME: &str = "lv77";

/// Poll interval while idle.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Poll interval during an active cash payment.
pub const ACTIVE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Widened interval after repeated poll silence.
pub const SLOW_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Consecutive silent polls before slowing down.
pub const SILENCE_THRESHOLD: u32 = 10;
/// Budget for the power-up sync answer.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(2);
/// Budget for a reset round-trip.
pub const RESET_TIMEOUT: Duration = Duration::from_secs(3);
