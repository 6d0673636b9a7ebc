//! SMARTRO card-terminal protocol engine.
//!
//! A framed binary protocol over a serial port: STX-delimited frames with an
//! XOR block check character, an ACK/NACK handshake per exchange, a
//! background receive thread feeding a tagged response queue, and the
//! payment-approval campaign with its retry and inactivity semantics.

use std::time::Duration;

/// SMARTRO payment-terminal adapter
pub mod adapter;
/// Receive loop, handshake and the payment campaign
pub mod comm;
/// Frame codec and integrity
pub mod frame;
/// Typed request builders and response parsers per job code
pub mod messages;

pub use adapter::SmartroTerminal;
pub use comm::{Comm, CommTiming, Incoming, TerminalResponse};
pub use frame::{bcc, Frame, JobCode, ACK, ETX, NACK, STX};

/// Vendor tag used by the factory and in logs.
pub const VENDOR_NAME: &str = "smartro";

/// Terminal id used when none is configured; probes always use it.
pub const DEFAULT_TERMINAL_ID: &str = "KSK0000001";

/// Wait for the single ACK/NACK byte after writing a request.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);
/// Wait for a full response frame after the ACK.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);
/// Granularity of receiver-thread port scans and internal buffering reads.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// User-inactivity budget for one payment campaign.
pub const CAMPAIGN_BUDGET: Duration = Duration::from_secs(30);
/// Delay before resending an approval after a contactless (RF) rejection.
pub const RF_RETRY_DELAY: Duration = Duration::from_secs(3);
/// Delay before resending an approval after other rejections.
pub const RETRY_DELAY: Duration = Duration::from_millis(500);
/// Budget for the detection probe's device-check answer.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
