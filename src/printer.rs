//! Printer adapter surface.
//!
//! GDI rendering lives behind this contract; the core routes print commands
//! and forwards job-complete events.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::device::{DeviceInfo, DeviceState};
use crate::error::Result;

/// Budget for launching a print job before it is reported hung.
pub const PRINT_LAUNCH_TIMEOUT_MS: u64 = 60_000;

/// Page orientation for file printing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Orientation {
    Portrait,
    Landscape,
}

impl From<&str> for Orientation {
    fn from(s: &str) -> Self {
        match s {
            "landscape" | "LANDSCAPE" => Self::Landscape,
            _ => Self::Portrait,
        }
    }
}

impl From<Orientation> for &'static str {
    fn from(o: Orientation) -> Self {
        match o {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Outcome of one print job.
#[derive(Clone, Debug, PartialEq)]
pub struct PrinterJobEvent {
    pub job_id: String,
    pub success: bool,
    pub error_message: String,
}

pub type PrinterJobCallback = Arc<dyn Fn(&PrinterJobEvent) + Send + Sync>;

/// Contract for printer adapters.
pub trait Printer: Send + Sync {
    fn device_info(&self) -> DeviceInfo;

    fn state(&self) -> DeviceState;

    /// Print raw image bytes on `printer_name` (empty = configured default).
    fn print(&self, job_id: &str, bytes: &[u8], printer_name: &str) -> Result<()>;

    /// Print an image file with the given orientation.
    fn print_from_file(&self, job_id: &str, path: &Path, orientation: Orientation) -> Result<()>;

    /// Printer names known to the OS spooler.
    fn available_printers(&self) -> Vec<String>;

    fn set_job_complete_callback(&self, callback: PrinterJobCallback);
}
