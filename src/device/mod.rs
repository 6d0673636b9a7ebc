use std::fmt;

/// Device factory and auto-detection registry
pub mod factory;
/// Process-wide device store
pub mod manager;
/// Payment terminal contract and event payloads
pub mod terminal;

pub use factory::{DeviceCategory, TerminalFactory, VendorProbe};
pub use manager::DeviceManager;
pub use terminal::{
    CardUid, CashAcceptorExtensions, IcCardStatus, MediumTag, PaymentCancelledEvent,
    PaymentCompleteEvent, PaymentFailedEvent, PaymentTerminal, ScreenSoundSettings,
    TerminalExtensions, TransactionCancelRequest, TransactionCancelResult,
};

/// Stable id of the card payment terminal
pub const CARD_TERMINAL_ID: &str = "card_terminal_001";
/// Stable id of the LV77 cash device
pub const CASH_DEVICE_ID: &str = "lv77_cash_001";
/// Stable id of the camera
pub const CAMERA_ID: &str = "camera_001";
/// Stable id of the printer
pub const PRINTER_ID: &str = "printer_001";

/// Kind of peripheral a device id refers to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceType {
    Payment,
    Printer,
    Camera,
}

impl From<DeviceType> for &'static str {
    fn from(t: DeviceType) -> Self {
        match t {
            DeviceType::Payment => "payment",
            DeviceType::Printer => "printer",
            DeviceType::Camera => "camera",
        }
    }
}

impl From<&str> for DeviceType {
    fn from(s: &str) -> Self {
        match s {
            "printer" => Self::Printer,
            "camera" => Self::Camera,
            _ => Self::Payment,
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Common device state.
///
/// Transitions move toward `Ready` on success and toward
/// `Error`/`Hung`/`Disconnected` on failure; only the owning adapter writes,
/// observers read a copy through the adapter lock.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected = 0,
    Connecting = 1,
    Ready = 2,
    Processing = 3,
    Error = 4,
    /// No response within the deadline
    Hung = 5,
}

impl From<u8> for DeviceState {
    fn from(b: u8) -> Self {
        match b {
            1 => Self::Connecting,
            2 => Self::Ready,
            3 => Self::Processing,
            4 => Self::Error,
            5 => Self::Hung,
            _ => Self::Disconnected,
        }
    }
}

impl From<DeviceState> for u8 {
    fn from(s: DeviceState) -> Self {
        s as u8
    }
}

impl From<DeviceState> for &'static str {
    fn from(s: DeviceState) -> Self {
        match s {
            DeviceState::Disconnected => "DISCONNECTED",
            DeviceState::Connecting => "CONNECTING",
            DeviceState::Ready => "READY",
            DeviceState::Processing => "PROCESSING",
            DeviceState::Error => "ERROR",
            DeviceState::Hung => "HUNG",
        }
    }
}

impl From<&DeviceState> for &'static str {
    fn from(s: &DeviceState) -> Self {
        (*s).into()
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}

/// Snapshot of one device for state queries and status-check events.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: DeviceType,
    pub device_name: String,
    pub state: DeviceState,
    pub last_error: String,
    pub last_update_ms: i64,
}

impl DeviceInfo {
    pub fn new(device_id: &str, device_type: DeviceType, device_name: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            device_type,
            device_name: device_name.to_string(),
            state: DeviceState::Disconnected,
            last_error: String::new(),
            last_update_ms: crate::epoch_millis(),
        }
    }

    /// Whether this device counts as healthy for the system status check.
    pub fn is_healthy(&self) -> bool {
        !matches!(self.state, DeviceState::Error | DeviceState::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_state_numeric_roundtrip() {
        for n in 0u8..=5 {
            assert_eq!(u8::from(DeviceState::from(n)), n);
        }
        assert_eq!(DeviceState::from(42), DeviceState::Disconnected);
    }

    #[test]
    fn test_device_state_strings() {
        assert_eq!(DeviceState::Ready.to_string(), "READY");
        assert_eq!(DeviceState::Processing.to_string(), "PROCESSING");
        assert_eq!(DeviceState::Hung.to_string(), "HUNG");
    }

    #[test]
    fn test_device_type_strings() {
        assert_eq!(DeviceType::Payment.to_string(), "payment");
        assert_eq!(DeviceType::from("camera"), DeviceType::Camera);
        assert_eq!(DeviceType::from("bogus"), DeviceType::Payment);
    }

    #[test]
    fn test_healthy() {
        let mut info = DeviceInfo::new("d", DeviceType::Payment, "dev");
        assert!(!info.is_healthy());
        info.state = DeviceState::Ready;
        assert!(info.is_healthy());
        info.state = DeviceState::Processing;
        assert!(info.is_healthy());
        info.state = DeviceState::Error;
        assert!(!info.is_healthy());
    }
}
