use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ipc::PROTOCOL_VERSION;

fn default_version() -> String {
    PROTOCOL_VERSION.to_string()
}

fn default_command_kind() -> String {
    "command".to_string()
}

/// Typed command tags. Unrecognized strings map to [`CommandType::Unknown`]
/// and are answered with an `UNKNOWN_COMMAND` rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandType {
    PaymentStart,
    PaymentCancel,
    PaymentTransactionCancel,
    PaymentStatus,
    PaymentReset,
    PaymentDeviceCheck,
    PaymentCardUidRead,
    PaymentLastApproval,
    PaymentIcCardCheck,
    PaymentScreenSoundSetting,
    GetDeviceList,
    GetStateSnapshot,
    GetConfig,
    SetConfig,
    PrinterPrint,
    CameraCapture,
    CameraSetSession,
    CameraStatus,
    CameraStartPreview,
    CameraStopPreview,
    CameraSetSettings,
    CameraReconnect,
    DetectHardware,
    GetAvailablePrinters,
    CashTestStart,
    CashPaymentStart,
    Unknown,
}

impl From<&str> for CommandType {
    fn from(s: &str) -> Self {
        match s {
            "payment_start" => Self::PaymentStart,
            "payment_cancel" => Self::PaymentCancel,
            "payment_transaction_cancel" => Self::PaymentTransactionCancel,
            "payment_status" => Self::PaymentStatus,
            "payment_reset" => Self::PaymentReset,
            "payment_device_check" => Self::PaymentDeviceCheck,
            "payment_card_uid_read" => Self::PaymentCardUidRead,
            "payment_last_approval" => Self::PaymentLastApproval,
            "payment_ic_card_check" => Self::PaymentIcCardCheck,
            "payment_screen_sound_setting" => Self::PaymentScreenSoundSetting,
            "get_device_list" => Self::GetDeviceList,
            "get_state_snapshot" => Self::GetStateSnapshot,
            "get_config" => Self::GetConfig,
            "set_config" => Self::SetConfig,
            "printer_print" => Self::PrinterPrint,
            "camera_capture" => Self::CameraCapture,
            "camera_set_session" => Self::CameraSetSession,
            "camera_status" => Self::CameraStatus,
            "camera_start_preview" => Self::CameraStartPreview,
            "camera_stop_preview" => Self::CameraStopPreview,
            "camera_set_settings" => Self::CameraSetSettings,
            "camera_reconnect" => Self::CameraReconnect,
            "detect_hardware" => Self::DetectHardware,
            "get_available_printers" => Self::GetAvailablePrinters,
            "cash_test_start" => Self::CashTestStart,
            "cash_payment_start" => Self::CashPaymentStart,
            _ => Self::Unknown,
        }
    }
}

impl From<CommandType> for &'static str {
    fn from(t: CommandType) -> Self {
        match t {
            CommandType::PaymentStart => "payment_start",
            CommandType::PaymentCancel => "payment_cancel",
            CommandType::PaymentTransactionCancel => "payment_transaction_cancel",
            CommandType::PaymentStatus => "payment_status",
            CommandType::PaymentReset => "payment_reset",
            CommandType::PaymentDeviceCheck => "payment_device_check",
            CommandType::PaymentCardUidRead => "payment_card_uid_read",
            CommandType::PaymentLastApproval => "payment_last_approval",
            CommandType::PaymentIcCardCheck => "payment_ic_card_check",
            CommandType::PaymentScreenSoundSetting => "payment_screen_sound_setting",
            CommandType::GetDeviceList => "get_device_list",
            CommandType::GetStateSnapshot => "get_state_snapshot",
            CommandType::GetConfig => "get_config",
            CommandType::SetConfig => "set_config",
            CommandType::PrinterPrint => "printer_print",
            CommandType::CameraCapture => "camera_capture",
            CommandType::CameraSetSession => "camera_set_session",
            CommandType::CameraStatus => "camera_status",
            CommandType::CameraStartPreview => "camera_start_preview",
            CommandType::CameraStopPreview => "camera_stop_preview",
            CommandType::CameraSetSettings => "camera_set_settings",
            CommandType::CameraReconnect => "camera_reconnect",
            CommandType::DetectHardware => "detect_hardware",
            CommandType::GetAvailablePrinters => "get_available_printers",
            CommandType::CashTestStart => "cash_test_start",
            CommandType::CashPaymentStart => "cash_payment_start",
            CommandType::Unknown => "unknown",
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Status of a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// The action succeeded
    Ok,
    /// The action was attempted and the device reported failure
    Failed,
    /// Refused before any device action
    Rejected,
}

impl From<ResponseStatus> for &'static str {
    fn from(s: ResponseStatus) -> Self {
        match s {
            ResponseStatus::Ok => "ok",
            ResponseStatus::Failed => "failed",
            ResponseStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Asynchronous event tags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PaymentComplete,
    PaymentFailed,
    PaymentCancelled,
    DeviceStateChanged,
    SystemStatusCheck,
    CameraCaptureComplete,
    CameraStateChanged,
    PrinterJobComplete,
    CashTestAmount,
    CashPaymentTargetReached,
    CashBillStacked,
}

impl From<EventType> for &'static str {
    fn from(t: EventType) -> Self {
        match t {
            EventType::PaymentComplete => "payment_complete",
            EventType::PaymentFailed => "payment_failed",
            EventType::PaymentCancelled => "payment_cancelled",
            EventType::DeviceStateChanged => "device_state_changed",
            EventType::SystemStatusCheck => "system_status_check",
            EventType::CameraCaptureComplete => "camera_capture_complete",
            EventType::CameraStateChanged => "camera_state_changed",
            EventType::PrinterJobComplete => "printer_job_complete",
            EventType::CashTestAmount => "cash_test_amount",
            EventType::CashPaymentTargetReached => "cash_payment_target_reached",
            EventType::CashBillStacked => "cash_bill_stacked",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Error codes carried on non-`ok` responses. Vendor-neutral at the IPC
/// surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpcErrorCode {
    UnknownCommand,
    InvalidPayload,
    DeviceNotFound,
    InvalidDeviceType,
    DeviceNotReady,
    PaymentStartFailed,
    PaymentCancelFailed,
    PaymentResetFailed,
    DeviceCheckFailed,
    CardUidReadFailed,
    LastApprovalFailed,
    IcCardCheckFailed,
    ScreenSoundSettingFailed,
    TransactionCancelFailed,
    HandlerError,
    ParseError,
}

impl From<IpcErrorCode> for &'static str {
    fn from(c: IpcErrorCode) -> Self {
        match c {
            IpcErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            IpcErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            IpcErrorCode::DeviceNotFound => "DEVICE_NOT_FOUND",
            IpcErrorCode::InvalidDeviceType => "INVALID_DEVICE_TYPE",
            IpcErrorCode::DeviceNotReady => "DEVICE_NOT_READY",
            IpcErrorCode::PaymentStartFailed => "PAYMENT_START_FAILED",
            IpcErrorCode::PaymentCancelFailed => "PAYMENT_CANCEL_FAILED",
            IpcErrorCode::PaymentResetFailed => "PAYMENT_RESET_FAILED",
            IpcErrorCode::DeviceCheckFailed => "DEVICE_CHECK_FAILED",
            IpcErrorCode::CardUidReadFailed => "CARD_UID_READ_FAILED",
            IpcErrorCode::LastApprovalFailed => "LAST_APPROVAL_FAILED",
            IpcErrorCode::IcCardCheckFailed => "IC_CARD_CHECK_FAILED",
            IpcErrorCode::ScreenSoundSettingFailed => "SCREEN_SOUND_SETTING_FAILED",
            IpcErrorCode::TransactionCancelFailed => "TRANSACTION_CANCEL_FAILED",
            IpcErrorCode::HandlerError => "HANDLER_ERROR",
            IpcErrorCode::ParseError => "PARSE_ERROR",
        }
    }
}

impl fmt::Display for IpcErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Client-to-daemon message.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Command {
    #[serde(rename = "protocolVersion", default = "default_version")]
    pub protocol_version: String,
    #[serde(default = "default_command_kind")]
    pub kind: String,
    #[serde(rename = "commandId")]
    pub command_id: String,
    /// Raw type tag; resolve with [`Command::command_type`].
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(rename = "timestampMs", default)]
    pub timestamp_ms: i64,
    #[serde(default)]
    pub payload: BTreeMap<String, String>,
}

impl Command {
    pub fn new(command_id: &str, command_type: CommandType) -> Self {
        Self {
            protocol_version: default_version(),
            kind: default_command_kind(),
            command_id: command_id.to_string(),
            type_tag: command_type.to_string(),
            timestamp_ms: crate::epoch_millis(),
            payload: BTreeMap::new(),
        }
    }

    pub fn with_payload(mut self, key: &str, value: &str) -> Self {
        self.payload.insert(key.to_string(), value.to_string());
        self
    }

    pub fn command_type(&self) -> CommandType {
        self.type_tag.as_str().into()
    }
}

/// Daemon-to-client answer, correlated by `commandId`.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Response {
    #[serde(rename = "protocolVersion", default = "default_version")]
    pub protocol_version: String,
    pub kind: String,
    #[serde(rename = "commandId")]
    pub command_id: String,
    pub status: ResponseStatus,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<BTreeMap<String, String>>,
    #[serde(rename = "errorCode", skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<String>,
    #[serde(
        rename = "errorMessage",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub error_message: Option<String>,
}

impl Response {
    fn base(command_id: &str, status: ResponseStatus) -> Self {
        Self {
            protocol_version: default_version(),
            kind: "response".to_string(),
            command_id: command_id.to_string(),
            status,
            timestamp_ms: crate::epoch_millis(),
            result: None,
            error_code: None,
            error_message: None,
        }
    }

    pub fn ok(command_id: &str, result: BTreeMap<String, String>) -> Self {
        Self {
            result: Some(result),
            ..Self::base(command_id, ResponseStatus::Ok)
        }
    }

    pub fn failed(command_id: &str, code: IpcErrorCode, message: &str) -> Self {
        Self {
            error_code: Some(<&'static str>::from(code).to_string()),
            error_message: Some(message.to_string()),
            ..Self::base(command_id, ResponseStatus::Failed)
        }
    }

    pub fn rejected(command_id: &str, code: IpcErrorCode, message: &str) -> Self {
        Self {
            error_code: Some(<&'static str>::from(code).to_string()),
            error_message: Some(message.to_string()),
            ..Self::base(command_id, ResponseStatus::Rejected)
        }
    }
}

/// Daemon-to-client unsolicited notification. Carries no ack; loss while no
/// client is attached is by design.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Event {
    #[serde(rename = "protocolVersion", default = "default_version")]
    pub protocol_version: String,
    pub kind: String,
    #[serde(rename = "eventId")]
    pub event_id: String,
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    #[serde(rename = "timestampMs")]
    pub timestamp_ms: i64,
    #[serde(rename = "deviceType")]
    pub device_type: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Event {
    pub fn new(event_type: EventType, device_type: &str, data: BTreeMap<String, String>) -> Self {
        Self {
            protocol_version: default_version(),
            kind: "event".to_string(),
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type,
            timestamp_ms: crate::epoch_millis(),
            device_type: device_type.to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_type_strings_roundtrip() {
        let tags = [
            "payment_start",
            "payment_cancel",
            "payment_transaction_cancel",
            "payment_status",
            "payment_reset",
            "payment_device_check",
            "payment_card_uid_read",
            "payment_last_approval",
            "payment_ic_card_check",
            "payment_screen_sound_setting",
            "get_device_list",
            "get_state_snapshot",
            "get_config",
            "set_config",
            "printer_print",
            "camera_capture",
            "camera_set_session",
            "camera_status",
            "camera_start_preview",
            "camera_stop_preview",
            "camera_set_settings",
            "camera_reconnect",
            "detect_hardware",
            "get_available_printers",
            "cash_test_start",
            "cash_payment_start",
        ];
        for tag in tags {
            let parsed = CommandType::from(tag);
            assert_ne!(parsed, CommandType::Unknown, "{tag}");
            assert_eq!(parsed.to_string(), tag);
        }
        assert_eq!(CommandType::from("nuke_kiosk"), CommandType::Unknown);
    }

    #[test]
    fn test_command_deserialize_minimal() {
        // Scenario: a client sends only the required correlation fields.
        let json = r#"{"type":"nuke_kiosk","commandId":"abc","timestampMs":0,"payload":{}}"#;
        let command: Command = serde_json::from_str(json).unwrap();
        assert_eq!(command.command_id, "abc");
        assert_eq!(command.command_type(), CommandType::Unknown);
        assert_eq!(command.protocol_version, "1.0");
        assert_eq!(command.kind, "command");
    }

    #[test]
    fn test_command_serde_exact() {
        let command = Command {
            protocol_version: "1.0".into(),
            kind: "command".into(),
            command_id: "c-1".into(),
            type_tag: "payment_start".into(),
            timestamp_ms: 42,
            payload: [("amount".to_string(), "1000".to_string())].into(),
        };
        let expected = "{\"protocolVersion\":\"1.0\",\"kind\":\"command\",\"commandId\":\"c-1\",\"type\":\"payment_start\",\"timestampMs\":42,\"payload\":{\"amount\":\"1000\"}}";
        assert_eq!(serde_json::to_string(&command).unwrap(), expected);
        assert_eq!(serde_json::from_str::<Command>(expected).unwrap(), command);
    }

    #[test]
    fn test_response_ok_shape() {
        let mut result = BTreeMap::new();
        result.insert("state".to_string(), "2".to_string());
        let mut response = Response::ok("c-1", result);
        response.timestamp_ms = 7;

        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(
            json,
            "{\"protocolVersion\":\"1.0\",\"kind\":\"response\",\"commandId\":\"c-1\",\"status\":\"ok\",\"timestampMs\":7,\"result\":{\"state\":\"2\"}}"
        );
        assert_eq!(serde_json::from_str::<Response>(&json).unwrap(), response);
    }

    #[test]
    fn test_response_rejected_shape() {
        let mut response =
            Response::rejected("abc", IpcErrorCode::UnknownCommand, "unknown command type");
        response.timestamp_ms = 7;
        let json = serde_json::to_string(&response).unwrap();
        assert_eq!(
            json,
            "{\"protocolVersion\":\"1.0\",\"kind\":\"response\",\"commandId\":\"abc\",\"status\":\"rejected\",\"timestampMs\":7,\"errorCode\":\"UNKNOWN_COMMAND\",\"errorMessage\":\"unknown command type\"}"
        );
    }

    #[test]
    fn test_event_shape() {
        let mut data = BTreeMap::new();
        data.insert("amount".to_string(), "1000".to_string());
        let event = Event::new(EventType::PaymentComplete, "payment", data);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"event\""));
        assert!(json.contains("\"eventType\":\"payment_complete\""));
        assert!(json.contains("\"deviceType\":\"payment\""));

        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_event_type_strings() {
        assert_eq!(
            serde_json::to_string(&EventType::CashPaymentTargetReached).unwrap(),
            "\"cash_payment_target_reached\""
        );
        assert_eq!(
            serde_json::to_string(&EventType::SystemStatusCheck).unwrap(),
            "\"system_status_check\""
        );
        assert_eq!(
            serde_json::from_str::<EventType>("\"cash_bill_stacked\"").unwrap(),
            EventType::CashBillStacked
        );
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(serde_json::to_string(&ResponseStatus::Ok).unwrap(), "\"ok\"");
        assert_eq!(
            serde_json::to_string(&ResponseStatus::Rejected).unwrap(),
            "\"rejected\""
        );
        assert_eq!(
            serde_json::from_str::<ResponseStatus>("\"failed\"").unwrap(),
            ResponseStatus::Failed
        );
    }

    #[test]
    fn test_ipc_error_codes() {
        assert_eq!(
            <&'static str>::from(IpcErrorCode::UnknownCommand),
            "UNKNOWN_COMMAND"
        );
        assert_eq!(
            <&'static str>::from(IpcErrorCode::DeviceNotReady),
            "DEVICE_NOT_READY"
        );
        assert_eq!(IpcErrorCode::ParseError.to_string(), "PARSE_ERROR");
    }
}
