use std::{fmt, result};

pub type Result<T> = result::Result<T, Error>;

/// Basic error type for device and IPC operations
#[derive(Clone, Debug, PartialEq)]
pub struct Error {
    code: ErrorCode,
    message: String,
}

impl Error {
    /// Create an Error with an explicit code
    pub fn new<S>(code: ErrorCode, message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Create a generic failure Error
    pub fn failure<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::Failure, message)
    }

    /// Create a serial port failure Error
    pub fn serial<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::SerialPort, message)
    }

    /// Create a timeout Error
    pub fn timeout<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::Timeout, message)
    }

    /// Create a wire-protocol failure Error (framing, BCC, field widths)
    pub fn protocol<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::Protocol, message)
    }

    /// Create an IPC failure Error
    pub fn ipc<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::Ipc, message)
    }

    /// Create a configuration failure Error
    pub fn config<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self::new(ErrorCode::Config, message)
    }

    /// Get the error code
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        self.message.as_str()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code: {}, message: {}", self.code, self.message)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorCode::Failure, format!("I/O error: {err}"))
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Self::new(ErrorCode::Protocol, format!("Utf8 error: {err}"))
    }
}

impl From<serialport::Error> for Error {
    fn from(err: serialport::Error) -> Self {
        Self::new(ErrorCode::SerialPort, format!("Serial port error: {err}"))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorCode::Ipc, format!("JSON error: {err}"))
    }
}

impl<T> From<std::sync::mpsc::SendError<T>> for Error {
    fn from(err: std::sync::mpsc::SendError<T>) -> Self {
        Self::failure(format!("failed to send an item to the queue: {err}"))
    }
}

/// Error codes for failed device and IPC operations
#[repr(i16)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ErrorCode {
    /// Generic failure code
    Failure = -1,
    /// Failure originating from the serial port connection
    SerialPort = -2,
    /// A blocking operation exceeded its deadline
    Timeout = -3,
    /// The peer answered NACK to a request frame
    NackReceived = -4,
    /// Framing, checksum or field-width violation on the wire
    Protocol = -5,
    /// The terminal rejected the transaction
    Rejected = -6,
    /// Rejected on the IC medium; a new campaign needs card removal first
    RejectedWaitingCardRemoval = -7,
    /// The payment campaign ran out of its user-inactivity budget
    UserInactivityTimeout = -8,
    /// Another exchange (typically a campaign) owns the port
    DeviceBusy = -9,
    /// The operation was cancelled by the client
    Cancelled = -10,
    /// The adapter does not implement this capability
    NotSupported = -11,
    /// IPC transport or message failure
    Ipc = -12,
    /// Configuration file failure
    Config = -13,
}

impl From<ErrorCode> for &'static str {
    fn from(e: ErrorCode) -> Self {
        match e {
            ErrorCode::Failure => "failure",
            ErrorCode::SerialPort => "serial port",
            ErrorCode::Timeout => "timeout",
            ErrorCode::NackReceived => "NACK received",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Rejected => "rejected",
            ErrorCode::RejectedWaitingCardRemoval => "rejected, waiting for card removal",
            ErrorCode::UserInactivityTimeout => "user inactivity timeout",
            ErrorCode::DeviceBusy => "device busy",
            ErrorCode::Cancelled => "cancelled",
            ErrorCode::NotSupported => "not supported",
            ErrorCode::Ipc => "IPC",
            ErrorCode::Config => "config",
        }
    }
}

impl From<&ErrorCode> for &'static str {
    fn from(e: &ErrorCode) -> Self {
        (*e).into()
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(self))
    }
}
