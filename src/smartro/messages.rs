use std::fmt;

use crate::device::terminal::TransactionCancelRequest;
use crate::device::ScreenSoundSettings;
use crate::error::{Error, Result};

/// Mandatory length of an approval/cancel/last-approval response.
///
/// Fields through the rejection info always arrive; the 20-byte acquirer
/// tail is omitted by some firmware revisions and parsed when present.
pub const APPROVAL_DETAIL_LEN: usize = 157;
/// Length including the acquirer tail.
pub const APPROVAL_DETAIL_FULL_LEN: usize = 177;
/// Length of an encoded approval request data section.
pub const APPROVAL_REQUEST_LEN: usize = 30;
/// Base length of an encoded transaction-cancel data section.
pub const CANCEL_REQUEST_BASE_LEN: usize = 57;

/// Status of one module in a device-check response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModuleStatus {
    /// `O`: operating
    Ok,
    /// `N`: not installed / not applicable
    NotApplicable,
    /// `X`: faulted
    Fault,
    /// `F`: hard failure
    Failure,
    Unknown,
}

impl From<u8> for ModuleStatus {
    fn from(b: u8) -> Self {
        match b {
            b'O' => Self::Ok,
            b'N' => Self::NotApplicable,
            b'X' => Self::Fault,
            b'F' => Self::Failure,
            _ => Self::Unknown,
        }
    }
}

impl From<ModuleStatus> for u8 {
    fn from(s: ModuleStatus) -> Self {
        match s {
            ModuleStatus::Ok => b'O',
            ModuleStatus::NotApplicable => b'N',
            ModuleStatus::Fault => b'X',
            ModuleStatus::Failure => b'F',
            ModuleStatus::Unknown => b'?',
        }
    }
}

impl ModuleStatus {
    /// A module counts as healthy when operating or absent by design.
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Ok | Self::NotApplicable)
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u8::from(*self) as char)
    }
}

/// Parsed `a` (device check) response data.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DeviceCheckStatus {
    pub card_module: ModuleStatus,
    pub rf_module: ModuleStatus,
    pub van_server: ModuleStatus,
    pub integration_server: ModuleStatus,
}

impl DeviceCheckStatus {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::protocol(format!(
                "device check response too short: {} bytes, expected 4",
                data.len()
            )));
        }
        Ok(Self {
            card_module: data[0].into(),
            rf_module: data[1].into(),
            van_server: data[2].into(),
            integration_server: data[3].into(),
        })
    }

    pub fn all_healthy(&self) -> bool {
        self.card_module.is_healthy()
            && self.rf_module.is_healthy()
            && self.van_server.is_healthy()
            && self.integration_server.is_healthy()
    }
}

impl fmt::Display for DeviceCheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "card={}, rf={}, van={}, integration={}",
            self.card_module, self.rf_module, self.van_server, self.integration_server
        )
    }
}

fn push_zero_padded(out: &mut Vec<u8>, value: u32, width: usize) {
    let digits = value.to_string();
    for _ in digits.len()..width {
        out.push(b'0');
    }
    // A value wider than the field is clipped to its low-order digits.
    let start = digits.len().saturating_sub(width);
    out.extend_from_slice(&digits.as_bytes()[start..]);
}

fn push_fixed_ascii(out: &mut Vec<u8>, text: &str, width: usize, pad: u8) {
    let bytes = text.as_bytes();
    let take = bytes.len().min(width);
    out.extend_from_slice(&bytes[..take]);
    for _ in take..width {
        out.push(pad);
    }
}

fn take_str(data: &[u8], start: usize, len: usize) -> String {
    let end = (start + len).min(data.len());
    if start >= end {
        return String::new();
    }
    String::from_utf8_lossy(&data[start..end])
        .trim_matches(|c: char| c == '\0' || c.is_ascii_whitespace())
        .to_string()
}

/// `B` (payment approval) request data, 30 bytes on the wire.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ApprovalRequest {
    /// `1` approval, `2` last-transaction cancellation
    pub transaction_type: u8,
    /// Amount in KRW
    pub amount: u32,
    pub tax: u32,
    pub service: u32,
    /// Installment months, `0` for lump sum
    pub installments: u8,
    /// `1` no signature, `2` signature required
    pub signature_required: u8,
}

impl ApprovalRequest {
    pub fn approval(amount: u32) -> Self {
        Self {
            transaction_type: b'1',
            amount,
            tax: 0,
            service: 0,
            installments: 0,
            signature_required: b'1',
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(APPROVAL_REQUEST_LEN);
        out.push(self.transaction_type);
        push_zero_padded(&mut out, self.amount, 10);
        push_zero_padded(&mut out, self.tax, 8);
        push_zero_padded(&mut out, self.service, 8);
        push_zero_padded(&mut out, self.installments as u32, 2);
        out.push(self.signature_required);
        out
    }
}

/// Parsed approval detail, shared by the `b`, `c` and `l` responses.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ApprovalDetail {
    /// `1`..`6` approved kinds, `X`/`x` rejected
    pub transaction_type: u8,
    /// `1` IC, `2` MS, `3` RF, `4` QR, `5` KEYIN
    pub transaction_medium: u8,
    pub card_number: String,
    pub approval_amount: String,
    pub tax: String,
    pub service_charge: String,
    pub installments: String,
    pub approval_number: String,
    pub sales_date: String,
    pub sales_time: String,
    pub transaction_id: String,
    pub merchant_number: String,
    pub terminal_number: String,
    pub issuer: String,
    pub rejection_info: String,
    pub acquirer: String,
}

impl ApprovalDetail {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < APPROVAL_DETAIL_LEN {
            return Err(Error::protocol(format!(
                "approval response too short: {} bytes, expected {APPROVAL_DETAIL_LEN}",
                data.len()
            )));
        }

        Ok(Self {
            transaction_type: data[0],
            transaction_medium: data[1],
            card_number: take_str(data, 2, 20),
            approval_amount: take_str(data, 22, 10),
            tax: take_str(data, 32, 8),
            service_charge: take_str(data, 40, 8),
            installments: take_str(data, 48, 2),
            approval_number: take_str(data, 50, 12),
            sales_date: take_str(data, 62, 8),
            sales_time: take_str(data, 70, 6),
            transaction_id: take_str(data, 76, 12),
            merchant_number: take_str(data, 88, 15),
            terminal_number: take_str(data, 103, 14),
            issuer: take_str(data, 117, 20),
            rejection_info: take_str(data, 137, 20),
            acquirer: take_str(data, 157, 20),
        })
    }

    pub fn is_rejected(&self) -> bool {
        self.transaction_type == b'X' || self.transaction_type == b'x'
    }

    /// Human label for the approved transaction type byte.
    pub fn transaction_type_label(&self) -> &'static str {
        match self.transaction_type {
            b'1' => "Credit Approval",
            b'2' => "Cash Receipt",
            b'3' => "Prepaid",
            b'4' => "Zero Pay",
            b'5' => "Kakao Mini",
            b'6' => "Kakao Credit",
            b'X' | b'x' => "Rejected",
            _ => "Unknown",
        }
    }
}

/// Encode the `C` (transaction cancel) data section: 57 bytes, plus
/// `2 + N` when additional PG info rides along.
pub fn encode_cancel_request(request: &TransactionCancelRequest) -> Vec<u8> {
    let additional = request.additional_info.as_bytes();
    let mut out = Vec::with_capacity(CANCEL_REQUEST_BASE_LEN + 2 + additional.len());

    out.push(*request.cancel_type.as_bytes().first().unwrap_or(&b'2'));
    push_fixed_ascii(&mut out, &request.transaction_type, 2, b'0');
    push_zero_padded(&mut out, request.amount, 10);
    push_zero_padded(&mut out, request.tax, 8);
    push_zero_padded(&mut out, request.service, 8);
    push_zero_padded(&mut out, request.installments as u32, 2);
    push_fixed_ascii(&mut out, &request.approval_number, 12, b' ');
    push_fixed_ascii(&mut out, &request.original_date, 8, b'0');
    push_fixed_ascii(&mut out, &request.original_time, 6, b'0');

    if !additional.is_empty() {
        push_zero_padded(&mut out, additional.len() as u32, 2);
        out.extend_from_slice(additional);
    }

    out
}

/// Encode the `S` (screen/sound) data section: three ASCII digits.
pub fn encode_screen_sound(settings: &ScreenSoundSettings) -> Vec<u8> {
    vec![
        b'0' + settings.brightness.min(9),
        b'0' + settings.volume.min(9),
        b'0' + settings.touch_volume.min(9),
    ]
}

/// Parse the `s` echo back into settings.
pub fn parse_screen_sound(data: &[u8]) -> Result<ScreenSoundSettings> {
    if data.len() < 3 {
        return Err(Error::protocol(format!(
            "screen/sound response too short: {} bytes, expected 3",
            data.len()
        )));
    }
    Ok(ScreenSoundSettings {
        brightness: data[0].wrapping_sub(b'0'),
        volume: data[1].wrapping_sub(b'0'),
        touch_volume: data[2].wrapping_sub(b'0'),
    })
}

/// Parse the `m` (IC card check) response byte: `O` inserted, `X` not.
pub fn parse_ic_card(data: &[u8]) -> Result<bool> {
    match data.first() {
        Some(b'O') => Ok(true),
        Some(b'X') => Ok(false),
        Some(other) => Err(Error::protocol(format!(
            "unexpected IC card status byte: 0x{other:02X}"
        ))),
        None => Err(Error::protocol("empty IC card check response")),
    }
}

/// Unsolicited `@` notices from the terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    MsCardDetected,
    RfCardDetected,
    IcCardInserted,
    IcCardRemoved,
    IcCardFallback,
    Unknown,
}

impl From<u8> for EventKind {
    fn from(b: u8) -> Self {
        match b {
            b'M' => Self::MsCardDetected,
            b'R' => Self::RfCardDetected,
            b'I' => Self::IcCardInserted,
            b'O' => Self::IcCardRemoved,
            b'F' => Self::IcCardFallback,
            _ => Self::Unknown,
        }
    }
}

impl From<EventKind> for &'static str {
    fn from(k: EventKind) -> Self {
        match k {
            EventKind::MsCardDetected => "MS card detected",
            EventKind::RfCardDetected => "RF card detected",
            EventKind::IcCardInserted => "IC card inserted",
            EventKind::IcCardRemoved => "IC card removed",
            EventKind::IcCardFallback => "IC card fallback",
            EventKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// One unsolicited terminal notice. The device expects no reply.
#[derive(Clone, Debug, PartialEq)]
pub struct EventNotice {
    pub kind: EventKind,
    pub data: Vec<u8>,
}
