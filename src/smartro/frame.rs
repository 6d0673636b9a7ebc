use std::fmt;

use crate::error::{Error, Result};

/// Start byte of a frame
pub const STX: u8 = 0x02;
/// End byte of a frame (precedes the BCC)
pub const ETX: u8 = 0x03;
/// Positive handshake byte
pub const ACK: u8 = 0x06;
/// Negative handshake byte
pub const NACK: u8 = 0x15;

/// Header length, STX through the two data-length bytes.
pub const HEADER_SIZE: usize = 35;
/// ETX + BCC
pub const TAIL_SIZE: usize = 2;
/// A frame with no data section.
pub const MIN_FRAME_SIZE: usize = HEADER_SIZE + TAIL_SIZE;

pub const TERMINAL_ID_LEN: usize = 16;
pub const DATETIME_LEN: usize = 14;

/// Byte offsets inside a frame
pub(crate) mod index {
    pub const STX: usize = 0;
    pub const TERMINAL_ID: usize = 1;
    pub const DATETIME: usize = 17;
    pub const JOB_CODE: usize = 31;
    pub const RESPONSE_CODE: usize = 32;
    pub const DATA_LEN: usize = 33;
    pub const DATA: usize = 35;
}

/// Job codes. Requests are the uppercase letter, responses the matching
/// lowercase; unsolicited terminal events use `@`.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobCode {
    DeviceCheck = b'A',
    PaymentApproval = b'B',
    TransactionCancel = b'C',
    PaymentWait = b'E',
    CardUidRead = b'F',
    LastApproval = b'L',
    IcCardCheck = b'M',
    Reset = b'R',
    ScreenSound = b'S',
    Event = b'@',
}

impl JobCode {
    /// Wire byte of the request form.
    pub fn request_byte(self) -> u8 {
        self as u8
    }

    /// Wire byte of the matching response form.
    pub fn response_byte(self) -> u8 {
        match self {
            Self::Event => b'@',
            other => (other as u8).to_ascii_lowercase(),
        }
    }

    /// Classify a received job-code byte (request or response form).
    pub fn from_wire(byte: u8) -> Option<Self> {
        match byte.to_ascii_uppercase() {
            b'A' => Some(Self::DeviceCheck),
            b'B' => Some(Self::PaymentApproval),
            b'C' => Some(Self::TransactionCancel),
            b'E' => Some(Self::PaymentWait),
            b'F' => Some(Self::CardUidRead),
            b'L' => Some(Self::LastApproval),
            b'M' => Some(Self::IcCardCheck),
            b'R' => Some(Self::Reset),
            b'S' => Some(Self::ScreenSound),
            b'@' => Some(Self::Event),
            _ => None,
        }
    }
}

impl From<JobCode> for &'static str {
    fn from(j: JobCode) -> Self {
        match j {
            JobCode::DeviceCheck => "device check",
            JobCode::PaymentApproval => "payment approval",
            JobCode::TransactionCancel => "transaction cancel",
            JobCode::PaymentWait => "payment wait",
            JobCode::CardUidRead => "card UID read",
            JobCode::LastApproval => "last approval",
            JobCode::IcCardCheck => "IC card check",
            JobCode::Reset => "reset",
            JobCode::ScreenSound => "screen/sound setting",
            JobCode::Event => "event",
        }
    }
}

impl fmt::Display for JobCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Calculate the block check character: XOR of every byte from STX through
/// ETX inclusive.
pub fn bcc(data: &[u8]) -> u8 {
    let mut sum = 0u8;
    data.iter().for_each(|&b| sum ^= b);
    sum
}

pub(crate) fn read_u16_le(bytes: &[u8]) -> u16 {
    u16::from_le_bytes([bytes[0], bytes[1]])
}

pub(crate) fn write_u16_le(value: u16, out: &mut Vec<u8>) {
    out.extend_from_slice(&value.to_le_bytes());
}

/// Left-align an ASCII terminal id into 16 bytes, zero-padded right.
///
/// Non-ASCII ids are out of contract and rejected here rather than silently
/// mangled on the wire.
pub fn format_terminal_id(id: &str) -> Result<[u8; TERMINAL_ID_LEN]> {
    if !id.is_ascii() {
        return Err(Error::protocol(format!("terminal id is not ASCII: {id}")));
    }
    if id.len() > TERMINAL_ID_LEN {
        return Err(Error::protocol(format!(
            "terminal id longer than {TERMINAL_ID_LEN} bytes: {id}"
        )));
    }
    let mut out = [0u8; TERMINAL_ID_LEN];
    out[..id.len()].copy_from_slice(id.as_bytes());
    Ok(out)
}

/// Current wall-clock time as the 14-byte `YYYYMMDDhhmmss` frame field.
pub fn current_datetime() -> [u8; DATETIME_LEN] {
    let now = chrono::Local::now();
    let text = now.format("%Y%m%d%H%M%S").to_string();
    let mut out = [0u8; DATETIME_LEN];
    out.copy_from_slice(text.as_bytes());
    out
}

/// One SMARTRO frame, either direction.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub terminal_id: [u8; TERMINAL_ID_LEN],
    pub datetime: [u8; DATETIME_LEN],
    pub job_code: u8,
    pub response_code: u8,
    pub data: Vec<u8>,
}

impl Frame {
    /// Build a request frame stamped with the current time.
    pub fn request(terminal_id: &str, job: JobCode, data: Vec<u8>) -> Result<Self> {
        Ok(Self {
            terminal_id: format_terminal_id(terminal_id)?,
            datetime: current_datetime(),
            job_code: job.request_byte(),
            response_code: 0,
            data,
        })
    }

    /// Total encoded length: header + data + ETX + BCC.
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.data.len() + TAIL_SIZE
    }

    /// Serialize, appending the BCC over STX..=ETX.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.push(STX);
        out.extend_from_slice(&self.terminal_id);
        out.extend_from_slice(&self.datetime);
        out.push(self.job_code);
        out.push(self.response_code);
        write_u16_le(self.data.len() as u16, &mut out);
        out.extend_from_slice(&self.data);
        out.push(ETX);
        out.push(bcc(&out));
        out
    }

    /// Parse and validate one complete frame.
    ///
    /// Rejects anything with a bad STX/ETX, a length that does not match the
    /// header's data-length field, or a BCC mismatch; the caller answers
    /// NACK for those.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(Error::protocol(format!(
                "frame too short: {} bytes, minimum {MIN_FRAME_SIZE}",
                bytes.len()
            )));
        }
        if bytes[index::STX] != STX {
            return Err(Error::protocol(format!(
                "invalid STX byte: 0x{:02X}",
                bytes[index::STX]
            )));
        }

        let data_len = read_u16_le(&bytes[index::DATA_LEN..index::DATA]) as usize;
        let expected = HEADER_SIZE + data_len + TAIL_SIZE;
        if bytes.len() != expected {
            return Err(Error::protocol(format!(
                "frame length mismatch: {} bytes, header says {expected}",
                bytes.len()
            )));
        }

        let etx_index = HEADER_SIZE + data_len;
        if bytes[etx_index] != ETX {
            return Err(Error::protocol(format!(
                "invalid ETX byte: 0x{:02X}",
                bytes[etx_index]
            )));
        }

        let expected_bcc = bcc(&bytes[..=etx_index]);
        let actual_bcc = bytes[etx_index + 1];
        if expected_bcc != actual_bcc {
            return Err(Error::protocol(format!(
                "BCC mismatch: expected 0x{expected_bcc:02X}, have 0x{actual_bcc:02X}"
            )));
        }

        let mut terminal_id = [0u8; TERMINAL_ID_LEN];
        terminal_id.copy_from_slice(&bytes[index::TERMINAL_ID..index::DATETIME]);
        let mut datetime = [0u8; DATETIME_LEN];
        datetime.copy_from_slice(&bytes[index::DATETIME..index::JOB_CODE]);

        Ok(Self {
            terminal_id,
            datetime,
            job_code: bytes[index::JOB_CODE],
            response_code: bytes[index::RESPONSE_CODE],
            data: bytes[index::DATA..etx_index].to_vec(),
        })
    }

    /// Terminal id with the zero padding stripped.
    pub fn terminal_id_str(&self) -> &str {
        let end = self
            .terminal_id
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(TERMINAL_ID_LEN);
        std::str::from_utf8(&self.terminal_id[..end]).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame(job: JobCode, data: Vec<u8>) -> Frame {
        Frame {
            terminal_id: format_terminal_id("KSK0000001").unwrap(),
            datetime: *b"20250301123456",
            job_code: job.request_byte(),
            response_code: 0,
            data,
        }
    }

    #[test]
    fn test_bcc_self_cancelling() {
        // bcc(s || bcc(s)) == 0 for any byte sequence
        let cases: &[&[u8]] = &[&[], &[0x00], &[0x02, 0x03], &[0xff, 0x10, 0x42, 0x99]];
        for s in cases {
            let mut with_bcc = s.to_vec();
            with_bcc.push(bcc(s));
            assert_eq!(bcc(&with_bcc), 0);
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frame = sample_frame(JobCode::PaymentApproval, b"1000000100000".to_vec());
        let bytes = frame.encode();
        let parsed = Frame::decode(&bytes).unwrap();
        assert_eq!(parsed, frame);
    }

    #[test]
    fn test_roundtrip_empty_data() {
        let frame = sample_frame(JobCode::DeviceCheck, Vec::new());
        let bytes = frame.encode();
        assert_eq!(bytes.len(), MIN_FRAME_SIZE);
        assert_eq!(Frame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_frame_length_law() {
        for data_len in [0usize, 1, 4, 30, 157] {
            let frame = sample_frame(JobCode::PaymentApproval, vec![b'0'; data_len]);
            let bytes = frame.encode();
            let header_len = read_u16_le(&bytes[index::DATA_LEN..index::DATA]) as usize;
            assert_eq!(bytes.len(), HEADER_SIZE + header_len + TAIL_SIZE);
        }
    }

    #[test]
    fn test_decode_rejects_bad_bcc() {
        let mut bytes = sample_frame(JobCode::Reset, Vec::new()).encode();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_bad_etx() {
        let mut bytes = sample_frame(JobCode::Reset, Vec::new()).encode();
        let etx = bytes.len() - 2;
        bytes[etx] = 0x00;
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_decode_rejects_truncated() {
        let bytes = sample_frame(JobCode::DeviceCheck, vec![b'X'; 4]).encode();
        assert!(Frame::decode(&bytes[..bytes.len() - 3]).is_err());
        assert!(Frame::decode(&[STX]).is_err());
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        // Claim 4 data bytes but carry 2
        let mut bytes = sample_frame(JobCode::DeviceCheck, vec![b'N', b'O']).encode();
        bytes[index::DATA_LEN] = 4;
        assert!(Frame::decode(&bytes).is_err());
    }

    #[test]
    fn test_terminal_id_padding() {
        let id = format_terminal_id("AB").unwrap();
        assert_eq!(&id[..2], b"AB");
        assert!(id[2..].iter().all(|&b| b == 0));

        assert!(format_terminal_id("0123456789ABCDEFG").is_err());
        assert!(format_terminal_id("café").is_err());
    }

    #[test]
    fn test_job_code_wire_forms() {
        assert_eq!(JobCode::PaymentApproval.request_byte(), b'B');
        assert_eq!(JobCode::PaymentApproval.response_byte(), b'b');
        assert_eq!(JobCode::Event.response_byte(), b'@');
        assert_eq!(JobCode::from_wire(b'b'), Some(JobCode::PaymentApproval));
        assert_eq!(JobCode::from_wire(b'A'), Some(JobCode::DeviceCheck));
        assert_eq!(JobCode::from_wire(b'@'), Some(JobCode::Event));
        assert_eq!(JobCode::from_wire(b'z'), None);
    }

    #[test]
    fn test_terminal_id_str() {
        let frame = sample_frame(JobCode::Reset, Vec::new());
        assert_eq!(frame.terminal_id_str(), "KSK0000001");
    }
}
