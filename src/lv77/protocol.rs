//! LV77 wire bytes. Host-to-device messages are one byte; device-to-host
//! replies are one byte except bill-validated, which carries a bill-type
//! byte behind it.

// ---- Host -> device ----
/// Sent within 2 s of power-up; also the escrow accept command
pub const CMD_SYNC_ACK: u8 = 0x02;
pub const CMD_POLL_STATUS: u8 = 0x0C;
/// Reject the bill held in escrow
pub const CMD_REJECT_BILL: u8 = 0x0F;
pub const CMD_ACCEPT_STACK: u8 = 0x10;
pub const CMD_REJECT_STACK: u8 = 0x11;
pub const CMD_HOLD_ESCROW: u8 = 0x18;
pub const CMD_RESET: u8 = 0x30;
pub const CMD_ENABLE: u8 = 0x3E;
pub const CMD_DISABLE: u8 = 0x5E;
pub const CMD_ESCROW_HOLD: u8 = 0x5A;

// ---- Device -> host ----
pub const RSP_POWER_UP: u8 = 0x80;
pub const RSP_SYNC_OK: u8 = 0x8F;
/// Bill in escrow; the next byte is the bill type
pub const RSP_BILL_VALIDATED: u8 = 0x81;
pub const RSP_BILL_TYPE_FIRST: u8 = 0x40;
pub const RSP_BILL_TYPE_LAST: u8 = 0x44;
pub const RSP_STACKING: u8 = 0x10;
pub const RSP_REJECT: u8 = 0x11;

pub const STATUS_RESTART: u8 = 0x20;
pub const STATUS_MOTOR_FAILURE: u8 = 0x21;
pub const STATUS_CHECKSUM_ERROR: u8 = 0x22;
pub const STATUS_BILL_JAM: u8 = 0x23;
pub const STATUS_BILL_REMOVE: u8 = 0x24;
pub const STATUS_STACKER_OPEN: u8 = 0x25;
pub const STATUS_SENSOR_PROBLEM: u8 = 0x27;
pub const STATUS_BILL_FISH: u8 = 0x28;
pub const STATUS_STACKER_PROBLEM: u8 = 0x29;
pub const STATUS_BILL_REJECT: u8 = 0x2A;
pub const STATUS_INVALID_COMMAND: u8 = 0x2B;
pub const STATUS_ENABLED: u8 = 0x3E;
pub const STATUS_INHIBITED: u8 = 0x5E;

/// KRW value of a bill-type code. `0x43`/`0x44` decode but are unaccepted in
/// this deployment, so their value only shows up in logs.
pub fn bill_code_amount(code: u8) -> u32 {
    match code {
        0x40 => 1_000,
        0x41 => 5_000,
        0x42 => 10_000,
        0x43 => 50_000,
        0x44 => 100_000,
        _ => 0,
    }
}

pub fn is_bill_type(code: u8) -> bool {
    (RSP_BILL_TYPE_FIRST..=RSP_BILL_TYPE_LAST).contains(&code)
}

/// Only the first three types are accepted (1 000 / 5 000 / 10 000 KRW).
pub fn is_accepted_bill_type(code: u8) -> bool {
    matches!(code, 0x40 | 0x41 | 0x42)
}

pub fn status_string(code: u8) -> String {
    match code {
        STATUS_RESTART => "Restart".to_string(),
        STATUS_MOTOR_FAILURE => "Motor Failure".to_string(),
        STATUS_CHECKSUM_ERROR => "Checksum Error".to_string(),
        STATUS_BILL_JAM => "Bill Jam".to_string(),
        STATUS_BILL_REMOVE => "Bill Remove".to_string(),
        STATUS_STACKER_OPEN => "Stacker Open".to_string(),
        STATUS_SENSOR_PROBLEM => "Sensor Problem".to_string(),
        STATUS_BILL_FISH => "Bill Fish".to_string(),
        STATUS_STACKER_PROBLEM => "Stacker Problem".to_string(),
        STATUS_BILL_REJECT => "Bill Reject".to_string(),
        STATUS_INVALID_COMMAND => "Invalid Command".to_string(),
        STATUS_ENABLED => "Enabled".to_string(),
        STATUS_INHIBITED => "Inhibited".to_string(),
        other => format!("Unknown(0x{other:02X})"),
    }
}

/// Jam and error codes reported through the status callback.
pub fn is_fault_status(code: u8) -> bool {
    (0x20..=0x2B).contains(&code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bill_table() {
        assert_eq!(bill_code_amount(0x40), 1_000);
        assert_eq!(bill_code_amount(0x41), 5_000);
        assert_eq!(bill_code_amount(0x42), 10_000);
        assert_eq!(bill_code_amount(0x43), 50_000);
        assert_eq!(bill_code_amount(0x44), 100_000);
        assert_eq!(bill_code_amount(0x45), 0);
    }

    #[test]
    fn test_accepted_subset() {
        assert!(is_accepted_bill_type(0x40));
        assert!(is_accepted_bill_type(0x41));
        assert!(is_accepted_bill_type(0x42));
        assert!(!is_accepted_bill_type(0x43));
        assert!(!is_accepted_bill_type(0x44));
        assert!(is_bill_type(0x43));
        assert!(!is_bill_type(0x3f));
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(status_string(STATUS_BILL_JAM), "Bill Jam");
        assert_eq!(status_string(0x7f), "Unknown(0x7F)");
        assert!(is_fault_status(STATUS_MOTOR_FAILURE));
        assert!(!is_fault_status(STATUS_ENABLED));
    }
}
