/// Log prefix used by the SMARTRO card-terminal engine
pub const CARD_LOG_PREFIX: &str = "SMARTRO";
/// Log prefix used by the LV77 bill-validator engine
pub const CASH_LOG_PREFIX: &str = "LV77";
/// Log prefix used by the IPC server
pub const IPC_LOG_PREFIX: &str = "IPC";

#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogLevel {
    Off = 0,
    Critical,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<u32> for LogLevel {
    fn from(level: u32) -> Self {
        match level {
            0 => Self::Off,
            1 => Self::Critical,
            2 => Self::Error,
            3 => Self::Warn,
            4 => Self::Info,
            5 => Self::Debug,
            6 => Self::Trace,
            _ => Self::Off,
        }
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Critical | LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

/// Format a byte slice as space-separated hex for trace logs.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, b) in bytes.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{b:02X}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_from_u32() {
        assert_eq!(LogLevel::from(0), LogLevel::Off);
        assert_eq!(LogLevel::from(4), LogLevel::Info);
        assert_eq!(LogLevel::from(99), LogLevel::Off);
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x02, 0xff, 0x0a]), "02 FF 0A");
        assert_eq!(hex_dump(&[]), "");
    }
}
