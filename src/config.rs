use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default configuration file name, resolved next to the executable when no
/// explicit path is given.
pub const CONFIG_FILE_NAME: &str = "config.ini";

/// Paper size accepted by the printer surface
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PaperSize {
    A4,
    FourBySix,
}

impl From<PaperSize> for &'static str {
    fn from(p: PaperSize) -> Self {
        match p {
            PaperSize::A4 => "A4",
            PaperSize::FourBySix => "4x6",
        }
    }
}

impl From<&str> for PaperSize {
    fn from(s: &str) -> Self {
        match s {
            "A4" | "a4" => Self::A4,
            _ => Self::FourBySix,
        }
    }
}

impl std::fmt::Display for PaperSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Daemon configuration backed by a small `key=value` file.
///
/// Lines starting with `#` or `;` are comments. Unknown keys are rejected by
/// [`Config::apply`] so client typos surface as errors instead of silently
/// vanishing into the file.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    camera_save_path: String,
    printer_name: String,
    printer_paper_size: PaperSize,
    printer_margin_h: i32,
    printer_margin_v: i32,
    payment_com_port: String,
    payment_enabled: bool,
    cash_com_port: String,
    cash_enabled: bool,
    path: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_save_path: String::new(),
            printer_name: String::new(),
            printer_paper_size: PaperSize::FourBySix,
            printer_margin_h: 0,
            printer_margin_v: 0,
            payment_com_port: String::new(),
            payment_enabled: true,
            cash_com_port: String::new(),
            cash_enabled: true,
            path: None,
        }
    }
}

/// Parse a config boolean: `1`, `true` and `yes` are truthy.
pub fn parse_bool(value: &str) -> bool {
    matches!(value, "1" | "true" | "yes")
}

impl Config {
    /// Load from `path`. A missing file yields defaults bound to that path so
    /// the first `save` creates it.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self {
            path: Some(path.to_path_buf()),
            ..Self::default()
        };

        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(config),
            Err(err) => return Err(Error::config(format!("failed to read config: {err}"))),
        };

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                log::warn!("config: ignoring malformed line: {line}");
                continue;
            };
            config.set_known(key.trim(), value.trim());
        }

        Ok(config)
    }

    /// Re-read the backing file if one is bound and it exists.
    pub fn reload(&mut self) -> Result<()> {
        if let Some(path) = self.path.clone() {
            if path.exists() {
                *self = Self::load(path)?;
            }
        }
        Ok(())
    }

    /// Write all keys back to the bound path.
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Err(Error::config("config has no backing path"));
        };
        let mut file =
            fs::File::create(path).map_err(|e| Error::config(format!("create config: {e}")))?;
        for (key, value) in self.snapshot() {
            writeln!(file, "{key}={value}")
                .map_err(|e| Error::config(format!("write config: {e}")))?;
        }
        Ok(())
    }

    /// All keys and their canonical string values, in stable order.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("camera.save_path".into(), self.camera_save_path.clone());
        m.insert("printer.name".into(), self.printer_name.clone());
        m.insert(
            "printer.paper_size".into(),
            self.printer_paper_size.to_string(),
        );
        m.insert("printer.margin_h".into(), self.printer_margin_h.to_string());
        m.insert("printer.margin_v".into(), self.printer_margin_v.to_string());
        m.insert("payment.com_port".into(), self.payment_com_port.clone());
        m.insert(
            "payment.enabled".into(),
            if self.payment_enabled { "1" } else { "0" }.into(),
        );
        m.insert("cash.com_port".into(), self.cash_com_port.clone());
        m.insert(
            "cash.enabled".into(),
            if self.cash_enabled { "1" } else { "0" }.into(),
        );
        m
    }

    /// Apply a client-supplied key/value mapping. Fails on the first unknown
    /// key without applying it; previously applied keys stick.
    pub fn apply(&mut self, values: &BTreeMap<String, String>) -> Result<()> {
        for (key, value) in values {
            if !self.set_known(key, value) {
                return Err(Error::config(format!("unknown config key: {key}")));
            }
        }
        Ok(())
    }

    fn set_known(&mut self, key: &str, value: &str) -> bool {
        match key {
            "camera.save_path" => self.camera_save_path = value.into(),
            "printer.name" => self.printer_name = value.into(),
            "printer.paper_size" => self.printer_paper_size = value.into(),
            "printer.margin_h" => self.printer_margin_h = value.parse().unwrap_or(0),
            "printer.margin_v" => self.printer_margin_v = value.parse().unwrap_or(0),
            "payment.com_port" => self.payment_com_port = value.into(),
            "payment.enabled" => self.payment_enabled = parse_bool(value),
            "cash.com_port" => self.cash_com_port = value.into(),
            "cash.enabled" => self.cash_enabled = parse_bool(value),
            _ => return false,
        }
        true
    }

    pub fn camera_save_path(&self) -> &str {
        &self.camera_save_path
    }

    pub fn printer_name(&self) -> &str {
        &self.printer_name
    }

    pub fn printer_paper_size(&self) -> PaperSize {
        self.printer_paper_size
    }

    pub fn printer_margins(&self) -> (i32, i32) {
        (self.printer_margin_h, self.printer_margin_v)
    }

    pub fn payment_com_port(&self) -> &str {
        &self.payment_com_port
    }

    pub fn payment_enabled(&self) -> bool {
        self.payment_enabled
    }

    pub fn cash_com_port(&self) -> &str {
        &self.cash_com_port
    }

    pub fn cash_enabled(&self) -> bool {
        self.cash_enabled
    }
}

/// Check whether a feature key is enabled, letting a command payload override
/// the config value. Used by `detect_hardware`.
pub fn is_enabled(
    payload: &BTreeMap<String, String>,
    config: &BTreeMap<String, String>,
    key: &str,
) -> bool {
    if let Some(v) = payload.get(key) {
        if !v.is_empty() {
            return parse_bool(v);
        }
    }
    config.get(key).map(|v| parse_bool(v)).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("1"));
        assert!(parse_bool("true"));
        assert!(parse_bool("yes"));
        assert!(!parse_bool("0"));
        assert!(!parse_bool("no"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.payment_enabled());
        assert!(config.cash_enabled());
        assert_eq!(config.printer_paper_size(), PaperSize::FourBySix);
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut config = Config::default();
        let mut values = BTreeMap::new();
        values.insert("payment.com_port".to_string(), "COM7".to_string());
        values.insert("cash.enabled".to_string(), "0".to_string());
        values.insert("printer.paper_size".to_string(), "A4".to_string());
        config.apply(&values).unwrap();

        let snap = config.snapshot();
        assert_eq!(snap["payment.com_port"], "COM7");
        assert_eq!(snap["cash.enabled"], "0");
        assert_eq!(snap["printer.paper_size"], "A4");
        assert_eq!(snap.len(), 9);
    }

    #[test]
    fn test_apply_unknown_key() {
        let mut config = Config::default();
        let mut values = BTreeMap::new();
        values.insert("launch.rockets".to_string(), "1".to_string());
        assert!(config.apply(&values).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/dir/config.ini").unwrap();
        assert_eq!(config.payment_com_port(), "");
    }

    #[test]
    fn test_load_parses_comments_and_values() {
        let dir = std::env::temp_dir().join("kiosk-hal-config-test");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.ini");
        fs::write(
            &path,
            "# comment\n; also comment\npayment.com_port=COM3\ncash.enabled=yes\nbroken line\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.payment_com_port(), "COM3");
        assert!(config.cash_enabled());

        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_is_enabled_payload_overrides_config() {
        let mut payload = BTreeMap::new();
        let mut config = BTreeMap::new();
        config.insert("payment.enabled".to_string(), "1".to_string());
        assert!(is_enabled(&payload, &config, "payment.enabled"));

        payload.insert("payment.enabled".to_string(), "0".to_string());
        assert!(!is_enabled(&payload, &config, "payment.enabled"));
    }
}
