use std::fmt;
use std::sync::{Arc, Mutex};

use crate::device::terminal::PaymentTerminal;

/// Category a vendor probe belongs to, so card detection never claims the
/// cash device's port and vice versa.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceCategory {
    Card,
    Cash,
}

impl From<DeviceCategory> for &'static str {
    fn from(c: DeviceCategory) -> Self {
        match c {
            DeviceCategory::Card => "card",
            DeviceCategory::Cash => "cash",
        }
    }
}

impl fmt::Display for DeviceCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

type TryPortFn = Box<dyn Fn(&str) -> bool + Send + Sync>;
type CreateFn = Box<dyn Fn(&str, &str) -> Arc<dyn PaymentTerminal> + Send + Sync>;

/// One vendor's probe + create pair.
pub struct VendorProbe {
    pub vendor: &'static str,
    pub category: DeviceCategory,
    /// Returns true when a terminal of this vendor answers on the port.
    pub try_port: TryPortFn,
    /// Builds an adapter for `(device_id, port)`.
    pub create: CreateFn,
}

/// Registry of vendor probes used for hardware auto-detection.
///
/// Mutated only at startup (and cleared in tests); read under the lock on
/// every detection attempt. The factory never retries a port and never
/// remembers failures.
#[derive(Default)]
pub struct TerminalFactory {
    vendors: Mutex<Vec<VendorProbe>>,
}

impl TerminalFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a vendor probe. Registration order is probe order.
    pub fn register(&self, probe: VendorProbe) {
        log::info!("factory: registered vendor {} ({})", probe.vendor, probe.category);
        self.vendors.lock().unwrap().push(probe);
    }

    /// Ordered list of registered vendor names.
    pub fn vendor_names(&self) -> Vec<&'static str> {
        self.vendors.lock().unwrap().iter().map(|p| p.vendor).collect()
    }

    /// Drop all registered vendors.
    pub fn clear(&self) {
        self.vendors.lock().unwrap().clear();
    }

    /// Try every registered vendor of `category` on `port`; the first whose
    /// probe answers wins.
    pub fn create_for_port(
        &self,
        device_id: &str,
        port: &str,
        category: Option<DeviceCategory>,
    ) -> Option<(&'static str, Arc<dyn PaymentTerminal>)> {
        let vendors = self.vendors.lock().unwrap();
        for probe in vendors.iter() {
            if let Some(wanted) = category {
                if probe.category != wanted {
                    continue;
                }
            }
            log::debug!("factory: probing {} on {port}", probe.vendor);
            if (probe.try_port)(port) {
                log::info!("factory: {} answered on {port}", probe.vendor);
                return Some((probe.vendor, (probe.create)(device_id, port)));
            }
        }
        None
    }

    /// Scan `ports` in order, skipping `exclude_port`, and return the first
    /// `(vendor, adapter)` pair that answers.
    pub fn detect_on_ports(
        &self,
        device_id: &str,
        ports: &[String],
        exclude_port: &str,
        category: Option<DeviceCategory>,
    ) -> Option<(&'static str, Arc<dyn PaymentTerminal>)> {
        for port in ports {
            if !exclude_port.is_empty() && port == exclude_port {
                log::debug!("factory: skipping excluded port {port}");
                continue;
            }
            if let Some(found) = self.create_for_port(device_id, port, category) {
                return Some(found);
            }
        }
        None
    }
}
