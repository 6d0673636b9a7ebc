use std::sync::{Arc, Mutex};

use crate::camera::Camera;
use crate::device::terminal::PaymentTerminal;
use crate::device::{DeviceInfo, DeviceType};
use crate::printer::Printer;

#[derive(Default)]
struct Inner {
    // Insertion order is meaningful: get-default returns the first
    // registered device of a kind.
    terminals: Vec<(String, Arc<dyn PaymentTerminal>)>,
    printers: Vec<(String, Arc<dyn Printer>)>,
    cameras: Vec<(String, Arc<dyn Camera>)>,
}

/// Process-wide store of device adapters keyed by device id.
///
/// All mutation happens under one lock; lookups clone the shared handle out
/// before returning so the lock is never held across adapter calls or
/// callbacks.
#[derive(Default)]
pub struct DeviceManager {
    inner: Mutex<Inner>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payment terminal; re-registering an id replaces the
    /// adapter in place.
    pub fn register_payment_terminal(&self, device_id: &str, terminal: Arc<dyn PaymentTerminal>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.terminals.iter_mut().find(|(id, _)| id == device_id) {
            slot.1 = terminal;
        } else {
            inner.terminals.push((device_id.to_string(), terminal));
        }
        log::info!("device manager: registered payment terminal {device_id}");
    }

    pub fn register_printer(&self, device_id: &str, printer: Arc<dyn Printer>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.printers.iter_mut().find(|(id, _)| id == device_id) {
            slot.1 = printer;
        } else {
            inner.printers.push((device_id.to_string(), printer));
        }
        log::info!("device manager: registered printer {device_id}");
    }

    pub fn register_camera(&self, device_id: &str, camera: Arc<dyn Camera>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.cameras.iter_mut().find(|(id, _)| id == device_id) {
            slot.1 = camera;
        } else {
            inner.cameras.push((device_id.to_string(), camera));
        }
        log::info!("device manager: registered camera {device_id}");
    }

    pub fn payment_terminal(&self, device_id: &str) -> Option<Arc<dyn PaymentTerminal>> {
        let inner = self.inner.lock().unwrap();
        inner
            .terminals
            .iter()
            .find(|(id, _)| id == device_id)
            .map(|(_, t)| Arc::clone(t))
    }

    pub fn printer(&self, device_id: &str) -> Option<Arc<dyn Printer>> {
        let inner = self.inner.lock().unwrap();
        inner
            .printers
            .iter()
            .find(|(id, _)| id == device_id)
            .map(|(_, p)| Arc::clone(p))
    }

    pub fn camera(&self, device_id: &str) -> Option<Arc<dyn Camera>> {
        let inner = self.inner.lock().unwrap();
        inner
            .cameras
            .iter()
            .find(|(id, _)| id == device_id)
            .map(|(_, c)| Arc::clone(c))
    }

    /// First payment terminal by insertion order.
    pub fn default_payment_terminal(&self) -> Option<Arc<dyn PaymentTerminal>> {
        let inner = self.inner.lock().unwrap();
        inner.terminals.first().map(|(_, t)| Arc::clone(t))
    }

    pub fn default_printer(&self) -> Option<Arc<dyn Printer>> {
        let inner = self.inner.lock().unwrap();
        inner.printers.first().map(|(_, p)| Arc::clone(p))
    }

    pub fn default_camera(&self) -> Option<Arc<dyn Camera>> {
        let inner = self.inner.lock().unwrap();
        inner.cameras.first().map(|(_, c)| Arc::clone(c))
    }

    /// Device ids of one kind, in insertion order.
    pub fn device_ids(&self, device_type: DeviceType) -> Vec<String> {
        let inner = self.inner.lock().unwrap();
        match device_type {
            DeviceType::Payment => inner.terminals.iter().map(|(id, _)| id.clone()).collect(),
            DeviceType::Printer => inner.printers.iter().map(|(id, _)| id.clone()).collect(),
            DeviceType::Camera => inner.cameras.iter().map(|(id, _)| id.clone()).collect(),
        }
    }

    /// Snapshot of every registered device.
    ///
    /// Handles are cloned out of the lock first so `device_info` calls (which
    /// may take adapter locks) cannot deadlock against registration.
    pub fn all_device_info(&self) -> Vec<DeviceInfo> {
        let (terminals, printers, cameras) = {
            let inner = self.inner.lock().unwrap();
            (
                inner
                    .terminals
                    .iter()
                    .map(|(_, t)| Arc::clone(t))
                    .collect::<Vec<_>>(),
                inner
                    .printers
                    .iter()
                    .map(|(_, p)| Arc::clone(p))
                    .collect::<Vec<_>>(),
                inner
                    .cameras
                    .iter()
                    .map(|(_, c)| Arc::clone(c))
                    .collect::<Vec<_>>(),
            )
        };

        let mut infos = Vec::new();
        infos.extend(terminals.iter().map(|t| t.device_info()));
        infos.extend(printers.iter().map(|p| p.device_info()));
        infos.extend(cameras.iter().map(|c| c.device_info()));
        infos
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::terminal::{
        PaymentCancelledCallback, PaymentCompleteCallback, PaymentFailedCallback,
        StateChangedCallback,
    };
    use crate::device::DeviceState;
    use crate::error::Result;

    struct NamedTerminal(&'static str);

    impl PaymentTerminal for NamedTerminal {
        fn device_info(&self) -> DeviceInfo {
            let mut info = DeviceInfo::new(self.0, DeviceType::Payment, self.0);
            info.state = DeviceState::Ready;
            info
        }

        fn start_payment(&self, _amount: u32) -> Result<()> {
            Ok(())
        }

        fn cancel_payment(&self) -> Result<()> {
            Ok(())
        }

        fn state(&self) -> DeviceState {
            DeviceState::Ready
        }

        fn reset(&self) -> Result<()> {
            Ok(())
        }

        fn check_device(&self) -> Result<()> {
            Ok(())
        }

        fn vendor_name(&self) -> &'static str {
            self.0
        }

        fn com_port(&self) -> String {
            String::new()
        }

        fn reconnect(&self, _new_port: &str) -> Result<()> {
            Ok(())
        }

        fn set_payment_complete_callback(&self, _callback: PaymentCompleteCallback) {}
        fn set_payment_failed_callback(&self, _callback: PaymentFailedCallback) {}
        fn set_payment_cancelled_callback(&self, _callback: PaymentCancelledCallback) {}
        fn set_state_changed_callback(&self, _callback: StateChangedCallback) {}
    }

    #[test]
    fn test_default_is_first_registered() {
        let manager = DeviceManager::new();
        manager.register_payment_terminal("a", Arc::new(NamedTerminal("a")));
        manager.register_payment_terminal("b", Arc::new(NamedTerminal("b")));

        let default = manager.default_payment_terminal().unwrap();
        assert_eq!(default.vendor_name(), "a");
    }

    #[test]
    fn test_reregister_replaces_in_place() {
        let manager = DeviceManager::new();
        manager.register_payment_terminal("a", Arc::new(NamedTerminal("first")));
        manager.register_payment_terminal("a", Arc::new(NamedTerminal("second")));

        assert_eq!(manager.device_ids(DeviceType::Payment), vec!["a"]);
        assert_eq!(
            manager.payment_terminal("a").unwrap().vendor_name(),
            "second"
        );
    }

    #[test]
    fn test_lookup_missing() {
        let manager = DeviceManager::new();
        assert!(manager.payment_terminal("nope").is_none());
        assert!(manager.default_printer().is_none());
        assert!(manager.default_camera().is_none());
    }

    #[test]
    fn test_all_device_info_spans_kinds() {
        let manager = DeviceManager::new();
        manager.register_payment_terminal("t", Arc::new(NamedTerminal("t")));
        manager.register_camera("c", Arc::new(crate::camera::mock::MockCamera::ready("c")));
        manager.register_printer("p", Arc::new(crate::printer::mock::MockPrinter::ready("p")));

        let infos = manager.all_device_info();
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[0].device_type, DeviceType::Payment);
        assert_eq!(infos[1].device_type, DeviceType::Printer);
        assert_eq!(infos[2].device_type, DeviceType::Camera);
    }
}
