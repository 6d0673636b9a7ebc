//! Daemon wiring: configuration, vendor registration, startup detection,
//! the IPC server, and the shutdown sequence.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::config::Config;
use crate::device::factory::{DeviceCategory, VendorProbe};
use crate::device::terminal::PaymentTerminal;
use crate::device::{
    DeviceManager, DeviceState, DeviceType, TerminalFactory, CARD_TERMINAL_ID, CASH_DEVICE_ID,
};
use crate::error::Result;
use crate::ipc::message::{Event, EventType};
use crate::ipc::router::Router;
use crate::ipc::server::IpcServer;
use crate::ipc::worker::WorkerQueue;
use crate::ipc::CHANNEL_NAME;
use crate::lv77::Lv77CashAcceptor;
use crate::smartro::SmartroTerminal;

/// The daemon: owns every long-lived component and defines their
/// construction and termination order.
pub struct Daemon {
    config: Arc<Mutex<Config>>,
    devices: Arc<DeviceManager>,
    factory: Arc<TerminalFactory>,
    worker: Arc<WorkerQueue>,
    server: Arc<IpcServer>,
    running: Arc<AtomicBool>,
}

impl Daemon {
    /// Build the daemon. Fails when the configuration cannot be read or the
    /// IPC endpoint cannot be bound; both are initialization failures the
    /// process reports with exit code 1.
    pub fn new(config_path: &Path) -> Result<Arc<Self>> {
        let config = Arc::new(Mutex::new(Config::load(config_path)?));
        let devices = Arc::new(DeviceManager::new());
        let factory = Arc::new(TerminalFactory::new());
        register_vendors(&factory);

        let worker = Arc::new(WorkerQueue::new());
        let router = Arc::new(Router::new(
            Arc::clone(&devices),
            Arc::clone(&config),
            Arc::clone(&factory),
            Arc::clone(&worker),
        ));
        let server = IpcServer::new(CHANNEL_NAME, router, Arc::clone(&devices));

        Ok(Arc::new(Self {
            config,
            devices,
            factory,
            worker,
            server,
            running: Arc::new(AtomicBool::new(false)),
        }))
    }

    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.devices
    }

    /// Detect and register payment hardware according to the configuration:
    /// configured ports are trusted and bound directly, otherwise the
    /// factory probes the enumerated ports (the cash port is excluded from
    /// card probing).
    pub fn detect_hardware_at_startup(&self) {
        let (payment_enabled, payment_port, cash_enabled, cash_port) = {
            let config = self.config.lock().unwrap();
            (
                config.payment_enabled(),
                config.payment_com_port().to_string(),
                config.cash_enabled(),
                config.cash_com_port().to_string(),
            )
        };

        let ports = crate::serial::enumerate_ports(true);
        log::info!("startup detection, {} port(s) visible", ports.len());

        if payment_enabled {
            let adapter: Option<Arc<dyn PaymentTerminal>> = if !payment_port.is_empty() {
                log::info!("binding card terminal to configured port {payment_port}");
                Some(SmartroTerminal::new(CARD_TERMINAL_ID, &payment_port))
            } else {
                self.factory
                    .detect_on_ports(CARD_TERMINAL_ID, &ports, &cash_port, Some(DeviceCategory::Card))
                    .map(|(vendor, adapter)| {
                        log::info!("detected {vendor} card terminal on {}", adapter.com_port());
                        let _ = crate::serial::save_working_port(&adapter.com_port());
                        adapter
                    })
            };
            if let Some(adapter) = adapter {
                self.wire_terminal_events("payment", &adapter);
                self.devices
                    .register_payment_terminal(CARD_TERMINAL_ID, adapter);
            } else {
                log::warn!("no card terminal found at startup");
            }
        }

        if cash_enabled {
            let adapter: Option<Arc<dyn PaymentTerminal>> = if !cash_port.is_empty() {
                log::info!("binding cash device to configured port {cash_port}");
                Some(Lv77CashAcceptor::new(CASH_DEVICE_ID, &cash_port))
            } else {
                let card_port = self
                    .devices
                    .payment_terminal(CARD_TERMINAL_ID)
                    .map(|t| t.com_port())
                    .unwrap_or_default();
                self.factory
                    .detect_on_ports(CASH_DEVICE_ID, &ports, &card_port, Some(DeviceCategory::Cash))
                    .map(|(vendor, adapter)| {
                        log::info!("detected {vendor} cash device on {}", adapter.com_port());
                        adapter
                    })
            };
            if let Some(adapter) = adapter {
                self.wire_terminal_events("payment", &adapter);
                self.wire_cash_events(&adapter);
                self.devices
                    .register_payment_terminal(CASH_DEVICE_ID, adapter);
            } else {
                log::warn!("no cash device found at startup");
            }
        }
    }

    /// Turn adapter callbacks into IPC events. The server reference is weak
    /// so adapter → server callbacks never form a keep-alive cycle.
    pub fn wire_terminal_events(&self, device_type: &str, adapter: &Arc<dyn PaymentTerminal>) {
        let device_type = device_type.to_string();
        let server = Arc::downgrade(&self.server);

        {
            let server = Weak::clone(&server);
            let device_type = device_type.clone();
            adapter.set_payment_complete_callback(Arc::new(move |event| {
                let Some(server) = server.upgrade() else { return };
                let mut data = BTreeMap::new();
                data.insert("transactionId".to_string(), event.transaction_id.clone());
                data.insert("amount".to_string(), event.amount.to_string());
                data.insert("cardNumber".to_string(), event.card_number.clone());
                data.insert("approvalNumber".to_string(), event.approval_number.clone());
                data.insert("salesDate".to_string(), event.sales_date.clone());
                data.insert("salesTime".to_string(), event.sales_time.clone());
                data.insert(
                    "transactionMedium".to_string(),
                    event.transaction_medium.clone(),
                );
                if let Some(state) = event.state {
                    data.insert("state".to_string(), u8::from(state).to_string());
                    data.insert("stateString".to_string(), state.to_string());
                }
                data.insert("status".to_string(), event.status.clone());
                data.insert("transactionType".to_string(), event.transaction_type.clone());
                data.insert("approvalAmount".to_string(), event.approval_amount.clone());
                data.insert("tax".to_string(), event.tax.clone());
                data.insert("serviceCharge".to_string(), event.service_charge.clone());
                data.insert("installments".to_string(), event.installments.clone());
                data.insert("merchantNumber".to_string(), event.merchant_number.clone());
                data.insert("terminalNumber".to_string(), event.terminal_number.clone());
                data.insert("issuer".to_string(), event.issuer.clone());
                data.insert("acquirer".to_string(), event.acquirer.clone());
                server.broadcast_event(&Event::new(
                    EventType::PaymentComplete,
                    &device_type,
                    data,
                ));
            }));
        }

        {
            let server = Weak::clone(&server);
            let device_type = device_type.clone();
            adapter.set_payment_failed_callback(Arc::new(move |event| {
                let Some(server) = server.upgrade() else { return };
                let mut data = BTreeMap::new();
                data.insert("errorCode".to_string(), event.error_code.clone());
                data.insert("errorMessage".to_string(), event.error_message.clone());
                data.insert("amount".to_string(), event.amount.to_string());
                if let Some(state) = event.state {
                    data.insert("state".to_string(), u8::from(state).to_string());
                    data.insert("stateString".to_string(), state.to_string());
                }
                server.broadcast_event(&Event::new(EventType::PaymentFailed, &device_type, data));
            }));
        }

        {
            let server = Weak::clone(&server);
            let device_type = device_type.clone();
            adapter.set_payment_cancelled_callback(Arc::new(move |event| {
                let Some(server) = server.upgrade() else { return };
                let mut data = BTreeMap::new();
                data.insert("state".to_string(), u8::from(event.state).to_string());
                data.insert("stateString".to_string(), event.state.to_string());
                server.broadcast_event(&Event::new(
                    EventType::PaymentCancelled,
                    &device_type,
                    data,
                ));
            }));
        }

        {
            let server = Weak::clone(&server);
            adapter.set_state_changed_callback(Arc::new(move |state: DeviceState| {
                let Some(server) = server.upgrade() else { return };
                let mut data = BTreeMap::new();
                data.insert("state".to_string(), u8::from(state).to_string());
                data.insert("stateString".to_string(), state.to_string());
                server.broadcast_event(&Event::new(
                    EventType::DeviceStateChanged,
                    &device_type,
                    data,
                ));
            }));
        }
    }

    /// Cash-specific events: per-bill running totals and the target-reached
    /// completion. Test-mode campaigns (zero target) report through
    /// `cash_test_amount` instead.
    pub fn wire_cash_events(&self, adapter: &Arc<dyn PaymentTerminal>) {
        let Some(cash) = adapter.cash_extensions() else {
            return;
        };
        let server = Arc::downgrade(&self.server);
        let device: Weak<dyn PaymentTerminal> = Arc::downgrade(adapter);

        {
            let server = Weak::clone(&server);
            let device = Weak::clone(&device);
            cash.set_bill_stacked_callback(Arc::new(move |amount, total| {
                let Some(server) = server.upgrade() else { return };
                let test_mode = device
                    .upgrade()
                    .and_then(|d| d.cash_extensions().map(|c| c.target_amount() == 0))
                    .unwrap_or(false);
                let mut data = BTreeMap::new();
                data.insert("amount".to_string(), amount.to_string());
                data.insert("currentTotal".to_string(), total.to_string());
                let event_type = if test_mode {
                    EventType::CashTestAmount
                } else {
                    EventType::CashBillStacked
                };
                server.broadcast_event(&Event::new(event_type, "payment", data));
            }));
        }

        {
            let server = Weak::clone(&server);
            cash.set_target_reached_callback(Arc::new(move |total| {
                let Some(server) = server.upgrade() else { return };
                let mut data = BTreeMap::new();
                data.insert("totalAmount".to_string(), total.to_string());
                server.broadcast_event(&Event::new(
                    EventType::CashPaymentTargetReached,
                    "payment",
                    data,
                ));
            }));
        }
    }

    /// Camera events: capture outcomes (success or failure) and state
    /// changes.
    pub fn wire_camera_events(&self, camera: &Arc<dyn crate::camera::Camera>) {
        let server = Arc::downgrade(&self.server);
        camera.set_event_callback(Arc::new(move |event| {
            let Some(server) = server.upgrade() else { return };
            let mut data = BTreeMap::new();
            data.insert("state".to_string(), u8::from(event.state).to_string());
            data.insert("stateString".to_string(), event.state.to_string());
            let event_type = match event.kind {
                crate::camera::CameraEventKind::StateChanged => EventType::CameraStateChanged,
                crate::camera::CameraEventKind::CaptureComplete => {
                    data.insert("captureId".to_string(), event.capture_id.clone());
                    data.insert("imagePath".to_string(), event.image_path.clone());
                    data.insert("success".to_string(), "true".to_string());
                    EventType::CameraCaptureComplete
                }
                crate::camera::CameraEventKind::CaptureFailed => {
                    data.insert("captureId".to_string(), event.capture_id.clone());
                    data.insert("success".to_string(), "false".to_string());
                    data.insert("errorCode".to_string(), event.error_code.clone());
                    data.insert("errorMessage".to_string(), event.error_message.clone());
                    EventType::CameraCaptureComplete
                }
            };
            server.broadcast_event(&Event::new(event_type, "camera", data));
        }));
    }

    /// Printer events: one job-complete per launched job.
    pub fn wire_printer_events(&self, printer: &Arc<dyn crate::printer::Printer>) {
        let server = Arc::downgrade(&self.server);
        printer.set_job_complete_callback(Arc::new(move |event| {
            let Some(server) = server.upgrade() else { return };
            let mut data = BTreeMap::new();
            data.insert("jobId".to_string(), event.job_id.clone());
            data.insert(
                "success".to_string(),
                if event.success { "true" } else { "false" }.to_string(),
            );
            data.insert("errorMessage".to_string(), event.error_message.clone());
            server.broadcast_event(&Event::new(EventType::PrinterJobComplete, "printer", data));
        }));
    }

    /// Start the IPC server and block until [`Daemon::shutdown`] is called.
    pub fn run(&self) -> Result<()> {
        self.running.store(true, Ordering::SeqCst);
        Arc::clone(&self.server).start()?;
        self.detect_hardware_at_startup();
        log::info!("daemon up");

        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(200));
        }
        Ok(())
    }

    /// Termination order: stop the IPC listener, drain the worker queue,
    /// then shut down each adapter (threads stopped, ports closed).
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.server.stop();
        self.worker.shutdown();
        for device_id in self.devices.device_ids(DeviceType::Payment) {
            if let Some(terminal) = self.devices.payment_terminal(&device_id) {
                terminal.shutdown();
            }
        }
        log::info!("daemon down");
    }
}

/// Register the built-in vendor probes. Card probes answer the SMARTRO
/// device check; cash probes answer the LV77 enable/inhibit poll.
fn register_vendors(factory: &TerminalFactory) {
    factory.register(VendorProbe {
        vendor: crate::smartro::VENDOR_NAME,
        category: DeviceCategory::Card,
        try_port: Box::new(SmartroTerminal::try_port),
        create: Box::new(|device_id, port| {
            SmartroTerminal::new(device_id, port) as Arc<dyn PaymentTerminal>
        }),
    });
    factory.register(VendorProbe {
        vendor: crate::lv77::VENDOR_NAME,
        category: DeviceCategory::Cash,
        try_port: Box::new(Lv77CashAcceptor::try_port),
        create: Box::new(|device_id, port| {
            Lv77CashAcceptor::new(device_id, port) as Arc<dyn PaymentTerminal>
        }),
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vendor_registration_order() {
        let factory = TerminalFactory::new();
        register_vendors(&factory);
        assert_eq!(factory.vendor_names(), vec!["smartro", "lv77"]);
    }

    #[test]
    fn test_daemon_construction_and_shutdown() {
        let config_path = std::env::temp_dir().join("kiosk-hal-daemon-test.ini");
        let daemon = Daemon::new(&config_path).unwrap();
        assert!(daemon.devices().all_device_info().is_empty());
        daemon.shutdown();
    }

    #[test]
    fn test_peripheral_wiring_registers_callbacks() {
        let config_path = std::env::temp_dir().join("kiosk-hal-daemon-wire-test.ini");
        let daemon = Daemon::new(&config_path).unwrap();

        let camera: Arc<dyn crate::camera::Camera> =
            Arc::new(crate::camera::mock::MockCamera::ready("cam"));
        daemon.wire_camera_events(&camera);
        // With no client attached the event is dropped, not lost in a panic.
        camera.capture("cap-1").unwrap();

        let printer: Arc<dyn crate::printer::Printer> =
            Arc::new(crate::printer::mock::MockPrinter::ready("prn"));
        daemon.wire_printer_events(&printer);
        printer.print("job-1", &[], "").unwrap();

        daemon.shutdown();
    }
}
