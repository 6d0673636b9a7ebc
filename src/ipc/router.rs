use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::config::Config;
use crate::device::factory::DeviceCategory;
use crate::device::terminal::{ScreenSoundSettings, TransactionCancelRequest};
use crate::device::{
    DeviceInfo, DeviceManager, DeviceState, DeviceType, TerminalFactory, CARD_TERMINAL_ID,
    CASH_DEVICE_ID,
};
use crate::ipc::message::{Command, CommandType, Event, IpcErrorCode, Response};
use crate::ipc::worker::{Task, WorkerQueue};
use crate::ipc::EventType;

/// Where router-side events go; the server points this at the connected
/// client.
pub type EventSink = Arc<dyn Fn(Event) + Send + Sync>;

/// Command router: maps typed commands onto device operations.
///
/// Three handler flavors: inline (answer computed in place), fire-and-forget
/// (device operation launched, outcome arrives as events) and worker-queued
/// (serial round-trips longer than the dispatch budget). Every flavor
/// produces its response within the dispatch turn; `commandId` is copied
/// verbatim.
///
/// Responses are cached by `commandId` for the lifetime of the connection,
/// so a client resend gets the identical answer back.
pub struct Router {
    devices: Arc<DeviceManager>,
    config: Arc<Mutex<Config>>,
    factory: Arc<TerminalFactory>,
    worker: Arc<WorkerQueue>,
    events: Mutex<Option<EventSink>>,
    cache: Mutex<HashMap<String, Response>>,
}

impl Router {
    pub fn new(
        devices: Arc<DeviceManager>,
        config: Arc<Mutex<Config>>,
        factory: Arc<TerminalFactory>,
        worker: Arc<WorkerQueue>,
    ) -> Self {
        Self {
            devices,
            config,
            factory,
            worker,
            events: Mutex::new(None),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_event_sink(&self, sink: EventSink) {
        *self.events.lock().unwrap() = Some(sink);
    }

    /// Drop cached responses; called when the client disconnects.
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap().clear();
    }

    fn emit(&self, event: Event) {
        let sink = self.events.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    /// Route one command to its handler and cache the answer.
    pub fn handle(&self, command: &Command) -> Response {
        if let Some(cached) = self.cache.lock().unwrap().get(&command.command_id) {
            log::debug!(
                "router: duplicate command id {}, replaying cached response",
                command.command_id
            );
            return cached.clone();
        }

        let command_type = command.command_type();
        log::info!(
            "router: {} ({})",
            command_type,
            command.command_id
        );

        let response = match command_type {
            CommandType::PaymentStart => self.handle_payment_start(command),
            CommandType::PaymentCancel => self.handle_payment_cancel(command),
            CommandType::PaymentTransactionCancel => self.handle_transaction_cancel(command),
            CommandType::PaymentStatus => self.handle_payment_status(command),
            CommandType::PaymentReset => self.handle_payment_reset(command),
            CommandType::PaymentDeviceCheck => self.handle_payment_device_check(command),
            CommandType::PaymentCardUidRead => self.handle_card_uid_read(command),
            CommandType::PaymentLastApproval => self.handle_last_approval(command),
            CommandType::PaymentIcCardCheck => self.handle_ic_card_check(command),
            CommandType::PaymentScreenSoundSetting => self.handle_screen_sound(command),
            CommandType::GetDeviceList => self.handle_device_list(command),
            CommandType::GetStateSnapshot => self.handle_state_snapshot(command),
            CommandType::GetConfig => self.handle_get_config(command),
            CommandType::SetConfig => self.handle_set_config(command),
            CommandType::PrinterPrint => self.handle_printer_print(command),
            CommandType::CameraCapture => self.handle_camera_capture(command),
            CommandType::CameraSetSession => self.handle_camera_set_session(command),
            CommandType::CameraStatus => self.handle_camera_status(command),
            CommandType::CameraStartPreview => self.handle_camera_start_preview(command),
            CommandType::CameraStopPreview => self.handle_camera_stop_preview(command),
            CommandType::CameraSetSettings => self.handle_camera_set_settings(command),
            CommandType::CameraReconnect => self.handle_camera_reconnect(command),
            CommandType::DetectHardware => self.handle_detect_hardware(command),
            CommandType::GetAvailablePrinters => self.handle_available_printers(command),
            CommandType::CashTestStart => self.handle_cash_start(command, true),
            CommandType::CashPaymentStart => self.handle_cash_start(command, false),
            CommandType::Unknown => Response::rejected(
                &command.command_id,
                IpcErrorCode::UnknownCommand,
                &format!("unknown command type: {}", command.type_tag),
            ),
        };

        self.cache
            .lock()
            .unwrap()
            .insert(command.command_id.clone(), response.clone());
        response
    }

    // ---- payment (card terminal) ----

    fn card_terminal(
        &self,
        command: &Command,
    ) -> Result<Arc<dyn crate::device::PaymentTerminal>, Box<Response>> {
        let device_id = command
            .payload
            .get("deviceId")
            .map(String::as_str)
            .unwrap_or(CARD_TERMINAL_ID);
        self.devices.payment_terminal(device_id).ok_or_else(|| {
            Box::new(Response::rejected(
                &command.command_id,
                IpcErrorCode::DeviceNotFound,
                &format!("no payment terminal registered as {device_id}"),
            ))
        })
    }

    fn cash_device(
        &self,
        command: &Command,
    ) -> Result<Arc<dyn crate::device::PaymentTerminal>, Box<Response>> {
        let device_id = command
            .payload
            .get("deviceId")
            .map(String::as_str)
            .unwrap_or(CASH_DEVICE_ID);
        self.devices.payment_terminal(device_id).ok_or_else(|| {
            Box::new(Response::rejected(
                &command.command_id,
                IpcErrorCode::DeviceNotFound,
                &format!("no cash device registered as {device_id}"),
            ))
        })
    }

    fn parse_amount(command: &Command) -> Result<u32, Box<Response>> {
        match command.payload.get("amount").map(|a| a.parse::<u32>()) {
            Some(Ok(amount)) => Ok(amount),
            _ => Err(Box::new(Response::rejected(
                &command.command_id,
                IpcErrorCode::InvalidPayload,
                "amount is required and must be a non-negative integer",
            ))),
        }
    }

    fn handle_payment_start(&self, command: &Command) -> Response {
        let amount = match Self::parse_amount(command) {
            Ok(amount) => amount,
            Err(response) => return *response,
        };
        let terminal = match self.card_terminal(command) {
            Ok(terminal) => terminal,
            Err(response) => return *response,
        };

        let info = terminal.device_info();
        if info.state != DeviceState::Ready {
            return Response::rejected(
                &command.command_id,
                IpcErrorCode::DeviceNotReady,
                &format!("terminal is {}", info.state),
            );
        }

        match terminal.start_payment(amount) {
            Ok(()) => {
                let mut result = BTreeMap::new();
                result.insert("deviceId".to_string(), info.device_id);
                result.insert("state".to_string(), u8::from(info.state).to_string());
                result.insert("stateString".to_string(), info.state.to_string());
                result.insert("amount".to_string(), amount.to_string());
                Response::ok(&command.command_id, result)
            }
            Err(err) => Response::failed(
                &command.command_id,
                IpcErrorCode::PaymentStartFailed,
                err.message(),
            ),
        }
    }

    fn handle_payment_cancel(&self, command: &Command) -> Response {
        let terminal = match self.card_terminal(command) {
            Ok(terminal) => terminal,
            Err(response) => return *response,
        };
        match terminal.cancel_payment() {
            Ok(()) => {
                let mut result = BTreeMap::new();
                result.insert("deviceId".to_string(), terminal.device_info().device_id);
                result.insert(
                    "state".to_string(),
                    u8::from(terminal.state()).to_string(),
                );
                Response::ok(&command.command_id, result)
            }
            Err(err) => Response::failed(
                &command.command_id,
                IpcErrorCode::PaymentCancelFailed,
                err.message(),
            ),
        }
    }

    fn handle_payment_status(&self, command: &Command) -> Response {
        let terminal = match self.card_terminal(command) {
            Ok(terminal) => terminal,
            Err(response) => return *response,
        };
        let info = terminal.device_info();
        let mut result = BTreeMap::new();
        push_device_info(&mut result, "", &info);
        result.insert("comPort".to_string(), terminal.com_port());
        result.insert("vendor".to_string(), terminal.vendor_name().to_string());
        Response::ok(&command.command_id, result)
    }

    /// Reset and device-check involve serial round-trips longer than the
    /// dispatch budget, so the work is queued and acknowledged immediately;
    /// outcomes surface as `device_state_changed` events and through status
    /// queries.
    fn queue_terminal_task(
        &self,
        command: &Command,
        kind: &str,
        job: impl FnOnce(Arc<dyn crate::device::PaymentTerminal>) + Send + 'static,
    ) -> Response {
        let terminal = match self.card_terminal(command) {
            Ok(terminal) => terminal,
            Err(response) => return *response,
        };
        self.worker.enqueue(Task {
            command_id: command.command_id.clone(),
            kind: kind.to_string(),
            job: Box::new(move || job(terminal)),
        });
        let mut result = BTreeMap::new();
        result.insert("queued".to_string(), "true".to_string());
        Response::ok(&command.command_id, result)
    }

    fn handle_payment_reset(&self, command: &Command) -> Response {
        self.queue_terminal_task(command, "payment_reset", |terminal| {
            if let Err(err) = terminal.reset() {
                log::error!("payment reset failed: {err}");
            }
        })
    }

    fn handle_payment_device_check(&self, command: &Command) -> Response {
        self.queue_terminal_task(command, "payment_device_check", |terminal| {
            if let Err(err) = terminal.check_device() {
                log::warn!("payment device check failed: {err}");
            }
        })
    }

    /// Fetch the capability implementation or answer `INVALID_DEVICE_TYPE`.
    fn with_extensions<T>(
        &self,
        command: &Command,
        failure_code: IpcErrorCode,
        op: impl FnOnce(&dyn crate::device::TerminalExtensions) -> crate::error::Result<T>,
        into_result: impl FnOnce(T) -> BTreeMap<String, String>,
    ) -> Response {
        let terminal = match self.card_terminal(command) {
            Ok(terminal) => terminal,
            Err(response) => return *response,
        };
        let Some(extensions) = terminal.extensions() else {
            return Response::rejected(
                &command.command_id,
                IpcErrorCode::InvalidDeviceType,
                "this terminal has no extended operations",
            );
        };
        match op(extensions) {
            Ok(value) => Response::ok(&command.command_id, into_result(value)),
            Err(err) => Response::failed(&command.command_id, failure_code, err.message()),
        }
    }

    fn handle_card_uid_read(&self, command: &Command) -> Response {
        self.with_extensions(
            command,
            IpcErrorCode::CardUidReadFailed,
            |ext| ext.read_card_uid(),
            |uid| {
                let mut result = BTreeMap::new();
                result.insert("uid".to_string(), uid.to_string());
                result.insert("length".to_string(), uid.bytes.len().to_string());
                result
            },
        )
    }

    fn handle_last_approval(&self, command: &Command) -> Response {
        self.with_extensions(
            command,
            IpcErrorCode::LastApprovalFailed,
            |ext| ext.last_approval(),
            |event| {
                let mut result = BTreeMap::new();
                result.insert("transactionId".to_string(), event.transaction_id);
                result.insert("amount".to_string(), event.amount.to_string());
                result.insert("cardNumber".to_string(), event.card_number);
                result.insert("approvalNumber".to_string(), event.approval_number);
                result.insert("salesDate".to_string(), event.sales_date);
                result.insert("salesTime".to_string(), event.sales_time);
                result.insert("transactionMedium".to_string(), event.transaction_medium);
                result
            },
        )
    }

    fn handle_ic_card_check(&self, command: &Command) -> Response {
        self.with_extensions(
            command,
            IpcErrorCode::IcCardCheckFailed,
            |ext| ext.check_ic_card(),
            |status| {
                let mut result = BTreeMap::new();
                result.insert(
                    "cardInserted".to_string(),
                    if status.inserted { "true" } else { "false" }.to_string(),
                );
                result
            },
        )
    }

    fn handle_screen_sound(&self, command: &Command) -> Response {
        let parse = |key: &str| -> Option<u8> {
            command
                .payload
                .get(key)
                .and_then(|v| v.parse::<u8>().ok())
                .filter(|v| *v <= 9)
        };
        let (Some(brightness), Some(volume), Some(touch_volume)) = (
            parse("screenBrightness"),
            parse("soundVolume"),
            parse("touchSoundVolume"),
        ) else {
            return Response::rejected(
                &command.command_id,
                IpcErrorCode::InvalidPayload,
                "screenBrightness, soundVolume and touchSoundVolume must be 0..9",
            );
        };
        self.with_extensions(
            command,
            IpcErrorCode::ScreenSoundSettingFailed,
            |ext| {
                ext.set_screen_sound(&ScreenSoundSettings {
                    brightness,
                    volume,
                    touch_volume,
                })
            },
            |applied| {
                let mut result = BTreeMap::new();
                result.insert("screenBrightness".to_string(), applied.brightness.to_string());
                result.insert("soundVolume".to_string(), applied.volume.to_string());
                result.insert(
                    "touchSoundVolume".to_string(),
                    applied.touch_volume.to_string(),
                );
                result
            },
        )
    }

    fn handle_transaction_cancel(&self, command: &Command) -> Response {
        let amount = match Self::parse_amount(command) {
            Ok(amount) => amount,
            Err(response) => return *response,
        };
        let get = |key: &str| command.payload.get(key).cloned().unwrap_or_default();
        let request = TransactionCancelRequest {
            cancel_type: {
                let value = get("cancelType");
                if value.is_empty() {
                    "2".to_string()
                } else {
                    value
                }
            },
            transaction_type: {
                let value = get("transactionType");
                if value.is_empty() {
                    "01".to_string()
                } else {
                    value
                }
            },
            amount,
            tax: get("tax").parse().unwrap_or(0),
            service: get("service").parse().unwrap_or(0),
            installments: get("installments").parse().unwrap_or(0),
            approval_number: get("approvalNumber"),
            original_date: get("originalDate"),
            original_time: get("originalTime"),
            additional_info: get("additionalInfo"),
        };

        self.with_extensions(
            command,
            IpcErrorCode::TransactionCancelFailed,
            |ext| ext.cancel_transaction(&request),
            |cancel| {
                let mut result = BTreeMap::new();
                result.insert("transactionType".to_string(), cancel.transaction_type);
                result.insert("transactionMedium".to_string(), cancel.transaction_medium);
                result.insert("cardNumber".to_string(), cancel.card_number);
                result.insert("approvalAmount".to_string(), cancel.approval_amount);
                result.insert("approvalNumber".to_string(), cancel.approval_number);
                result.insert("salesDate".to_string(), cancel.sales_date);
                result.insert("salesTime".to_string(), cancel.sales_time);
                result
            },
        )
    }

    // ---- device list / snapshot / config ----

    fn handle_device_list(&self, command: &Command) -> Response {
        let infos = self.devices.all_device_info();
        let mut result = BTreeMap::new();
        result.insert("deviceCount".to_string(), infos.len().to_string());
        for (index, info) in infos.iter().enumerate() {
            push_device_info(&mut result, &format!("devices[{index}]."), info);
        }
        Response::ok(&command.command_id, result)
    }

    fn handle_state_snapshot(&self, command: &Command) -> Response {
        let infos = self.devices.all_device_info();
        let all_healthy = infos.iter().all(DeviceInfo::is_healthy);
        let mut result = BTreeMap::new();
        result.insert(
            "allHealthy".to_string(),
            if all_healthy { "true" } else { "false" }.to_string(),
        );
        result.insert("deviceCount".to_string(), infos.len().to_string());
        for (index, info) in infos.iter().enumerate() {
            push_device_info(&mut result, &format!("devices[{index}]."), info);
        }
        Response::ok(&command.command_id, result)
    }

    fn handle_get_config(&self, command: &Command) -> Response {
        let snapshot = self.config.lock().unwrap().snapshot();
        Response::ok(&command.command_id, snapshot)
    }

    fn handle_set_config(&self, command: &Command) -> Response {
        let mut config = self.config.lock().unwrap();
        if let Err(err) = config.apply(&command.payload) {
            return Response::rejected(
                &command.command_id,
                IpcErrorCode::InvalidPayload,
                err.message(),
            );
        }
        if let Err(err) = config.save() {
            log::warn!("config save failed: {err}");
        }
        Response::ok(&command.command_id, config.snapshot())
    }

    // ---- printer ----

    fn handle_printer_print(&self, command: &Command) -> Response {
        let Some(printer) = self.devices.default_printer() else {
            return Response::rejected(
                &command.command_id,
                IpcErrorCode::DeviceNotFound,
                "no printer available",
            );
        };
        if printer.state() != DeviceState::Ready {
            return Response::rejected(
                &command.command_id,
                IpcErrorCode::DeviceNotReady,
                "printer is not ready",
            );
        }
        let Some(image_path) = command.payload.get("imagePath").cloned() else {
            return Response::rejected(
                &command.command_id,
                IpcErrorCode::InvalidPayload,
                "imagePath is required",
            );
        };
        let orientation = command
            .payload
            .get("orientation")
            .map(|s| crate::printer::Orientation::from(s.as_str()))
            .unwrap_or(crate::printer::Orientation::Portrait);

        // Launch and acknowledge; completion arrives as an event.
        let job_id = command.command_id.clone();
        let launch = std::thread::Builder::new()
            .name("printer-job".to_string())
            .spawn(move || {
                if let Err(err) = printer.print_from_file(&job_id, Path::new(&image_path), orientation)
                {
                    log::error!("print job failed to launch: {err}");
                }
            });
        match launch {
            Ok(_) => {
                let mut result = BTreeMap::new();
                result.insert("jobId".to_string(), command.command_id.clone());
                Response::ok(&command.command_id, result)
            }
            Err(err) => Response::failed(
                &command.command_id,
                IpcErrorCode::HandlerError,
                &format!("failed to launch print job: {err}"),
            ),
        }
    }

    fn handle_available_printers(&self, command: &Command) -> Response {
        let names = self
            .devices
            .default_printer()
            .map(|p| p.available_printers())
            .unwrap_or_default();
        let mut result = BTreeMap::new();
        result.insert("count".to_string(), names.len().to_string());
        for (index, name) in names.iter().enumerate() {
            result.insert(format!("printers[{index}]"), name.clone());
        }
        Response::ok(&command.command_id, result)
    }

    // ---- camera ----

    fn camera(
        &self,
        command: &Command,
    ) -> Result<Arc<dyn crate::camera::Camera>, Box<Response>> {
        self.devices.default_camera().ok_or_else(|| {
            Box::new(Response::rejected(
                &command.command_id,
                IpcErrorCode::DeviceNotFound,
                "no camera available",
            ))
        })
    }

    fn handle_camera_capture(&self, command: &Command) -> Response {
        let camera = match self.camera(command) {
            Ok(camera) => camera,
            Err(response) => return *response,
        };
        if camera.state() != DeviceState::Ready {
            return Response::rejected(
                &command.command_id,
                IpcErrorCode::DeviceNotReady,
                "camera is not ready",
            );
        }
        let capture_id = command
            .payload
            .get("captureId")
            .cloned()
            .unwrap_or_else(|| command.command_id.clone());
        match camera.capture(&capture_id) {
            Ok(()) => {
                let mut result = BTreeMap::new();
                result.insert("captureId".to_string(), capture_id);
                Response::ok(&command.command_id, result)
            }
            Err(err) => {
                Response::failed(&command.command_id, IpcErrorCode::HandlerError, err.message())
            }
        }
    }

    fn handle_camera_status(&self, command: &Command) -> Response {
        let camera = match self.camera(command) {
            Ok(camera) => camera,
            Err(response) => return *response,
        };
        let info = camera.device_info();
        let mut result = BTreeMap::new();
        push_device_info(&mut result, "", &info);
        Response::ok(&command.command_id, result)
    }

    fn handle_camera_set_session(&self, command: &Command) -> Response {
        let camera = match self.camera(command) {
            Ok(camera) => camera,
            Err(response) => return *response,
        };
        let open = command
            .payload
            .get("open")
            .map(|v| crate::config::parse_bool(v))
            .unwrap_or(true);
        match camera.set_session(open) {
            Ok(()) => Response::ok(&command.command_id, BTreeMap::new()),
            Err(err) => {
                Response::failed(&command.command_id, IpcErrorCode::HandlerError, err.message())
            }
        }
    }

    fn handle_camera_start_preview(&self, command: &Command) -> Response {
        let camera = match self.camera(command) {
            Ok(camera) => camera,
            Err(response) => return *response,
        };
        match camera.start_preview() {
            Ok(url) => {
                let mut result = BTreeMap::new();
                result.insert("previewUrl".to_string(), url);
                Response::ok(&command.command_id, result)
            }
            Err(err) => {
                Response::failed(&command.command_id, IpcErrorCode::HandlerError, err.message())
            }
        }
    }

    fn handle_camera_stop_preview(&self, command: &Command) -> Response {
        let camera = match self.camera(command) {
            Ok(camera) => camera,
            Err(response) => return *response,
        };
        match camera.stop_preview() {
            Ok(()) => Response::ok(&command.command_id, BTreeMap::new()),
            Err(err) => {
                Response::failed(&command.command_id, IpcErrorCode::HandlerError, err.message())
            }
        }
    }

    fn handle_camera_set_settings(&self, command: &Command) -> Response {
        let camera = match self.camera(command) {
            Ok(camera) => camera,
            Err(response) => return *response,
        };
        match camera.set_settings(&command.payload) {
            Ok(()) => Response::ok(&command.command_id, BTreeMap::new()),
            Err(err) => {
                Response::failed(&command.command_id, IpcErrorCode::HandlerError, err.message())
            }
        }
    }

    fn handle_camera_reconnect(&self, command: &Command) -> Response {
        let camera = match self.camera(command) {
            Ok(camera) => camera,
            Err(response) => return *response,
        };
        match camera.reconnect() {
            Ok(()) => Response::ok(&command.command_id, BTreeMap::new()),
            Err(err) => {
                Response::failed(&command.command_id, IpcErrorCode::HandlerError, err.message())
            }
        }
    }

    // ---- detection ----

    /// Re-run hardware detection. `probe=false` in the payload skips the
    /// port scan and only collects current state.
    fn handle_detect_hardware(&self, command: &Command) -> Response {
        let config_map = {
            let mut config = self.config.lock().unwrap();
            // Manual edits to the file should win here.
            if let Err(err) = config.reload() {
                log::warn!("config reload failed: {err}");
            }
            config.snapshot()
        };
        let payment_enabled =
            crate::config::is_enabled(&command.payload, &config_map, "payment.enabled");
        let cash_enabled = crate::config::is_enabled(&command.payload, &config_map, "cash.enabled");
        let do_probe = command
            .payload
            .get("probe")
            .map(|v| v != "false")
            .unwrap_or(true);

        let mut result = BTreeMap::new();

        if let Some(camera) = self.devices.default_camera() {
            let info = camera.device_info();
            result.insert("camera.model".to_string(), info.device_name.clone());
            push_device_state(&mut result, "camera.", &info);
        }
        if let Some(printer) = self.devices.default_printer() {
            let info = printer.device_info();
            result.insert("printer.name".to_string(), info.device_name.clone());
            push_device_state(&mut result, "printer.", &info);
        }

        let available_ports = if do_probe {
            crate::serial::enumerate_ports(true)
        } else {
            Vec::new()
        };
        let cash_port = config_map.get("cash.com_port").cloned().unwrap_or_default();

        if payment_enabled {
            if self.devices.payment_terminal(CARD_TERMINAL_ID).is_none()
                && do_probe
                && !available_ports.is_empty()
            {
                if let Some((vendor, adapter)) = self.factory.detect_on_ports(
                    CARD_TERMINAL_ID,
                    &available_ports,
                    &cash_port,
                    Some(DeviceCategory::Card),
                ) {
                    log::info!("detect: found {vendor} card terminal on {}", adapter.com_port());
                    let _ = crate::serial::save_working_port(&adapter.com_port());
                    self.devices.register_payment_terminal(CARD_TERMINAL_ID, adapter);
                }
            }
            if let Some(terminal) = self.devices.payment_terminal(CARD_TERMINAL_ID) {
                let info = terminal.device_info();
                result.insert("payment.vendor".to_string(), terminal.vendor_name().to_string());
                result.insert("payment.comPort".to_string(), terminal.com_port());
                push_device_state(&mut result, "payment.", &info);
            } else {
                result.insert("payment.state".to_string(), "0".to_string());
                result.insert("payment.stateString".to_string(), "DISCONNECTED".to_string());
            }
        }

        if cash_enabled {
            if self.devices.payment_terminal(CASH_DEVICE_ID).is_none()
                && do_probe
                && !available_ports.is_empty()
            {
                // Skip the port the card terminal already claimed.
                let card_port = self
                    .devices
                    .payment_terminal(CARD_TERMINAL_ID)
                    .map(|t| t.com_port())
                    .unwrap_or_default();
                if let Some((vendor, adapter)) = self.factory.detect_on_ports(
                    CASH_DEVICE_ID,
                    &available_ports,
                    &card_port,
                    Some(DeviceCategory::Cash),
                ) {
                    log::info!("detect: found {vendor} cash device on {}", adapter.com_port());
                    self.devices.register_payment_terminal(CASH_DEVICE_ID, adapter);
                }
            }
            if let Some(device) = self.devices.payment_terminal(CASH_DEVICE_ID) {
                let info = device.device_info();
                result.insert("cash.vendor".to_string(), device.vendor_name().to_string());
                result.insert("cash.comPort".to_string(), device.com_port());
                push_device_state(&mut result, "cash.", &info);
            } else {
                result.insert("cash.state".to_string(), "0".to_string());
                result.insert("cash.stateString".to_string(), "DISCONNECTED".to_string());
            }
        }

        Response::ok(&command.command_id, result)
    }

    // ---- cash ----

    fn handle_cash_start(&self, command: &Command, test_mode: bool) -> Response {
        let amount = if test_mode {
            0
        } else {
            match Self::parse_amount(command) {
                Ok(amount) => amount,
                Err(response) => return *response,
            }
        };
        let device = match self.cash_device(command) {
            Ok(device) => device,
            Err(response) => return *response,
        };

        match device.start_payment(amount) {
            Ok(()) => {
                let mut result = BTreeMap::new();
                result.insert("deviceId".to_string(), device.device_info().device_id);
                result.insert("targetAmount".to_string(), amount.to_string());
                result.insert(
                    "testMode".to_string(),
                    if test_mode { "true" } else { "false" }.to_string(),
                );
                Response::ok(&command.command_id, result)
            }
            Err(err) => Response::failed(
                &command.command_id,
                IpcErrorCode::PaymentStartFailed,
                err.message(),
            ),
        }
    }

    /// System status check on client connect: PROCESSING terminals are
    /// cancelled and re-read after a grace period, every device gets a
    /// `check_device`, and one `system_status_check` event goes out.
    pub fn perform_system_status_check(&self) {
        log::info!("router: system status check starting");
        let mut statuses: Vec<DeviceInfo> = Vec::new();
        let mut all_healthy = true;

        for device_id in self.devices.device_ids(DeviceType::Payment) {
            let Some(terminal) = self.devices.payment_terminal(&device_id) else {
                continue;
            };
            let mut info = terminal.device_info();
            if info.state == DeviceState::Processing {
                log::warn!("status check: {device_id} is PROCESSING, cancelling");
                let _ = terminal.cancel_payment();
                std::thread::sleep(std::time::Duration::from_millis(500));
                info = terminal.device_info();
            }
            if terminal.check_device().is_err() {
                all_healthy = false;
            }
            info = terminal.device_info();
            if !info.is_healthy() {
                all_healthy = false;
            }
            statuses.push(info);
        }
        for device_id in self.devices.device_ids(DeviceType::Printer) {
            if let Some(printer) = self.devices.printer(&device_id) {
                let info = printer.device_info();
                if !info.is_healthy() {
                    all_healthy = false;
                }
                statuses.push(info);
            }
        }
        for device_id in self.devices.device_ids(DeviceType::Camera) {
            if let Some(camera) = self.devices.camera(&device_id) {
                let info = camera.device_info();
                if !info.is_healthy() {
                    all_healthy = false;
                }
                statuses.push(info);
            }
        }

        let mut data = BTreeMap::new();
        data.insert(
            "allHealthy".to_string(),
            if all_healthy { "true" } else { "false" }.to_string(),
        );
        data.insert("deviceCount".to_string(), statuses.len().to_string());
        for (index, info) in statuses.iter().enumerate() {
            push_device_info(&mut data, &format!("devices[{index}]."), info);
        }
        log::info!("router: system status check complete, all healthy: {all_healthy}");
        self.emit(Event::new(EventType::SystemStatusCheck, "system", data));
    }
}

fn push_device_info(map: &mut BTreeMap<String, String>, prefix: &str, info: &DeviceInfo) {
    map.insert(format!("{prefix}deviceId"), info.device_id.clone());
    map.insert(format!("{prefix}deviceType"), info.device_type.to_string());
    map.insert(format!("{prefix}deviceName"), info.device_name.clone());
    push_device_state(map, prefix, info);
}

fn push_device_state(map: &mut BTreeMap<String, String>, prefix: &str, info: &DeviceInfo) {
    map.insert(format!("{prefix}state"), u8::from(info.state).to_string());
    map.insert(format!("{prefix}stateString"), info.state.to_string());
    map.insert(format!("{prefix}lastError"), info.last_error.clone());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::mock::MockCamera;
    use crate::device::terminal::{
        CardUid, IcCardStatus, PaymentCancelledCallback, PaymentCompleteCallback,
        PaymentCompleteEvent, PaymentFailedCallback, StateChangedCallback, TerminalExtensions,
        TransactionCancelResult,
    };
    use crate::error::{Error, Result as CrateResult};
    use crate::printer::mock::MockPrinter;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct MockTerminal {
        state: Mutex<DeviceState>,
        with_extensions: bool,
        started: AtomicU32,
        cancelled: AtomicBool,
    }

    impl MockTerminal {
        fn ready(with_extensions: bool) -> Arc<Self> {
            Arc::new(Self {
                state: Mutex::new(DeviceState::Ready),
                with_extensions,
                started: AtomicU32::new(0),
                cancelled: AtomicBool::new(false),
            })
        }
    }

    impl crate::device::PaymentTerminal for MockTerminal {
        fn device_info(&self) -> DeviceInfo {
            let mut info = DeviceInfo::new("card_terminal_001", DeviceType::Payment, "Mock");
            info.state = *self.state.lock().unwrap();
            info
        }

        fn start_payment(&self, _amount: u32) -> CrateResult<()> {
            self.started.fetch_add(1, Ordering::SeqCst);
            *self.state.lock().unwrap() = DeviceState::Processing;
            Ok(())
        }

        fn cancel_payment(&self) -> CrateResult<()> {
            self.cancelled.store(true, Ordering::SeqCst);
            *self.state.lock().unwrap() = DeviceState::Ready;
            Ok(())
        }

        fn state(&self) -> DeviceState {
            *self.state.lock().unwrap()
        }

        fn reset(&self) -> CrateResult<()> {
            *self.state.lock().unwrap() = DeviceState::Ready;
            Ok(())
        }

        fn check_device(&self) -> CrateResult<()> {
            Ok(())
        }

        fn vendor_name(&self) -> &'static str {
            "mock"
        }

        fn com_port(&self) -> String {
            "COM1".to_string()
        }

        fn reconnect(&self, _new_port: &str) -> CrateResult<()> {
            Ok(())
        }

        fn set_payment_complete_callback(&self, _callback: PaymentCompleteCallback) {}
        fn set_payment_failed_callback(&self, _callback: PaymentFailedCallback) {}
        fn set_payment_cancelled_callback(&self, _callback: PaymentCancelledCallback) {}
        fn set_state_changed_callback(&self, _callback: StateChangedCallback) {}

        fn extensions(&self) -> Option<&dyn TerminalExtensions> {
            if self.with_extensions {
                Some(self)
            } else {
                None
            }
        }
    }

    impl TerminalExtensions for MockTerminal {
        fn read_card_uid(&self) -> CrateResult<CardUid> {
            Ok(CardUid {
                bytes: vec![0x04, 0xa2],
            })
        }

        fn check_ic_card(&self) -> CrateResult<IcCardStatus> {
            Ok(IcCardStatus { inserted: false })
        }

        fn set_screen_sound(
            &self,
            settings: &ScreenSoundSettings,
        ) -> CrateResult<ScreenSoundSettings> {
            Ok(*settings)
        }

        fn cancel_transaction(
            &self,
            _request: &TransactionCancelRequest,
        ) -> CrateResult<TransactionCancelResult> {
            Err(Error::failure("no original transaction"))
        }

        fn last_approval(&self) -> CrateResult<PaymentCompleteEvent> {
            Ok(PaymentCompleteEvent {
                transaction_id: "TX1".to_string(),
                ..PaymentCompleteEvent::default()
            })
        }
    }

    fn router_with(terminal: Option<Arc<MockTerminal>>) -> (Router, Arc<DeviceManager>) {
        let devices = Arc::new(DeviceManager::new());
        if let Some(terminal) = terminal {
            devices.register_payment_terminal(CARD_TERMINAL_ID, terminal);
        }
        let config = Arc::new(Mutex::new(Config::default()));
        let factory = Arc::new(TerminalFactory::new());
        let worker = Arc::new(WorkerQueue::new());
        (
            Router::new(Arc::clone(&devices), config, factory, worker),
            devices,
        )
    }

    fn command(command_type: &str, id: &str) -> Command {
        Command {
            protocol_version: "1.0".into(),
            kind: "command".into(),
            command_id: id.into(),
            type_tag: command_type.into(),
            timestamp_ms: 0,
            payload: BTreeMap::new(),
        }
    }

    #[test]
    fn test_unknown_command_rejected() {
        let (router, _devices) = router_with(None);
        let response = router.handle(&command("nuke_kiosk", "abc"));
        assert_eq!(response.status, crate::ipc::ResponseStatus::Rejected);
        assert_eq!(response.error_code.as_deref(), Some("UNKNOWN_COMMAND"));
        assert_eq!(response.command_id, "abc");
    }

    #[test]
    fn test_duplicate_command_id_replays_identical_response() {
        let (router, _devices) = router_with(Some(MockTerminal::ready(true)));
        let mut cmd = command("payment_start", "dup-1");
        cmd.payload.insert("amount".into(), "1000".into());

        let first = router.handle(&cmd);
        let second = router.handle(&cmd);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_payment_start_happy_path() {
        let terminal = MockTerminal::ready(true);
        let (router, _devices) = router_with(Some(Arc::clone(&terminal)));
        let mut cmd = command("payment_start", "c-1");
        cmd.payload.insert("amount".into(), "1000".into());

        let response = router.handle(&cmd);
        assert_eq!(response.status, crate::ipc::ResponseStatus::Ok);
        let result = response.result.unwrap();
        assert_eq!(result["deviceId"], "card_terminal_001");
        assert_eq!(result["state"], "2");
        assert_eq!(result["stateString"], "READY");
        assert_eq!(terminal.started.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_payment_start_missing_amount() {
        let (router, _devices) = router_with(Some(MockTerminal::ready(true)));
        let response = router.handle(&command("payment_start", "c-2"));
        assert_eq!(response.status, crate::ipc::ResponseStatus::Rejected);
        assert_eq!(response.error_code.as_deref(), Some("INVALID_PAYLOAD"));
    }

    #[test]
    fn test_payment_start_not_ready() {
        let terminal = MockTerminal::ready(true);
        *terminal.state.lock().unwrap() = DeviceState::Processing;
        let (router, _devices) = router_with(Some(terminal));
        let mut cmd = command("payment_start", "c-3");
        cmd.payload.insert("amount".into(), "1000".into());

        let response = router.handle(&cmd);
        assert_eq!(response.status, crate::ipc::ResponseStatus::Rejected);
        assert_eq!(response.error_code.as_deref(), Some("DEVICE_NOT_READY"));
    }

    #[test]
    fn test_payment_start_no_device() {
        let (router, _devices) = router_with(None);
        let mut cmd = command("payment_start", "c-4");
        cmd.payload.insert("amount".into(), "1000".into());
        let response = router.handle(&cmd);
        assert_eq!(response.error_code.as_deref(), Some("DEVICE_NOT_FOUND"));
    }

    #[test]
    fn test_extended_op_without_capability() {
        let (router, _devices) = router_with(Some(MockTerminal::ready(false)));
        let response = router.handle(&command("payment_card_uid_read", "c-5"));
        assert_eq!(response.status, crate::ipc::ResponseStatus::Rejected);
        assert_eq!(response.error_code.as_deref(), Some("INVALID_DEVICE_TYPE"));
    }

    #[test]
    fn test_card_uid_read() {
        let (router, _devices) = router_with(Some(MockTerminal::ready(true)));
        let response = router.handle(&command("payment_card_uid_read", "c-6"));
        assert_eq!(response.status, crate::ipc::ResponseStatus::Ok);
        assert_eq!(response.result.unwrap()["uid"], "04A2");
    }

    #[test]
    fn test_transaction_cancel_failure_maps_code() {
        let (router, _devices) = router_with(Some(MockTerminal::ready(true)));
        let mut cmd = command("payment_transaction_cancel", "c-7");
        cmd.payload.insert("amount".into(), "1000".into());
        let response = router.handle(&cmd);
        assert_eq!(response.status, crate::ipc::ResponseStatus::Failed);
        assert_eq!(
            response.error_code.as_deref(),
            Some("TRANSACTION_CANCEL_FAILED")
        );
    }

    #[test]
    fn test_screen_sound_payload_validation() {
        let (router, _devices) = router_with(Some(MockTerminal::ready(true)));
        let mut cmd = command("payment_screen_sound_setting", "c-8");
        cmd.payload.insert("screenBrightness".into(), "12".into());
        cmd.payload.insert("soundVolume".into(), "3".into());
        cmd.payload.insert("touchSoundVolume".into(), "3".into());
        let response = router.handle(&cmd);
        assert_eq!(response.error_code.as_deref(), Some("INVALID_PAYLOAD"));
    }

    #[test]
    fn test_worker_queued_reset_acknowledges_immediately() {
        let (router, _devices) = router_with(Some(MockTerminal::ready(true)));
        let response = router.handle(&command("payment_reset", "c-9"));
        assert_eq!(response.status, crate::ipc::ResponseStatus::Ok);
        assert_eq!(response.result.unwrap()["queued"], "true");
    }

    #[test]
    fn test_get_and_set_config() {
        let (router, _devices) = router_with(None);
        let response = router.handle(&command("get_config", "c-10"));
        let result = response.result.unwrap();
        assert_eq!(result.len(), 9);
        assert_eq!(result["payment.enabled"], "1");

        let mut cmd = command("set_config", "c-11");
        cmd.payload.insert("cash.enabled".into(), "0".into());
        let response = router.handle(&cmd);
        assert_eq!(response.status, crate::ipc::ResponseStatus::Ok);
        assert_eq!(response.result.unwrap()["cash.enabled"], "0");

        let mut cmd = command("set_config", "c-12");
        cmd.payload.insert("bogus.key".into(), "1".into());
        let response = router.handle(&cmd);
        assert_eq!(response.error_code.as_deref(), Some("INVALID_PAYLOAD"));
    }

    #[test]
    fn test_device_list_and_snapshot() {
        let (router, devices) = router_with(Some(MockTerminal::ready(true)));
        devices.register_camera("cam", Arc::new(MockCamera::ready("cam")));
        devices.register_printer("prn", Arc::new(MockPrinter::ready("prn")));

        let response = router.handle(&command("get_device_list", "c-13"));
        let result = response.result.unwrap();
        assert_eq!(result["deviceCount"], "3");
        assert_eq!(result["devices[0].deviceId"], "card_terminal_001");
        assert_eq!(result["devices[1].deviceType"], "printer");
        assert_eq!(result["devices[2].deviceType"], "camera");

        let response = router.handle(&command("get_state_snapshot", "c-14"));
        assert_eq!(response.result.unwrap()["allHealthy"], "true");
    }

    #[test]
    fn test_camera_capture_and_status() {
        let (router, devices) = router_with(None);
        devices.register_camera("cam", Arc::new(MockCamera::ready("cam")));

        let response = router.handle(&command("camera_status", "c-15"));
        assert_eq!(response.result.unwrap()["stateString"], "READY");

        let mut cmd = command("camera_capture", "c-16");
        cmd.payload.insert("captureId".into(), "cap-1".into());
        let response = router.handle(&cmd);
        assert_eq!(response.status, crate::ipc::ResponseStatus::Ok);
        assert_eq!(response.result.unwrap()["captureId"], "cap-1");
    }

    #[test]
    fn test_printer_print_requires_path() {
        let (router, devices) = router_with(None);
        devices.register_printer("prn", Arc::new(MockPrinter::ready("prn")));

        let response = router.handle(&command("printer_print", "c-17"));
        assert_eq!(response.error_code.as_deref(), Some("INVALID_PAYLOAD"));

        let mut cmd = command("printer_print", "c-18");
        cmd.payload.insert("imagePath".into(), "/tmp/photo.png".into());
        let response = router.handle(&cmd);
        assert_eq!(response.status, crate::ipc::ResponseStatus::Ok);
    }

    #[test]
    fn test_status_check_cancels_processing_terminal() {
        let terminal = MockTerminal::ready(true);
        *terminal.state.lock().unwrap() = DeviceState::Processing;
        let (router, _devices) = router_with(Some(Arc::clone(&terminal)));

        let events: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_events = Arc::clone(&events);
        router.set_event_sink(Arc::new(move |event| {
            sink_events.lock().unwrap().push(event);
        }));

        router.perform_system_status_check();

        assert!(terminal.cancelled.load(Ordering::SeqCst));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::SystemStatusCheck);
        assert_eq!(events[0].data["allHealthy"], "true");
        assert_eq!(events[0].data["devices[0].stateString"], "READY");
    }
}
