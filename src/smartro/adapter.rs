use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::terminal::{
    CardUid, IcCardStatus, MediumTag, PaymentCancelledCallback, PaymentCancelledEvent,
    PaymentCompleteCallback, PaymentCompleteEvent, PaymentFailedCallback, PaymentFailedEvent,
    PaymentTerminal, ScreenSoundSettings, StateChangedCallback, TerminalExtensions,
    TransactionCancelRequest, TransactionCancelResult,
};
use crate::device::{DeviceInfo, DeviceState, DeviceType};
use crate::error::{Error, ErrorCode, Result};
use crate::serial::{ClosedPort, SerialPort, CARD_BAUD};
use crate::smartro::comm::Comm;
use crate::smartro::messages::{ApprovalDetail, ApprovalRequest, EventKind};
use crate::smartro::{DEFAULT_TERMINAL_ID, VENDOR_NAME};

/// Error code surfaced when the VAN rejects an approval.
pub const ERROR_VAN_REJECTED: &str = "VAN_REJECTED";
/// Error code surfaced when the user never presents a card.
pub const ERROR_USER_INACTIVITY: &str = "USER_INACTIVITY_TIMEOUT";
/// Error code for all other campaign failures.
pub const ERROR_PAYMENT_FAILED: &str = "PAYMENT_FAILED";

struct Inner {
    state: DeviceState,
    last_error: String,
    last_update_ms: i64,
    payment_in_progress: bool,
    /// Set by `cancel_payment`; the campaign result is discarded when set.
    cancelled: bool,
    current_amount: u32,
    last_terminal_event: Option<EventKind>,
}

struct Callbacks {
    complete: Mutex<Option<PaymentCompleteCallback>>,
    failed: Mutex<Option<PaymentFailedCallback>>,
    cancelled: Mutex<Option<PaymentCancelledCallback>>,
    state_changed: Mutex<Option<StateChangedCallback>>,
}

/// SMARTRO card terminal adapter.
///
/// Owns the [`Comm`] engine, a payment thread per campaign and the event
/// monitor draining unsolicited terminal notices. Callbacks are invoked with
/// no internal lock held.
pub struct SmartroTerminal {
    device_id: String,
    terminal_id: String,
    com_port: Mutex<String>,
    comm: Arc<Comm>,
    inner: Arc<Mutex<Inner>>,
    cancel_flag: Arc<AtomicBool>,
    callbacks: Arc<Callbacks>,
    payment_thread: Mutex<Option<JoinHandle<()>>>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
    monitor_running: Arc<AtomicBool>,
}

impl SmartroTerminal {
    /// Build an adapter bound to `com_port`. The port is opened lazily by
    /// `check_device` / `reconnect`, so construction never blocks on
    /// hardware.
    pub fn new(device_id: &str, com_port: &str) -> Arc<Self> {
        let comm = Arc::new(Comm::new(Box::new(ClosedPort::new(com_port))));
        Self::with_comm(device_id, com_port, comm)
    }

    /// Build around an existing engine. Tests inject scripted ports here.
    pub fn with_comm(device_id: &str, com_port: &str, comm: Arc<Comm>) -> Arc<Self> {
        let adapter = Arc::new(Self {
            device_id: device_id.to_string(),
            terminal_id: DEFAULT_TERMINAL_ID.to_string(),
            com_port: Mutex::new(com_port.to_string()),
            comm,
            inner: Arc::new(Mutex::new(Inner {
                state: DeviceState::Disconnected,
                last_error: String::new(),
                last_update_ms: crate::epoch_millis(),
                payment_in_progress: false,
                cancelled: false,
                current_amount: 0,
                last_terminal_event: None,
            })),
            cancel_flag: Arc::new(AtomicBool::new(false)),
            callbacks: Arc::new(Callbacks {
                complete: Mutex::new(None),
                failed: Mutex::new(None),
                cancelled: Mutex::new(None),
                state_changed: Mutex::new(None),
            }),
            payment_thread: Mutex::new(None),
            monitor_thread: Mutex::new(None),
            monitor_running: Arc::new(AtomicBool::new(false)),
        });

        adapter.comm.start_receiver();
        adapter.start_event_monitor();
        adapter
    }

    /// Detection probe: open the candidate at 115200 8N1 and device-check it.
    pub fn try_port(port_name: &str) -> bool {
        match SerialPort::open(port_name, CARD_BAUD) {
            Ok(mut port) => {
                let found = crate::smartro::comm::probe_on(&mut port);
                crate::serial::BytePort::close(&mut port);
                found
            }
            Err(err) => {
                log::debug!("[SMARTRO] probe open failed on {port_name}: {err}");
                false
            }
        }
    }

    fn start_event_monitor(&self) {
        if self.monitor_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let (tx, rx) = mpsc::channel();
        self.comm.set_event_sink(tx);

        let inner = Arc::clone(&self.inner);
        let running = Arc::clone(&self.monitor_running);
        let handle = thread::Builder::new()
            .name("smartro-events".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(notice) => {
                            log::info!("[SMARTRO] terminal notice: {}", notice.kind);
                            inner.lock().unwrap().last_terminal_event = Some(notice.kind);
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn event monitor");
        *self.monitor_thread.lock().unwrap() = Some(handle);
    }

    fn stop_threads(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.payment_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.monitor_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.monitor_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.comm.stop_receiver();
        self.comm.close();
    }

    /// Last unsolicited notice seen, for diagnostics.
    pub fn last_terminal_event(&self) -> Option<EventKind> {
        self.inner.lock().unwrap().last_terminal_event
    }

    fn update_state(&self, new_state: DeviceState) {
        Self::update_state_on(&self.inner, &self.callbacks, new_state);
    }

    fn update_state_on(
        inner: &Mutex<Inner>,
        callbacks: &Callbacks,
        new_state: DeviceState,
    ) {
        let callback = {
            let mut inner = inner.lock().unwrap();
            if inner.state == new_state {
                return;
            }
            inner.state = new_state;
            inner.last_update_ms = crate::epoch_millis();
            callbacks.state_changed.lock().unwrap().clone()
        };
        if let Some(callback) = callback {
            callback(new_state);
        }
    }

    fn set_last_error(&self, message: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.last_error = message.to_string();
        inner.last_update_ms = crate::epoch_millis();
    }

    fn ensure_port_open(&self) -> Result<()> {
        if self.comm.is_open() {
            return Ok(());
        }
        let name = self.com_port.lock().unwrap().clone();
        if name.is_empty() {
            return Err(Error::serial("no COM port configured"));
        }
        let port = SerialPort::open(&name, CARD_BAUD)?;
        self.comm.replace_port(Box::new(port));
        Ok(())
    }

    fn build_complete_event(detail: &ApprovalDetail, amount: u32) -> PaymentCompleteEvent {
        PaymentCompleteEvent {
            transaction_id: detail.transaction_id.clone(),
            amount,
            card_number: detail.card_number.clone(),
            approval_number: detail.approval_number.clone(),
            sales_date: detail.sales_date.clone(),
            sales_time: detail.sales_time.clone(),
            transaction_medium: MediumTag::from(detail.transaction_medium).to_string(),
            state: Some(DeviceState::Ready),
            status: "SUCCESS".to_string(),
            transaction_type: detail.transaction_type_label().to_string(),
            approval_amount: detail.approval_amount.clone(),
            tax: detail.tax.clone(),
            service_charge: detail.service_charge.clone(),
            installments: detail.installments.clone(),
            merchant_number: detail.merchant_number.clone(),
            terminal_number: detail.terminal_number.clone(),
            issuer: detail.issuer.clone(),
            acquirer: detail.acquirer.clone(),
        }
    }

    /// Campaign epilogue, run on the payment thread.
    fn finish_campaign(
        inner: &Mutex<Inner>,
        callbacks: &Callbacks,
        result: Result<ApprovalDetail>,
    ) {
        let (amount, was_cancelled) = {
            let mut guard = inner.lock().unwrap();
            let cancelled = guard.cancelled;
            guard.payment_in_progress = false;
            (guard.current_amount, cancelled)
        };

        if was_cancelled {
            // The response of a cancelled campaign is discarded without
            // firing callbacks; cancel_payment already emitted its event.
            log::info!("[SMARTRO] discarding campaign result after cancel");
            return;
        }

        match result {
            Ok(detail) => {
                Self::update_state_on(inner, callbacks, DeviceState::Ready);
                let event = Self::build_complete_event(&detail, amount);
                let callback = callbacks.complete.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(&event);
                }
            }
            Err(err) if err.code() == ErrorCode::Cancelled => {
                log::info!("[SMARTRO] campaign ended by cancel flag");
            }
            Err(err) => {
                let (code, state) = match err.code() {
                    ErrorCode::UserInactivityTimeout => {
                        (ERROR_USER_INACTIVITY, DeviceState::Ready)
                    }
                    ErrorCode::Rejected | ErrorCode::RejectedWaitingCardRemoval => {
                        (ERROR_VAN_REJECTED, DeviceState::Ready)
                    }
                    ErrorCode::SerialPort => (ERROR_PAYMENT_FAILED, DeviceState::Error),
                    _ => (ERROR_PAYMENT_FAILED, DeviceState::Error),
                };
                {
                    let mut guard = inner.lock().unwrap();
                    guard.last_error = err.message().to_string();
                }
                Self::update_state_on(inner, callbacks, state);
                let event = PaymentFailedEvent {
                    error_code: code.to_string(),
                    error_message: err.message().to_string(),
                    amount,
                    state: Some(state),
                };
                let callback = callbacks.failed.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(&event);
                }
            }
        }
    }
}

impl PaymentTerminal for SmartroTerminal {
    fn device_info(&self) -> DeviceInfo {
        let inner = self.inner.lock().unwrap();
        DeviceInfo {
            device_id: self.device_id.clone(),
            device_type: DeviceType::Payment,
            device_name: "SMARTRO Payment Terminal".to_string(),
            state: inner.state,
            last_error: inner.last_error.clone(),
            last_update_ms: inner.last_update_ms,
        }
    }

    fn start_payment(&self, amount: u32) -> Result<()> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != DeviceState::Ready {
                let message = format!("device is not ready, current state: {}", inner.state);
                inner.last_error = message.clone();
                return Err(Error::failure(message));
            }
            if inner.payment_in_progress {
                inner.last_error = "payment already in progress".to_string();
                return Err(Error::failure("payment already in progress"));
            }
            inner.payment_in_progress = true;
            inner.cancelled = false;
            inner.current_amount = amount;
        }
        self.cancel_flag.store(false, Ordering::SeqCst);
        self.update_state(DeviceState::Processing);

        let comm = Arc::clone(&self.comm);
        let inner = Arc::clone(&self.inner);
        let callbacks = Arc::clone(&self.callbacks);
        let cancel_flag = Arc::clone(&self.cancel_flag);
        let terminal_id = self.terminal_id.clone();
        let request = ApprovalRequest::approval(amount);

        let handle = thread::Builder::new()
            .name("smartro-payment".to_string())
            .spawn(move || {
                let result = comm.approve_payment(&terminal_id, &request, &cancel_flag);
                Self::finish_campaign(&inner, &callbacks, result);
            })
            .map_err(|e| Error::failure(format!("failed to spawn payment thread: {e}")))?;

        // One campaign at a time; a finished predecessor is reaped here.
        let mut slot = self.payment_thread.lock().unwrap();
        if let Some(old) = slot.take() {
            let _ = old.join();
        }
        *slot = Some(handle);
        Ok(())
    }

    fn cancel_payment(&self) -> Result<()> {
        let emit = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.payment_in_progress {
                // Second cancel is a no-op: safe, and no second event.
                return Ok(());
            }
            inner.payment_in_progress = false;
            inner.cancelled = true;
            true
        };
        self.cancel_flag.store(true, Ordering::SeqCst);
        self.update_state(DeviceState::Ready);

        if emit {
            let callback = self.callbacks.cancelled.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(&PaymentCancelledEvent {
                    state: DeviceState::Ready,
                });
            }
        }

        // Force the terminal out of its waiting state. The in-flight B
        // response is discarded by the campaign thread.
        if let Err(err) = self.comm.request_cancel(&self.terminal_id) {
            self.set_last_error(&format!("cancel command failed: {}", err.message()));
            return Err(err);
        }
        log::info!("[SMARTRO] payment cancelled");
        Ok(())
    }

    fn state(&self) -> DeviceState {
        self.inner.lock().unwrap().state
    }

    fn reset(&self) -> Result<()> {
        self.ensure_port_open()?;
        match self.comm.reset(&self.terminal_id) {
            Ok(()) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.payment_in_progress = false;
                    inner.cancelled = false;
                    inner.last_error.clear();
                }
                self.cancel_flag.store(false, Ordering::SeqCst);
                self.update_state(DeviceState::Ready);
                Ok(())
            }
            Err(err) => {
                self.set_last_error(err.message());
                Err(err)
            }
        }
    }

    fn check_device(&self) -> Result<()> {
        let previous = self.state();
        self.update_state(DeviceState::Connecting);
        if let Err(err) = self.ensure_port_open() {
            self.set_last_error(err.message());
            self.update_state(DeviceState::Disconnected);
            return Err(err);
        }

        match self.comm.device_check(&self.terminal_id) {
            Ok(status) if status.all_healthy() => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.last_error.clear();
                }
                self.update_state(DeviceState::Ready);
                Ok(())
            }
            Ok(status) => {
                let message = format!("device check failed: {status}");
                self.set_last_error(&message);
                self.update_state(DeviceState::Error);
                Err(Error::failure(message))
            }
            Err(err) if err.code() == ErrorCode::DeviceBusy => {
                // A campaign owns the port; report busy without disturbing
                // its state.
                self.update_state(previous);
                Err(err)
            }
            Err(err) => {
                self.set_last_error(err.message());
                let state = if err.code() == ErrorCode::Timeout {
                    DeviceState::Hung
                } else {
                    DeviceState::Error
                };
                self.update_state(state);
                Err(err)
            }
        }
    }

    fn vendor_name(&self) -> &'static str {
        VENDOR_NAME
    }

    fn com_port(&self) -> String {
        self.com_port.lock().unwrap().clone()
    }

    fn reconnect(&self, new_port: &str) -> Result<()> {
        if new_port.is_empty() {
            return Err(Error::failure("empty port name"));
        }
        if self.inner.lock().unwrap().payment_in_progress {
            let _ = self.cancel_payment();
        }
        self.comm.close();
        *self.com_port.lock().unwrap() = new_port.to_string();
        self.update_state(DeviceState::Disconnected);
        log::info!("[SMARTRO] rebound to {new_port}; next check opens it");
        Ok(())
    }

    fn set_payment_complete_callback(&self, callback: PaymentCompleteCallback) {
        *self.callbacks.complete.lock().unwrap() = Some(callback);
    }

    fn set_payment_failed_callback(&self, callback: PaymentFailedCallback) {
        *self.callbacks.failed.lock().unwrap() = Some(callback);
    }

    fn set_payment_cancelled_callback(&self, callback: PaymentCancelledCallback) {
        *self.callbacks.cancelled.lock().unwrap() = Some(callback);
    }

    fn set_state_changed_callback(&self, callback: StateChangedCallback) {
        *self.callbacks.state_changed.lock().unwrap() = Some(callback);
    }

    fn shutdown(&self) {
        self.stop_threads();
    }

    fn extensions(&self) -> Option<&dyn TerminalExtensions> {
        Some(self)
    }
}

impl TerminalExtensions for SmartroTerminal {
    fn read_card_uid(&self) -> Result<CardUid> {
        let bytes = self.comm.read_card_uid(&self.terminal_id)?;
        Ok(CardUid { bytes })
    }

    fn check_ic_card(&self) -> Result<IcCardStatus> {
        let inserted = self.comm.check_ic_card(&self.terminal_id)?;
        Ok(IcCardStatus { inserted })
    }

    fn set_screen_sound(&self, settings: &ScreenSoundSettings) -> Result<ScreenSoundSettings> {
        self.comm.set_screen_sound(&self.terminal_id, settings)
    }

    fn cancel_transaction(
        &self,
        request: &TransactionCancelRequest,
    ) -> Result<TransactionCancelResult> {
        let detail = self.comm.cancel_transaction(&self.terminal_id, request)?;
        if detail.is_rejected() {
            return Err(Error::new(
                ErrorCode::Rejected,
                if detail.rejection_info.is_empty() {
                    "transaction cancel rejected".to_string()
                } else {
                    detail.rejection_info.clone()
                },
            ));
        }
        Ok(TransactionCancelResult {
            transaction_type: detail.transaction_type_label().to_string(),
            transaction_medium: MediumTag::from(detail.transaction_medium).to_string(),
            card_number: detail.card_number,
            approval_amount: detail.approval_amount,
            tax: detail.tax,
            service_charge: detail.service_charge,
            installments: detail.installments,
            approval_number: detail.approval_number,
            sales_date: detail.sales_date,
            sales_time: detail.sales_time,
        })
    }

    fn last_approval(&self) -> Result<PaymentCompleteEvent> {
        let detail = self.comm.last_approval(&self.terminal_id)?;
        let amount = detail.approval_amount.parse().unwrap_or(0);
        Ok(Self::build_complete_event(&detail, amount))
    }
}

impl Drop for SmartroTerminal {
    fn drop(&mut self) {
        self.stop_threads();
    }
}
