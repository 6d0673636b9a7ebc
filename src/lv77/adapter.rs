use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::terminal::{
    BillStackedCallback, CashAcceptorExtensions, MediumTag, PaymentCancelledCallback,
    PaymentCancelledEvent, PaymentCompleteCallback, PaymentCompleteEvent, PaymentFailedCallback,
    PaymentFailedEvent, PaymentTerminal, StateChangedCallback, TargetReachedCallback,
};
use crate::device::{DeviceInfo, DeviceState, DeviceType};
use crate::error::{Error, Result};
use crate::lv77::comm::Lv77Comm;
use crate::lv77::protocol::{STATUS_ENABLED, STATUS_INHIBITED};
use crate::lv77::{ACTIVE_POLL_INTERVAL, SYNC_TIMEOUT, VENDOR_NAME};
use crate::serial::{ClosedPort, ParityMode, SerialPort, CASH_BAUD};

/// Error code fired when a bill would overshoot the campaign target.
pub const ERROR_BILL_RETURNED: &str = "CASH_BILL_RETURNED";

/// The escrow decision: accept while the running total stays within the
/// target; a zero target is test mode and accepts every recognized bill.
pub fn escrow_accepts(target: u32, current_total: u32, bill: u32) -> bool {
    target == 0 || current_total + bill <= target
}

struct Inner {
    state: DeviceState,
    last_error: String,
    last_update_ms: i64,
    payment_in_progress: bool,
    cancelled: bool,
}

struct Callbacks {
    complete: Mutex<Option<PaymentCompleteCallback>>,
    failed: Mutex<Option<PaymentFailedCallback>>,
    cancelled: Mutex<Option<PaymentCancelledCallback>>,
    state_changed: Mutex<Option<StateChangedCallback>>,
    bill_stacked: Mutex<Option<BillStackedCallback>>,
    target_reached: Mutex<Option<TargetReachedCallback>>,
}

/// LV77 cash acceptor adapter.
///
/// A cash campaign carries a target amount and a running total; the escrow
/// policy accepts a bill only while the total stays within the target
/// (a zero target is test mode and accepts everything). When the target is
/// reached the poll thread signals the housekeeper, which stops the loop,
/// disables the acceptor and fires the target-reached callback; the poll
/// thread itself never joins itself.
pub struct Lv77CashAcceptor {
    device_id: String,
    com_port: Mutex<String>,
    comm: Arc<Lv77Comm>,
    inner: Arc<Mutex<Inner>>,
    target: Arc<AtomicU32>,
    total: Arc<AtomicU32>,
    callbacks: Arc<Callbacks>,
    housekeeper_tx: Mutex<mpsc::Sender<u32>>,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
    housekeeper_running: Arc<AtomicBool>,
}

impl Lv77CashAcceptor {
    /// Build an adapter bound to `com_port`; the port is opened on demand.
    pub fn new(device_id: &str, com_port: &str) -> Arc<Self> {
        let comm = Arc::new(Lv77Comm::new(Box::new(ClosedPort::new(com_port))));
        Self::with_comm(device_id, com_port, comm)
    }

    /// Build around an existing link. Tests inject scripted ports here.
    pub fn with_comm(device_id: &str, com_port: &str, comm: Arc<Lv77Comm>) -> Arc<Self> {
        let (housekeeper_tx, housekeeper_rx) = mpsc::channel::<u32>();
        let adapter = Arc::new(Self {
            device_id: device_id.to_string(),
            com_port: Mutex::new(com_port.to_string()),
            comm,
            inner: Arc::new(Mutex::new(Inner {
                state: DeviceState::Disconnected,
                last_error: String::new(),
                last_update_ms: crate::epoch_millis(),
                payment_in_progress: false,
                cancelled: false,
            })),
            target: Arc::new(AtomicU32::new(0)),
            total: Arc::new(AtomicU32::new(0)),
            callbacks: Arc::new(Callbacks {
                complete: Mutex::new(None),
                failed: Mutex::new(None),
                cancelled: Mutex::new(None),
                state_changed: Mutex::new(None),
                bill_stacked: Mutex::new(None),
                target_reached: Mutex::new(None),
            }),
            housekeeper_tx: Mutex::new(housekeeper_tx),
            housekeeper: Mutex::new(None),
            housekeeper_running: Arc::new(AtomicBool::new(true)),
        });

        let comm = Arc::clone(&adapter.comm);
        let callbacks = Arc::clone(&adapter.callbacks);
        let running = Arc::clone(&adapter.housekeeper_running);
        let handle = thread::Builder::new()
            .name("lv77-housekeeper".to_string())
            .spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match housekeeper_rx.recv_timeout(Duration::from_millis(200)) {
                        Ok(total) => {
                            comm.stop_poll_loop();
                            let _ = comm.disable();
                            log::info!(
                                "[LV77] target reached ({total} KRW); acceptor disabled"
                            );
                            let callback = callbacks.target_reached.lock().unwrap().clone();
                            if let Some(callback) = callback {
                                callback(total);
                            }
                        }
                        Err(mpsc::RecvTimeoutError::Timeout) => {}
                        Err(mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .expect("failed to spawn housekeeper");
        *adapter.housekeeper.lock().unwrap() = Some(handle);
        adapter
    }

    /// Detection probe: 9600 8E1, sync, enable, one poll; the port belongs
    /// to an LV77 when the first answer is the enable or inhibit status.
    pub fn try_port(port_name: &str) -> bool {
        let Ok(mut port) = SerialPort::open(port_name, CASH_BAUD) else {
            return false;
        };
        if crate::serial::BytePort::set_parity(&mut port, ParityMode::Even).is_err() {
            return false;
        }
        let comm = Lv77Comm::new(Box::new(port));
        if comm.sync_after_power_up(SYNC_TIMEOUT).is_err() {
            return false;
        }
        if comm.enable().is_err() {
            return false;
        }
        match comm.poll_once(Duration::from_millis(500)) {
            Ok(Some(status)) => matches!(status, STATUS_ENABLED | STATUS_INHIBITED),
            _ => false,
        }
    }

    fn stop_threads(&self) {
        self.comm.stop_poll_loop();
        let _ = self.comm.disable();
        self.housekeeper_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.housekeeper.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.comm.close();
    }

    fn update_state(&self, new_state: DeviceState) {
        let callback = {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == new_state {
                return;
            }
            inner.state = new_state;
            inner.last_update_ms = crate::epoch_millis();
            self.callbacks.state_changed.lock().unwrap().clone()
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

    fn ensure_open_and_synced(&self) -> Result<()> {
        if self.comm.is_open() {
            return Ok(());
        }
        let name = self.com_port.lock().unwrap().clone();
        if name.is_empty() {
            return Err(Error::serial("no COM port configured"));
        }
        let mut port = SerialPort::open(&name, CASH_BAUD)?;
        crate::serial::BytePort::set_parity(&mut port, ParityMode::Even)?;
        self.comm.replace_port(Box::new(port));
        self.comm.sync_after_power_up(SYNC_TIMEOUT)
    }

    fn cash_transaction_id() -> String {
        format!("CASH-{}", chrono::Local::now().format("%Y%m%d%H%M%S"))
    }

    /// Stacked-bill bookkeeping, run on the poll thread.
    fn on_bill_stacked(
        inner: &Mutex<Inner>,
        callbacks: &Callbacks,
        target: &AtomicU32,
        total: &AtomicU32,
        housekeeper_tx: &mpsc::Sender<u32>,
        amount: u32,
    ) {
        {
            let guard = inner.lock().unwrap();
            if guard.cancelled || !guard.payment_in_progress {
                return;
            }
        }

        let current = total.fetch_add(amount, Ordering::SeqCst) + amount;
        log::info!("[LV77] bill accepted: {amount} KRW (total {current})");

        let stacked = callbacks.bill_stacked.lock().unwrap().clone();
        if let Some(callback) = stacked {
            callback(amount, current);
        } else {
            // Without a cash-specific listener each stacked bill surfaces as
            // its own completed payment.
            let complete = callbacks.complete.lock().unwrap().clone();
            if let Some(callback) = complete {
                callback(&PaymentCompleteEvent {
                    transaction_id: Self::cash_transaction_id(),
                    amount,
                    transaction_medium: MediumTag::Cash.to_string(),
                    state: Some(DeviceState::Ready),
                    status: "SUCCESS".to_string(),
                    transaction_type: "Cash".to_string(),
                    approval_amount: amount.to_string(),
                    ..PaymentCompleteEvent::default()
                });
            }
        }

        let target_amount = target.load(Ordering::SeqCst);
        if target_amount > 0 && current >= target_amount {
            {
                let mut guard = inner.lock().unwrap();
                guard.payment_in_progress = false;
                guard.state = DeviceState::Ready;
                guard.last_update_ms = crate::epoch_millis();
            }
            let state_changed = callbacks.state_changed.lock().unwrap().clone();
            if let Some(callback) = state_changed {
                callback(DeviceState::Ready);
            }
            // Stop-and-disable must not run on this thread.
            let _ = housekeeper_tx.send(current);
        }
    }
}

impl PaymentTerminal for Lv77CashAcceptor {
    fn device_info(&self) -> DeviceInfo {
        let inner = self.inner.lock().unwrap();
        DeviceInfo {
            device_id: self.device_id.clone(),
            device_type: DeviceType::Payment,
            device_name: "LV77 Bill Validator (ICT-104U)".to_string(),
            state: inner.state,
            last_error: inner.last_error.clone(),
            last_update_ms: inner.last_update_ms,
        }
    }

    /// Start a cash campaign toward `amount`. Zero means test mode: every
    /// recognized bill is accepted and reported, with no completion target.
    fn start_payment(&self, amount: u32) -> Result<()> {
        if let Err(err) = self.ensure_open_and_synced() {
            self.set_last_error(err.message());
            self.update_state(DeviceState::Disconnected);
            return Err(err);
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.payment_in_progress {
                inner.last_error = "payment already in progress".to_string();
                return Err(Error::failure("payment already in progress"));
            }
            inner.payment_in_progress = true;
            inner.cancelled = false;
        }
        self.target.store(amount, Ordering::SeqCst);
        self.total.store(0, Ordering::SeqCst);
        self.update_state(DeviceState::Processing);

        // Escrow policy: accept while the total stays within the target.
        let target = Arc::clone(&self.target);
        let total = Arc::clone(&self.total);
        let callbacks = Arc::clone(&self.callbacks);
        self.comm.set_escrow_callback(Arc::new(move |bill| {
            let target_amount = target.load(Ordering::SeqCst);
            let current = total.load(Ordering::SeqCst);
            if escrow_accepts(target_amount, current, bill) {
                return true;
            }
            log::info!(
                "[LV77] bill returned (would exceed target): {bill} KRW, \
                 target={target_amount} current={current}"
            );
            let failed = callbacks.failed.lock().unwrap().clone();
            if let Some(callback) = failed {
                callback(&PaymentFailedEvent {
                    error_code: ERROR_BILL_RETURNED.to_string(),
                    error_message: "exceeds target amount (no change); bill returned"
                        .to_string(),
                    amount: bill,
                    state: Some(DeviceState::Processing),
                });
            }
            false
        }));

        let inner = Arc::clone(&self.inner);
        let callbacks = Arc::clone(&self.callbacks);
        let target = Arc::clone(&self.target);
        let total = Arc::clone(&self.total);
        let housekeeper_tx = self.housekeeper_tx.lock().unwrap().clone();
        self.comm.set_stacked_callback(Arc::new(move |amount| {
            Self::on_bill_stacked(&inner, &callbacks, &target, &total, &housekeeper_tx, amount);
        }));

        let status_inner = Arc::clone(&self.inner);
        self.comm.set_status_callback(Arc::new(move |code| {
            if crate::lv77::protocol::is_fault_status(code) {
                let message = crate::lv77::protocol::status_string(code);
                log::warn!("[LV77] fault status: {message}");
                status_inner.lock().unwrap().last_error = message;
            } else {
                log::debug!(
                    "[LV77] status: {}",
                    crate::lv77::protocol::status_string(code)
                );
            }
        }));

        if let Err(err) = self.comm.enable() {
            self.inner.lock().unwrap().payment_in_progress = false;
            self.set_last_error(err.message());
            self.update_state(DeviceState::Error);
            return Err(err);
        }
        self.comm.start_poll_loop(ACTIVE_POLL_INTERVAL);
        log::info!("[LV77] cash payment started, target {amount} KRW");
        Ok(())
    }

    fn cancel_payment(&self) -> Result<()> {
        let emit = {
            let mut inner = self.inner.lock().unwrap();
            if !inner.payment_in_progress {
                return Ok(());
            }
            inner.payment_in_progress = false;
            inner.cancelled = true;
            true
        };
        self.comm.stop_poll_loop();
        let _ = self.comm.disable();
        self.update_state(DeviceState::Ready);

        if emit {
            let callback = self.callbacks.cancelled.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(&PaymentCancelledEvent {
                    state: DeviceState::Ready,
                });
            }
        }
        log::info!("[LV77] cash payment cancelled");
        Ok(())
    }

    fn state(&self) -> DeviceState {
        self.inner.lock().unwrap().state
    }

    fn reset(&self) -> Result<()> {
        if !self.comm.is_open() {
            return Err(Error::serial("device not connected"));
        }
        self.comm.stop_poll_loop();
        match self.comm.reset() {
            Ok(()) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.payment_in_progress = false;
                    inner.cancelled = false;
                    inner.last_error.clear();
                }
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
        self.update_state(DeviceState::Connecting);
        if let Err(err) = self.ensure_open_and_synced() {
            self.set_last_error(err.message());
            self.update_state(DeviceState::Disconnected);
            return Err(err);
        }
        // Don't poke the wire while a campaign's poll loop owns it.
        if self.comm.poll_loop_running() {
            self.update_state(DeviceState::Processing);
            return Ok(());
        }

        self.comm.enable()?;
        match self.comm.poll_once(Duration::from_millis(500))? {
            Some(STATUS_ENABLED) | Some(STATUS_INHIBITED) => {
                self.inner.lock().unwrap().last_error.clear();
                self.update_state(DeviceState::Ready);
                Ok(())
            }
            Some(other) => {
                let message = format!(
                    "unexpected status: {}",
                    crate::lv77::protocol::status_string(other)
                );
                self.set_last_error(&message);
                self.update_state(DeviceState::Error);
                Err(Error::failure(message))
            }
            None => {
                self.set_last_error("validator silent");
                self.update_state(DeviceState::Disconnected);
                Err(Error::timeout("validator silent"))
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
        self.comm.stop_poll_loop();
        self.comm.close();
        *self.com_port.lock().unwrap() = new_port.to_string();
        self.update_state(DeviceState::Disconnected);
        log::info!("[LV77] rebound to {new_port}; next start opens it");
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

    fn cash_extensions(&self) -> Option<&dyn CashAcceptorExtensions> {
        Some(self)
    }
}

impl CashAcceptorExtensions for Lv77CashAcceptor {
    fn set_bill_stacked_callback(&self, callback: BillStackedCallback) {
        *self.callbacks.bill_stacked.lock().unwrap() = Some(callback);
    }

    fn set_target_reached_callback(&self, callback: TargetReachedCallback) {
        *self.callbacks.target_reached.lock().unwrap() = Some(callback);
    }

    fn running_total(&self) -> u32 {
        self.total.load(Ordering::SeqCst)
    }

    fn target_amount(&self) -> u32 {
        self.target.load(Ordering::SeqCst)
    }
}

impl Drop for Lv77CashAcceptor {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lv77::protocol::*;
    use crate::serial::script::ScriptPort;
    use std::collections::VecDeque;
    use std::sync::mpsc::channel;

    /// Fake validator: polls answer from a script; accepting a bill queues a
    /// stacking report for the next poll.
    fn validator_port(bills: Vec<u8>) -> ScriptPort {
        let port = ScriptPort::new();
        let mut pending: VecDeque<Vec<u8>> =
            bills.into_iter().map(|b| vec![RSP_BILL_VALIDATED, b]).collect();
        let mut stacking: VecDeque<u8> = VecDeque::new();
        port.set_responder(Box::new(move |written, rx| match written {
            [CMD_POLL_STATUS] => {
                if let Some(code) = stacking.pop_front() {
                    rx.push_back(code);
                } else if let Some(bytes) = pending.pop_front() {
                    rx.extend(bytes);
                }
            }
            [CMD_SYNC_ACK] => {
                stacking.push_back(RSP_STACKING);
            }
            _ => {}
        }));
        port
    }

    fn adapter_over(port: &ScriptPort) -> Arc<Lv77CashAcceptor> {
        let comm = Arc::new(Lv77Comm::new(Box::new(port.clone())));
        Lv77CashAcceptor::with_comm("lv77_cash_001", "SCRIPT0", comm)
    }

    #[test]
    fn test_escrow_law() {
        // accept iff total + bill <= target; zero target accepts everything
        for target in [1_000u32, 5_000, 11_000] {
            for current in [0u32, 1_000, 2_000, 10_000] {
                for bill in [1_000u32, 5_000, 10_000] {
                    assert_eq!(
                        escrow_accepts(target, current, bill),
                        current + bill <= target,
                        "target={target} current={current} bill={bill}"
                    );
                }
            }
        }
        assert!(escrow_accepts(0, 0, 1_000));
        assert!(escrow_accepts(0, 1_000_000, 100_000));
    }

    #[test]
    fn test_cash_campaign_reaches_target() {
        // Target 3 000: two 1 000 bills, a 10 000 that must be returned,
        // then the closing 1 000.
        let port = validator_port(vec![0x40, 0x40, 0x42, 0x40]);
        let adapter = adapter_over(&port);

        let (stacked_tx, stacked_rx) = channel();
        adapter.set_bill_stacked_callback(Arc::new(move |amount, total| {
            let _ = stacked_tx.send((amount, total));
        }));
        let (failed_tx, failed_rx) = channel();
        adapter.set_payment_failed_callback(Arc::new(move |event| {
            let _ = failed_tx.send(event.clone());
        }));
        let (reached_tx, reached_rx) = channel();
        adapter.set_target_reached_callback(Arc::new(move |total| {
            let _ = reached_tx.send(total);
        }));

        adapter.start_payment(3_000).unwrap();
        assert_eq!(adapter.state(), DeviceState::Processing);

        let wait = Duration::from_secs(5);
        assert_eq!(stacked_rx.recv_timeout(wait).unwrap(), (1_000, 1_000));
        assert_eq!(stacked_rx.recv_timeout(wait).unwrap(), (1_000, 2_000));

        // The 10 000 bill bounces with a failure event.
        let failed = failed_rx.recv_timeout(wait).unwrap();
        assert_eq!(failed.error_code, ERROR_BILL_RETURNED);
        assert_eq!(failed.amount, 10_000);

        // The last 1 000 completes the campaign.
        assert_eq!(stacked_rx.recv_timeout(wait).unwrap(), (1_000, 3_000));
        assert_eq!(reached_rx.recv_timeout(wait).unwrap(), 3_000);

        // Housekeeper disables the acceptor and stops polling.
        let deadline = std::time::Instant::now() + wait;
        while adapter.comm.poll_loop_running() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert!(!adapter.comm.poll_loop_running());
        assert_eq!(adapter.state(), DeviceState::Ready);
        assert!(port.written().contains(&CMD_DISABLE));
        assert_eq!(adapter.running_total(), 3_000);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let port = validator_port(Vec::new());
        let adapter = adapter_over(&port);

        let (tx, rx) = channel();
        adapter.set_payment_cancelled_callback(Arc::new(move |event| {
            let _ = tx.send(*event);
        }));

        adapter.start_payment(10_000).unwrap();
        adapter.cancel_payment().unwrap();
        adapter.cancel_payment().unwrap();

        assert!(rx.recv_timeout(Duration::from_secs(1)).is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.state(), DeviceState::Ready);
        assert!(!adapter.comm.poll_loop_running());
    }

    #[test]
    fn test_test_mode_accepts_everything() {
        // Target 0: even a big stack of bills keeps getting accepted and no
        // target-reached ever fires.
        let port = validator_port(vec![0x42, 0x41]);
        let adapter = adapter_over(&port);

        let (stacked_tx, stacked_rx) = channel();
        adapter.set_bill_stacked_callback(Arc::new(move |amount, total| {
            let _ = stacked_tx.send((amount, total));
        }));
        let (reached_tx, reached_rx) = channel();
        adapter.set_target_reached_callback(Arc::new(move |total| {
            let _ = reached_tx.send(total);
        }));

        adapter.start_payment(0).unwrap();
        let wait = Duration::from_secs(5);
        assert_eq!(stacked_rx.recv_timeout(wait).unwrap(), (10_000, 10_000));
        assert_eq!(stacked_rx.recv_timeout(wait).unwrap(), (5_000, 15_000));
        assert!(reached_rx.try_recv().is_err());

        adapter.cancel_payment().unwrap();
    }
}
