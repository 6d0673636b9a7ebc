use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::lv77::protocol::*;
use crate::lv77::{RESET_TIMEOUT, SILENCE_THRESHOLD, SLOW_POLL_INTERVAL};
use crate::serial::{read_byte, BytePort};

/// Decides whether the bill held in escrow is stacked or returned.
pub type EscrowCallback = Arc<dyn Fn(u32) -> bool + Send + Sync>;
/// Invoked with the escrow amount once the validator reports stacking.
pub type StackedCallback = Arc<dyn Fn(u32) + Send + Sync>;
/// Invoked with raw status bytes (enable/inhibit/jam codes).
pub type StatusCallback = Arc<dyn Fn(u8) + Send + Sync>;

#[derive(Default)]
struct PollCallbacks {
    escrow: Mutex<Option<EscrowCallback>>,
    stacked: Mutex<Option<StackedCallback>>,
    status: Mutex<Option<StatusCallback>>,
}

/// LV77 link: owns the port mutex and the polling thread.
///
/// All writes are serialized through the port mutex so the poll loop and
/// one-shot commands never interleave bytes. `stop_poll_loop` joins the
/// thread and must never be called from the poll thread itself; completion
/// work triggered by a poll callback goes through a channel to whoever owns
/// the adapter.
pub struct Lv77Comm {
    port: Arc<Mutex<Box<dyn BytePort>>>,
    callbacks: Arc<PollCallbacks>,
    poll_running: Arc<AtomicBool>,
    poll_thread: Mutex<Option<JoinHandle<()>>>,
    escrow_amount: Arc<AtomicU32>,
    last_error: Mutex<String>,
}

impl Lv77Comm {
    pub fn new(port: Box<dyn BytePort>) -> Self {
        Self {
            port: Arc::new(Mutex::new(port)),
            callbacks: Arc::new(PollCallbacks::default()),
            poll_running: Arc::new(AtomicBool::new(false)),
            poll_thread: Mutex::new(None),
            escrow_amount: Arc::new(AtomicU32::new(0)),
            last_error: Mutex::new(String::new()),
        }
    }

    pub fn is_open(&self) -> bool {
        self.port.lock().unwrap().is_open()
    }

    pub fn port_name(&self) -> String {
        self.port.lock().unwrap().name().to_string()
    }

    pub fn close(&self) {
        self.port.lock().unwrap().close();
    }

    /// Swap the underlying port (reconnect path).
    pub fn replace_port(&self, port: Box<dyn BytePort>) {
        let mut slot = self.port.lock().unwrap();
        slot.close();
        *slot = port;
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().unwrap().clone()
    }

    fn set_error(&self, message: &str) {
        log::warn!("[LV77] {message}");
        *self.last_error.lock().unwrap() = message.to_string();
    }

    pub fn set_escrow_callback(&self, callback: EscrowCallback) {
        *self.callbacks.escrow.lock().unwrap() = Some(callback);
    }

    pub fn set_stacked_callback(&self, callback: StackedCallback) {
        *self.callbacks.stacked.lock().unwrap() = Some(callback);
    }

    pub fn set_status_callback(&self, callback: StatusCallback) {
        *self.callbacks.status.lock().unwrap() = Some(callback);
    }

    fn write_byte(&self, byte: u8) -> Result<()> {
        self.port.lock().unwrap().write_all(&[byte])
    }

    fn read_one(&self, timeout: Duration) -> Result<Option<u8>> {
        let mut port = self.port.lock().unwrap();
        read_byte(port.as_mut(), timeout)
    }

    /// Power-up handshake: drain a pending `0x80`, send the sync ack and
    /// wait for `0x8F` plus two optional country-code bytes.
    ///
    /// A silent or surprising device is tolerated: it may already be past
    /// its sync window, so the link proceeds with a warning.
    pub fn sync_after_power_up(&self, timeout: Duration) -> Result<()> {
        if let Some(byte) = self.read_one(Duration::from_millis(300))? {
            if byte == RSP_POWER_UP {
                log::info!("[LV77] power-up byte received, sending sync ack");
            }
        }

        self.write_byte(CMD_SYNC_ACK)?;

        match self.read_one(timeout)? {
            None => {
                log::warn!("[LV77] no sync answer; device may already be running");
                Ok(())
            }
            Some(RSP_SYNC_OK) => {
                // Country code bytes follow; read and discard so the buffer
                // is clean for polling.
                let _ = self.read_one(Duration::from_millis(200))?;
                let _ = self.read_one(Duration::from_millis(200))?;
                log::info!("[LV77] sync OK");
                Ok(())
            }
            Some(other) => {
                log::warn!("[LV77] unexpected sync answer 0x{other:02X}; proceeding");
                Ok(())
            }
        }
    }

    pub fn enable(&self) -> Result<()> {
        self.write_byte(CMD_ENABLE).map_err(|e| {
            self.set_error(&format!("failed to send enable: {}", e.message()));
            e
        })
    }

    pub fn disable(&self) -> Result<()> {
        self.write_byte(CMD_DISABLE).map_err(|e| {
            self.set_error(&format!("failed to send disable: {}", e.message()));
            e
        })
    }

    /// Stack the bill held in escrow.
    pub fn accept_bill(&self) -> Result<()> {
        self.write_byte(CMD_SYNC_ACK)
    }

    /// Return the bill held in escrow.
    pub fn reject_bill(&self) -> Result<()> {
        self.write_byte(CMD_REJECT_BILL)
    }

    /// One poll: send the status request and read a single answer byte.
    pub fn poll_once(&self, timeout: Duration) -> Result<Option<u8>> {
        self.write_byte(CMD_POLL_STATUS)?;
        self.read_one(timeout)
    }

    /// Reset round-trip: `0x30`, expect `0x80`, answer `0x02`, expect `0x8F`.
    pub fn reset(&self) -> Result<()> {
        self.write_byte(CMD_RESET)?;
        match self.read_one(RESET_TIMEOUT)? {
            Some(RSP_POWER_UP) => {}
            Some(other) => {
                let message = format!("reset: expected 0x80, got 0x{other:02X}");
                self.set_error(&message);
                return Err(Error::protocol(message));
            }
            None => {
                self.set_error("reset: no response");
                return Err(Error::timeout("reset: no response"));
            }
        }
        self.write_byte(CMD_SYNC_ACK)?;
        match self.read_one(RESET_TIMEOUT)? {
            Some(RSP_SYNC_OK) => {
                log::info!("[LV77] reset OK");
                Ok(())
            }
            _ => {
                self.set_error("reset: expected 0x8F after sync");
                Err(Error::protocol("reset: expected 0x8F after sync"))
            }
        }
    }

    /// Start the background poll loop. Idempotent.
    pub fn start_poll_loop(&self, interval: Duration) {
        if self.poll_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let port = Arc::clone(&self.port);
        let callbacks = Arc::clone(&self.callbacks);
        let running = Arc::clone(&self.poll_running);
        let escrow_amount = Arc::clone(&self.escrow_amount);

        let handle = thread::Builder::new()
            .name("lv77-poll".to_string())
            .spawn(move || poll_loop(port, callbacks, running, escrow_amount, interval))
            .expect("failed to spawn poll thread");
        *self.poll_thread.lock().unwrap() = Some(handle);
        log::info!(
            "[LV77] poll loop started, interval {}ms",
            interval.as_millis()
        );
    }

    /// Stop and join the poll loop. Must not be called from the poll thread.
    pub fn stop_poll_loop(&self) {
        if !self.poll_running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.poll_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        log::info!("[LV77] poll loop stopped");
    }

    pub fn poll_loop_running(&self) -> bool {
        self.poll_running.load(Ordering::SeqCst)
    }
}

impl Drop for Lv77Comm {
    fn drop(&mut self) {
        self.stop_poll_loop();
        self.close();
    }
}

/// Sleep in slices so the stop flag stays observed.
fn sleep_observing(running: &AtomicBool, duration: Duration) {
    let until = Instant::now() + duration;
    while running.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= until {
            return;
        }
        thread::sleep(Duration::from_millis(20).min(until - now));
    }
}

fn poll_loop(
    port: Arc<Mutex<Box<dyn BytePort>>>,
    callbacks: Arc<PollCallbacks>,
    running: Arc<AtomicBool>,
    escrow_amount: Arc<AtomicU32>,
    interval: Duration,
) {
    let mut silent_polls = 0u32;

    while running.load(Ordering::SeqCst) {
        let tick_start = Instant::now();

        {
            let mut port = port.lock().unwrap();
            if !port.is_open() || port.write_all(&[CMD_POLL_STATUS]).is_err() {
                break;
            }
        }
        thread::sleep(Duration::from_millis(3));

        let answer = {
            let mut port = port.lock().unwrap();
            match read_byte(port.as_mut(), interval) {
                Ok(answer) => answer,
                Err(_) => break,
            }
        };

        let Some(byte) = answer else {
            silent_polls += 1;
            if silent_polls == SILENCE_THRESHOLD {
                log::warn!(
                    "[LV77] {SILENCE_THRESHOLD} silent polls (check cable); slowing to {}s",
                    SLOW_POLL_INTERVAL.as_secs()
                );
            }
            if silent_polls >= SILENCE_THRESHOLD {
                sleep_observing(&running, SLOW_POLL_INTERVAL);
            }
            continue;
        };
        silent_polls = 0;

        match byte {
            RSP_BILL_VALIDATED => {
                let bill_type = {
                    let mut port = port.lock().unwrap();
                    read_byte(port.as_mut(), Duration::from_millis(500))
                        .ok()
                        .flatten()
                };
                handle_escrow(&port, &callbacks, &escrow_amount, bill_type);
            }
            RSP_STACKING => {
                let amount = escrow_amount.load(Ordering::SeqCst);
                let callback = callbacks.stacked.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(amount);
                }
            }
            status => {
                let callback = callbacks.status.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(status);
                }
            }
        }

        let elapsed = tick_start.elapsed();
        if elapsed < interval {
            sleep_observing(&running, interval - elapsed);
        }
    }
    log::debug!("[LV77] poll loop exiting");
}

fn handle_escrow(
    port: &Mutex<Box<dyn BytePort>>,
    callbacks: &PollCallbacks,
    escrow_amount: &AtomicU32,
    bill_type: Option<u8>,
) {
    let Some(code) = bill_type.filter(|&code| is_bill_type(code)) else {
        log::warn!("[LV77] missing or invalid bill type after 0x81; rejecting");
        let _ = port.lock().unwrap().write_all(&[CMD_REJECT_BILL]);
        return;
    };

    let amount = bill_code_amount(code);
    if amount == 0 || !is_accepted_bill_type(code) {
        log::info!(
            "[LV77] unaccepted bill type 0x{code:02X} ({amount} KRW); rejecting"
        );
        let _ = port.lock().unwrap().write_all(&[CMD_REJECT_BILL]);
        return;
    }

    escrow_amount.store(amount, Ordering::SeqCst);
    let callback = callbacks.escrow.lock().unwrap().clone();
    let accept = callback.map(|cb| cb(amount)).unwrap_or(true);

    let command = if accept { CMD_SYNC_ACK } else { CMD_REJECT_BILL };
    let _ = port.lock().unwrap().write_all(&[command]);
    if accept {
        log::info!("[LV77] escrow accept: {amount} KRW");
    } else {
        log::info!("[LV77] escrow reject: {amount} KRW");
    }
}
