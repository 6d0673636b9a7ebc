use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{Error, ErrorCode, Result};
use crate::serial::{read_byte, BytePort};
use crate::smartro::frame::{Frame, JobCode, ACK, ETX, HEADER_SIZE, NACK, STX, TAIL_SIZE};
use crate::smartro::frame::{index, read_u16_le};
use crate::smartro::messages::{
    ApprovalDetail, ApprovalRequest, DeviceCheckStatus, EventNotice,
};
use crate::smartro::{
    ACK_TIMEOUT, CAMPAIGN_BUDGET, PROBE_TIMEOUT, READ_TIMEOUT, RESPONSE_TIMEOUT, RETRY_DELAY,
    RF_RETRY_DELAY,
};

/// Timing profile for one [`Comm`]. Production uses the module defaults;
/// tests shrink them.
#[derive(Clone, Copy, Debug)]
pub struct CommTiming {
    pub ack_timeout: Duration,
    pub response_timeout: Duration,
    pub read_timeout: Duration,
    pub campaign_budget: Duration,
    pub rf_retry_delay: Duration,
    pub retry_delay: Duration,
}

impl Default for CommTiming {
    fn default() -> Self {
        Self {
            ack_timeout: ACK_TIMEOUT,
            response_timeout: RESPONSE_TIMEOUT,
            read_timeout: READ_TIMEOUT,
            campaign_budget: CAMPAIGN_BUDGET,
            rf_retry_delay: RF_RETRY_DELAY,
            retry_delay: RETRY_DELAY,
        }
    }
}

/// A parsed solicited response tagged by job code.
#[derive(Clone, Debug, PartialEq)]
pub struct TerminalResponse {
    pub job: JobCode,
    pub frame: Frame,
}

/// Entries the receive thread produces for the request/response path.
#[derive(Clone, Debug, PartialEq)]
pub enum Incoming {
    Ack,
    Nack,
    Response(TerminalResponse),
}

#[derive(Default)]
struct IncomingQueue {
    entries: Mutex<VecDeque<Incoming>>,
    cond: Condvar,
}

impl IncomingQueue {
    fn push(&self, entry: Incoming) {
        self.entries.lock().unwrap().push_back(entry);
        self.cond.notify_all();
    }

    fn pop_deadline(&self, deadline: Instant) -> Option<Incoming> {
        let mut entries = self.entries.lock().unwrap();
        loop {
            if let Some(entry) = entries.pop_front() {
                return Some(entry);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _timeout) = self.cond.wait_timeout(entries, deadline - now).unwrap();
            entries = guard;
        }
    }

    fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

/// Steps of one payment-approval campaign.
enum CampaignStep {
    SendRequest,
    AwaitAck,
    AwaitResponse,
    Dispatch(Frame),
    RetryAfter(Duration),
    TimeoutCancel,
    Done(Result<ApprovalDetail>),
}

/// SMARTRO serial engine: owns the receive thread, the tagged response
/// queue, the handshake and the payment campaign.
///
/// All port writes go through one mutex, so the receive loop and request
/// writers never interleave bytes on the wire. A second mutex serializes
/// whole exchanges; the campaign holds it for its entire run, and the
/// extended operations acquire it with `try_lock` so they surface
/// `DeviceBusy` instead of parking behind a 30 s campaign.
pub struct Comm {
    port: Arc<Mutex<Box<dyn BytePort>>>,
    exchange: Mutex<()>,
    queue: Arc<IncomingQueue>,
    events: Arc<Mutex<Option<mpsc::Sender<EventNotice>>>>,
    running: Arc<AtomicBool>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    last_error: Mutex<String>,
    timing: CommTiming,
}

impl Comm {
    pub fn new(port: Box<dyn BytePort>) -> Self {
        Self::with_timing(port, CommTiming::default())
    }

    pub fn with_timing(port: Box<dyn BytePort>, timing: CommTiming) -> Self {
        Self {
            port: Arc::new(Mutex::new(port)),
            exchange: Mutex::new(()),
            queue: Arc::new(IncomingQueue::default()),
            events: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            receiver: Mutex::new(None),
            last_error: Mutex::new(String::new()),
            timing,
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

    /// Swap the underlying port (reconnect path). The receive thread picks
    /// the new port up on its next scan tick.
    pub fn replace_port(&self, port: Box<dyn BytePort>) {
        let mut slot = self.port.lock().unwrap();
        slot.close();
        *slot = port;
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().unwrap().clone()
    }

    fn set_error(&self, message: &str) {
        log::error!("[SMARTRO] {message}");
        *self.last_error.lock().unwrap() = message.to_string();
    }

    /// Deliver unsolicited `@` notices to `sender` from now on.
    pub fn set_event_sink(&self, sender: mpsc::Sender<EventNotice>) {
        *self.events.lock().unwrap() = Some(sender);
    }

    /// Start the background receive thread. Idempotent.
    pub fn start_receiver(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let port = Arc::clone(&self.port);
        let queue = Arc::clone(&self.queue);
        let events = Arc::clone(&self.events);
        let running = Arc::clone(&self.running);
        let timing = self.timing;

        let handle = thread::Builder::new()
            .name("smartro-rx".to_string())
            .spawn(move || receiver_loop(port, queue, events, running, timing))
            .expect("failed to spawn receiver thread");

        *self.receiver.lock().unwrap() = Some(handle);
        log::info!("[SMARTRO] response receiver started");
    }

    /// Stop and join the receive thread. Returns within one read tick.
    pub fn stop_receiver(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.receiver.lock().unwrap().take() {
            let _ = handle.join();
        }
        log::info!("[SMARTRO] response receiver stopped");
    }

    fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        self.port.lock().unwrap().write_all(bytes)
    }

    fn send_ack(&self) -> Result<()> {
        log::debug!("[SMARTRO] sending ACK");
        self.write_bytes(&[ACK])
    }

    /// One uniform request/response exchange while holding the exchange
    /// lock: write the frame, await ACK (a direct response frame counts as
    /// an inline start), await the response, ACK it.
    fn run_exchange(&self, request: &Frame, expect: JobCode) -> Result<Frame> {
        self.queue.clear();
        self.write_bytes(&request.encode())?;

        let deadline = Instant::now() + self.timing.ack_timeout;
        loop {
            match self.queue.pop_deadline(deadline) {
                None => {
                    return Err(Error::timeout(format!(
                        "no ACK for {expect} request within {}ms",
                        self.timing.ack_timeout.as_millis()
                    )))
                }
                Some(Incoming::Nack) => {
                    return Err(Error::new(ErrorCode::NackReceived, "terminal answered NACK"))
                }
                Some(Incoming::Ack) => break,
                Some(Incoming::Response(r)) if r.job == expect => {
                    // Terminal skipped the ACK phase.
                    self.send_ack()?;
                    return Ok(r.frame);
                }
                Some(Incoming::Response(r)) => {
                    log::warn!("[SMARTRO] discarding stale {} response", r.job);
                }
            }
        }

        let deadline = Instant::now() + self.timing.response_timeout;
        loop {
            match self.queue.pop_deadline(deadline) {
                None => {
                    return Err(Error::timeout(format!(
                        "no {expect} response within {}ms",
                        self.timing.response_timeout.as_millis()
                    )))
                }
                Some(Incoming::Response(r)) if r.job == expect => {
                    self.send_ack()?;
                    return Ok(r.frame);
                }
                Some(Incoming::Response(r)) => {
                    log::warn!("[SMARTRO] discarding unexpected {} response", r.job);
                }
                Some(Incoming::Ack) | Some(Incoming::Nack) => {}
            }
        }
    }

    /// Exchange for the extended operations: refuses with `DeviceBusy` when
    /// a campaign (or another exchange) owns the port.
    fn try_exchange(&self, request: &Frame, expect: JobCode) -> Result<Frame> {
        let Ok(_guard) = self.exchange.try_lock() else {
            return Err(Error::new(
                ErrorCode::DeviceBusy,
                "another exchange is in progress",
            ));
        };
        self.run_exchange(request, expect)
    }

    /// `A`: device check.
    pub fn device_check(&self, terminal_id: &str) -> Result<DeviceCheckStatus> {
        let request = Frame::request(terminal_id, JobCode::DeviceCheck, Vec::new())?;
        let response = self.try_exchange(&request, JobCode::DeviceCheck)?;
        DeviceCheckStatus::parse(&response.data)
    }

    /// `R`: terminal reset.
    pub fn reset(&self, terminal_id: &str) -> Result<()> {
        let request = Frame::request(terminal_id, JobCode::Reset, Vec::new())?;
        self.try_exchange(&request, JobCode::Reset)?;
        Ok(())
    }

    /// `F`: card UID read. The UID may legitimately be empty.
    pub fn read_card_uid(&self, terminal_id: &str) -> Result<Vec<u8>> {
        let request = Frame::request(terminal_id, JobCode::CardUidRead, Vec::new())?;
        let response = self.try_exchange(&request, JobCode::CardUidRead)?;
        Ok(response.data)
    }

    /// `M`: IC card slot check.
    pub fn check_ic_card(&self, terminal_id: &str) -> Result<bool> {
        let request = Frame::request(terminal_id, JobCode::IcCardCheck, Vec::new())?;
        let response = self.try_exchange(&request, JobCode::IcCardCheck)?;
        crate::smartro::messages::parse_ic_card(&response.data)
    }

    /// `S`: screen/sound settings; the terminal echoes what it applied.
    pub fn set_screen_sound(
        &self,
        terminal_id: &str,
        settings: &crate::device::ScreenSoundSettings,
    ) -> Result<crate::device::ScreenSoundSettings> {
        let data = crate::smartro::messages::encode_screen_sound(settings);
        let request = Frame::request(terminal_id, JobCode::ScreenSound, data)?;
        let response = self.try_exchange(&request, JobCode::ScreenSound)?;
        crate::smartro::messages::parse_screen_sound(&response.data)
    }

    /// `C`: cancel a previous transaction.
    pub fn cancel_transaction(
        &self,
        terminal_id: &str,
        request: &crate::device::TransactionCancelRequest,
    ) -> Result<ApprovalDetail> {
        let data = crate::smartro::messages::encode_cancel_request(request);
        let frame = Frame::request(terminal_id, JobCode::TransactionCancel, data)?;
        let response = self.try_exchange(&frame, JobCode::TransactionCancel)?;
        ApprovalDetail::parse(&response.data)
    }

    /// `L`: last approval detail.
    pub fn last_approval(&self, terminal_id: &str) -> Result<ApprovalDetail> {
        let request = Frame::request(terminal_id, JobCode::LastApproval, Vec::new())?;
        let response = self.try_exchange(&request, JobCode::LastApproval)?;
        ApprovalDetail::parse(&response.data)
    }

    /// Write an `E` (payment wait) frame around the exchange lock.
    ///
    /// This is the cancel path: it must land while a `B` is in flight, so it
    /// deliberately bypasses exchange serialization. The campaign discards
    /// whatever the terminal answers.
    pub fn request_cancel(&self, terminal_id: &str) -> Result<()> {
        let request = Frame::request(terminal_id, JobCode::PaymentWait, Vec::new())?;
        log::info!("[SMARTRO] writing payment-wait (cancel) frame");
        self.write_bytes(&request.encode())
    }

    /// `B`: run one payment-approval campaign.
    ///
    /// Bounded by the user-inactivity budget counted from the first write.
    /// Rejections branch on the transaction medium: IC aborts until the card
    /// is removed, RF retries after a pause, everything else retries
    /// quickly. On budget exhaustion an `E` frame forces the terminal out of
    /// its waiting state and `UserInactivityTimeout` is returned.
    pub fn approve_payment(
        &self,
        terminal_id: &str,
        request: &ApprovalRequest,
        cancel: &AtomicBool,
    ) -> Result<ApprovalDetail> {
        let _guard = self.exchange.lock().unwrap();

        let started = Instant::now();
        let budget = self.timing.campaign_budget;
        let mut step = CampaignStep::SendRequest;

        log::info!(
            "[SMARTRO] payment approval campaign started, {}s budget",
            budget.as_secs()
        );

        loop {
            // Single elapsed/cancel check per transition.
            let exhausted = started.elapsed() >= budget;
            if cancel.load(Ordering::SeqCst)
                && !matches!(step, CampaignStep::Done(_))
            {
                step = CampaignStep::Done(Err(Error::new(
                    ErrorCode::Cancelled,
                    "payment cancelled by client",
                )));
            } else if exhausted
                && !matches!(step, CampaignStep::TimeoutCancel | CampaignStep::Done(_))
            {
                step = CampaignStep::TimeoutCancel;
            }

            step = match step {
                CampaignStep::SendRequest => {
                    self.queue.clear();
                    let frame =
                        Frame::request(terminal_id, JobCode::PaymentApproval, request.encode())?;
                    log::debug!("[SMARTRO] sending payment approval request");
                    match self.write_bytes(&frame.encode()) {
                        Ok(()) => CampaignStep::AwaitAck,
                        Err(err) => CampaignStep::Done(Err(err)),
                    }
                }
                CampaignStep::AwaitAck => {
                    let wait = self.timing.ack_timeout.min(remaining(started, budget));
                    match self.queue.pop_deadline(Instant::now() + wait) {
                        None => {
                            if started.elapsed() >= budget {
                                CampaignStep::TimeoutCancel
                            } else {
                                CampaignStep::Done(Err(Error::timeout(
                                    "no ACK for payment approval",
                                )))
                            }
                        }
                        Some(Incoming::Nack) => CampaignStep::Done(Err(Error::new(
                            ErrorCode::NackReceived,
                            "terminal answered NACK to payment approval",
                        ))),
                        Some(Incoming::Ack) => CampaignStep::AwaitResponse,
                        Some(Incoming::Response(r))
                            if r.job == JobCode::PaymentApproval =>
                        {
                            CampaignStep::Dispatch(r.frame)
                        }
                        Some(Incoming::Response(r)) => {
                            log::warn!("[SMARTRO] discarding stale {} response", r.job);
                            CampaignStep::AwaitAck
                        }
                    }
                }
                CampaignStep::AwaitResponse => {
                    // The response wait spans the remaining user budget: the
                    // terminal answers only once a card is presented.
                    let wait = remaining(started, budget);
                    match self.queue.pop_deadline(Instant::now() + wait) {
                        None => CampaignStep::TimeoutCancel,
                        Some(Incoming::Response(r))
                            if r.job == JobCode::PaymentApproval =>
                        {
                            CampaignStep::Dispatch(r.frame)
                        }
                        Some(Incoming::Response(r)) => {
                            log::warn!("[SMARTRO] discarding unexpected {} response", r.job);
                            CampaignStep::AwaitResponse
                        }
                        Some(Incoming::Ack) | Some(Incoming::Nack) => {
                            CampaignStep::AwaitResponse
                        }
                    }
                }
                CampaignStep::Dispatch(frame) => match ApprovalDetail::parse(&frame.data) {
                    Err(err) => {
                        let _ = self.write_bytes(&[NACK]);
                        CampaignStep::Done(Err(err))
                    }
                    Ok(detail) => {
                        self.send_ack()?;
                        if !detail.is_rejected() {
                            log::info!(
                                "[SMARTRO] payment approved, transaction id {}",
                                detail.transaction_id
                            );
                            CampaignStep::Done(Ok(detail))
                        } else {
                            match detail.transaction_medium {
                                b'1' => {
                                    log::warn!(
                                        "[SMARTRO] approval rejected on IC; card removal \
                                         required before retry"
                                    );
                                    CampaignStep::Done(Err(Error::new(
                                        ErrorCode::RejectedWaitingCardRemoval,
                                        if detail.rejection_info.is_empty() {
                                            "payment rejected (IC)".to_string()
                                        } else {
                                            detail.rejection_info.clone()
                                        },
                                    )))
                                }
                                b'3' => {
                                    log::warn!(
                                        "[SMARTRO] approval rejected on RF; retrying after {}ms",
                                        self.timing.rf_retry_delay.as_millis()
                                    );
                                    CampaignStep::RetryAfter(self.timing.rf_retry_delay)
                                }
                                medium => {
                                    log::warn!(
                                        "[SMARTRO] approval rejected (medium 0x{medium:02X}); \
                                         retrying"
                                    );
                                    CampaignStep::RetryAfter(self.timing.retry_delay)
                                }
                            }
                        }
                    }
                },
                CampaignStep::RetryAfter(delay) => {
                    // Sleep in slices so cancel and budget stay responsive.
                    let until = Instant::now() + delay;
                    while Instant::now() < until
                        && !cancel.load(Ordering::SeqCst)
                        && started.elapsed() < budget
                    {
                        thread::sleep(Duration::from_millis(20).min(until - Instant::now()));
                    }
                    CampaignStep::SendRequest
                }
                CampaignStep::TimeoutCancel => {
                    log::warn!(
                        "[SMARTRO] campaign budget exhausted after {}s; sending payment wait",
                        started.elapsed().as_secs()
                    );
                    self.abort_with_payment_wait(terminal_id);
                    CampaignStep::Done(Err(Error::new(
                        ErrorCode::UserInactivityTimeout,
                        "user inactivity timeout",
                    )))
                }
                CampaignStep::Done(result) => {
                    if let Err(err) = &result {
                        self.set_error(err.message());
                    }
                    return result;
                }
            };
        }
    }

    /// Force the terminal out of its payment-waiting state with an `E`
    /// frame, consuming whatever answer arrives. Best effort.
    fn abort_with_payment_wait(&self, terminal_id: &str) {
        let Ok(frame) = Frame::request(terminal_id, JobCode::PaymentWait, Vec::new()) else {
            return;
        };
        self.queue.clear();
        if self.write_bytes(&frame.encode()).is_err() {
            return;
        }
        let deadline = Instant::now() + Duration::from_secs(3).min(self.timing.response_timeout);
        while let Some(entry) = self.queue.pop_deadline(deadline) {
            if let Incoming::Response(r) = entry {
                if r.job == JobCode::PaymentWait {
                    // Zero-length payloads are valid here.
                    let _ = self.send_ack();
                    log::info!("[SMARTRO] payment wait acknowledged, terminal state reset");
                    return;
                }
            }
        }
        log::warn!("[SMARTRO] no answer to payment wait; proceeding");
    }
}

impl Drop for Comm {
    fn drop(&mut self) {
        self.stop_receiver();
        self.close();
    }
}

fn remaining(started: Instant, budget: Duration) -> Duration {
    budget.saturating_sub(started.elapsed()).max(Duration::from_millis(1))
}

/// Receive loop: scan for STX, read complete frames, dispatch by job code.
///
/// Solicited responses and handshake bytes land in the tagged queue; `@`
/// event frames go to the event sink and get no reply; undecodable frames
/// are answered with NACK.
fn receiver_loop(
    port: Arc<Mutex<Box<dyn BytePort>>>,
    queue: Arc<IncomingQueue>,
    events: Arc<Mutex<Option<mpsc::Sender<EventNotice>>>>,
    running: Arc<AtomicBool>,
    timing: CommTiming,
) {
    log::debug!("[SMARTRO] receiver loop running");
    while running.load(Ordering::SeqCst) {
        let byte = {
            let mut port = port.lock().unwrap();
            if !port.is_open() {
                drop(port);
                thread::sleep(timing.read_timeout);
                continue;
            }
            read_byte(port.as_mut(), timing.read_timeout)
        };

        match byte {
            Err(err) => {
                // Port I/O faults are logged and the loop stays up; the next
                // command observing the fault marks the adapter state.
                log::debug!("[SMARTRO] receiver read error: {err}");
                thread::sleep(timing.read_timeout);
            }
            Ok(None) => {}
            Ok(Some(STX)) => {
                let frame_bytes = {
                    let mut port = port.lock().unwrap();
                    read_frame_rest(port.as_mut(), timing)
                };
                match frame_bytes.and_then(|bytes| Frame::decode(&bytes)) {
                    Ok(frame) => dispatch_frame(frame, &queue, &events),
                    Err(err) => {
                        log::warn!("[SMARTRO] dropping bad frame: {err}");
                        let _ = port.lock().unwrap().write_all(&[NACK]);
                    }
                }
            }
            Ok(Some(ACK)) => queue.push(Incoming::Ack),
            Ok(Some(NACK)) => queue.push(Incoming::Nack),
            Ok(Some(other)) => {
                log::trace!("[SMARTRO] discarding stray byte 0x{other:02X}");
            }
        }
    }
    log::debug!("[SMARTRO] receiver loop exiting");
}

fn dispatch_frame(
    frame: Frame,
    queue: &IncomingQueue,
    events: &Mutex<Option<mpsc::Sender<EventNotice>>>,
) {
    match JobCode::from_wire(frame.job_code) {
        Some(JobCode::Event) => {
            let notice = EventNotice {
                kind: frame.response_code.into(),
                data: frame.data,
            };
            log::info!("[SMARTRO] terminal event: {}", notice.kind);
            if let Some(sender) = events.lock().unwrap().as_ref() {
                let _ = sender.send(notice);
            }
        }
        Some(job) => queue.push(Incoming::Response(TerminalResponse { job, frame })),
        None => log::warn!(
            "[SMARTRO] frame with unknown job code 0x{:02X} dropped",
            frame.job_code
        ),
    }
}

/// Read the remainder of a frame whose STX was already consumed.
fn read_frame_rest(port: &mut dyn BytePort, timing: CommTiming) -> Result<Vec<u8>> {
    let deadline = Instant::now() + timing.response_timeout;
    let mut bytes = vec![STX];

    read_exact_deadline(port, &mut bytes, HEADER_SIZE - 1, deadline, timing.read_timeout)?;
    let data_len = read_u16_le(&bytes[index::DATA_LEN..index::DATA]) as usize;
    read_exact_deadline(port, &mut bytes, data_len + TAIL_SIZE, deadline, timing.read_timeout)?;

    if bytes[bytes.len() - 2] != ETX {
        return Err(Error::protocol("missing ETX at end of frame"));
    }
    log::trace!(
        "[SMARTRO] frame received: {}",
        crate::logging::hex_dump(&bytes)
    );
    Ok(bytes)
}

fn read_exact_deadline(
    port: &mut dyn BytePort,
    out: &mut Vec<u8>,
    count: usize,
    deadline: Instant,
    tick: Duration,
) -> Result<()> {
    let mut remaining_bytes = count;
    let mut buf = [0u8; 256];
    while remaining_bytes > 0 {
        if Instant::now() >= deadline {
            return Err(Error::timeout(format!(
                "frame truncated, {remaining_bytes} bytes missing"
            )));
        }
        let want = remaining_bytes.min(buf.len());
        let n = port.read_some(&mut buf[..want], tick)?;
        out.extend_from_slice(&buf[..n]);
        remaining_bytes -= n;
    }
    Ok(())
}

/// Detection probe: send a device check on an already-open candidate port
/// and accept when any well-formed `a` response arrives in time. Leaves no
/// threads behind.
pub fn probe_on(port: &mut dyn BytePort) -> bool {
    let Ok(request) = Frame::request(
        crate::smartro::DEFAULT_TERMINAL_ID,
        JobCode::DeviceCheck,
        Vec::new(),
    ) else {
        return false;
    };
    if port.write_all(&request.encode()).is_err() {
        return false;
    }

    let deadline = Instant::now() + PROBE_TIMEOUT;
    // Accept ACK then frame, or an inline frame without the ACK phase.
    loop {
        if Instant::now() >= deadline {
            return false;
        }
        match read_byte(port, READ_TIMEOUT) {
            Err(_) => return false,
            Ok(None) => continue,
            Ok(Some(ACK)) => continue,
            Ok(Some(STX)) => break,
            Ok(Some(_)) => continue,
        }
    }

    let timing = CommTiming {
        response_timeout: deadline.saturating_duration_since(Instant::now()),
        ..CommTiming::default()
    };
    match read_frame_rest(port, timing).and_then(|bytes| Frame::decode(&bytes)) {
        Ok(frame) if JobCode::from_wire(frame.job_code) == Some(JobCode::DeviceCheck) => {
            let _ = port.write_all(&[ACK]);
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serial::script::ScriptPort;
    use crate::smartro::DEFAULT_TERMINAL_ID;

    fn fast_timing() -> CommTiming {
        CommTiming {
            ack_timeout: Duration::from_millis(200),
            response_timeout: Duration::from_millis(300),
            read_timeout: Duration::from_millis(5),
            campaign_budget: Duration::from_millis(800),
            rf_retry_delay: Duration::from_millis(60),
            retry_delay: Duration::from_millis(20),
        }
    }

    fn response_frame(job: JobCode, data: Vec<u8>) -> Vec<u8> {
        Frame {
            terminal_id: crate::smartro::frame::format_terminal_id(DEFAULT_TERMINAL_ID).unwrap(),
            datetime: *b"20250301120000",
            job_code: job.response_byte(),
            response_code: 0,
            data,
        }
        .encode()
    }

    fn approval_payload(transaction_type: u8, medium: u8) -> Vec<u8> {
        let mut data = Vec::new();
        data.push(transaction_type);
        data.push(medium);
        data.extend_from_slice(&[b' '; 20]); // card number
        data.extend_from_slice(b"0000001000");
        data.extend_from_slice(b"00000000");
        data.extend_from_slice(b"00000000");
        data.extend_from_slice(b"00");
        data.extend_from_slice(b"APPROVAL0001");
        data.extend_from_slice(b"20250301");
        data.extend_from_slice(b"120000");
        data.extend_from_slice(b"TX0000000001");
        data.extend_from_slice(&[b' '; 15]);
        data.extend_from_slice(&[b' '; 14]);
        data.extend_from_slice(&[b' '; 20]); // issuer
        data.extend_from_slice(&[b' '; 20]); // rejection info
        data
    }

    /// Wire a responder that answers job-code requests like a terminal.
    fn scripted_terminal(
        port: &ScriptPort,
        mut answers: Vec<(u8, Vec<u8>)>,
    ) {
        port.set_responder(Box::new(move |written, rx| {
            // Handshake bytes from the host are not requests.
            if written == [ACK] || written == [NACK] {
                return;
            }
            let Ok(frame) = Frame::decode(written) else {
                return;
            };
            if let Some(pos) = answers
                .iter()
                .position(|(job, _)| *job == frame.job_code)
            {
                let (_, reply) = answers.remove(pos);
                rx.push_back(ACK);
                rx.extend(reply.iter().copied());
            }
        }));
    }

    #[test]
    fn test_device_check_exchange() {
        let port = ScriptPort::new();
        scripted_terminal(
            &port,
            vec![(b'A', response_frame(JobCode::DeviceCheck, b"ONNO".to_vec()))],
        );

        let comm = Comm::with_timing(Box::new(port.clone()), fast_timing());
        comm.start_receiver();

        let status = comm.device_check(DEFAULT_TERMINAL_ID).unwrap();
        assert!(status.all_healthy());

        comm.stop_receiver();
        // Host wrote the request frame and one trailing ACK.
        let written = port.written();
        assert_eq!(*written.last().unwrap(), ACK);
    }

    #[test]
    fn test_exchange_nack_aborts() {
        let port = ScriptPort::new();
        port.set_responder(Box::new(|written, rx| {
            if Frame::decode(written).is_ok() {
                rx.push_back(NACK);
            }
        }));

        let comm = Comm::with_timing(Box::new(port), fast_timing());
        comm.start_receiver();
        let err = comm.device_check(DEFAULT_TERMINAL_ID).unwrap_err();
        assert_eq!(err.code(), ErrorCode::NackReceived);
        comm.stop_receiver();
    }

    #[test]
    fn test_exchange_inline_response_skips_ack() {
        let port = ScriptPort::new();
        port.set_responder(Box::new(|written, rx| {
            if written == [ACK] {
                return;
            }
            if Frame::decode(written).is_ok() {
                // Response with no ACK phase at all.
                let reply = Frame {
                    terminal_id: crate::smartro::frame::format_terminal_id(DEFAULT_TERMINAL_ID)
                        .unwrap(),
                    datetime: *b"20250301120000",
                    job_code: b'r',
                    response_code: 0,
                    data: Vec::new(),
                }
                .encode();
                rx.extend(reply.iter().copied());
            }
        }));

        let comm = Comm::with_timing(Box::new(port), fast_timing());
        comm.start_receiver();
        comm.reset(DEFAULT_TERMINAL_ID).unwrap();
        comm.stop_receiver();
    }

    #[test]
    fn test_exchange_timeout() {
        let port = ScriptPort::new();
        let comm = Comm::with_timing(Box::new(port), fast_timing());
        comm.start_receiver();
        let err = comm.reset(DEFAULT_TERMINAL_ID).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Timeout);
        comm.stop_receiver();
    }

    #[test]
    fn test_campaign_success_first_try() {
        let port = ScriptPort::new();
        scripted_terminal(
            &port,
            vec![(
                b'B',
                response_frame(JobCode::PaymentApproval, approval_payload(b'1', b'2')),
            )],
        );

        let comm = Comm::with_timing(Box::new(port.clone()), fast_timing());
        comm.start_receiver();

        let cancel = AtomicBool::new(false);
        let detail = comm
            .approve_payment(DEFAULT_TERMINAL_ID, &ApprovalRequest::approval(1000), &cancel)
            .unwrap();
        assert!(!detail.is_rejected());
        assert_eq!(detail.transaction_id, "TX0000000001");
        assert_eq!(detail.transaction_medium, b'2');
        comm.stop_receiver();
    }

    #[test]
    fn test_campaign_rf_rejection_then_success() {
        let port = ScriptPort::new();
        scripted_terminal(
            &port,
            vec![
                (
                    b'B',
                    response_frame(JobCode::PaymentApproval, approval_payload(b'X', b'3')),
                ),
                (
                    b'B',
                    response_frame(JobCode::PaymentApproval, approval_payload(b'1', b'3')),
                ),
            ],
        );

        let comm = Comm::with_timing(Box::new(port.clone()), fast_timing());
        comm.start_receiver();

        let cancel = AtomicBool::new(false);
        let started = Instant::now();
        let detail = comm
            .approve_payment(DEFAULT_TERMINAL_ID, &ApprovalRequest::approval(1000), &cancel)
            .unwrap();
        assert!(!detail.is_rejected());
        // The retry waited at least the RF delay.
        assert!(started.elapsed() >= fast_timing().rf_retry_delay);

        // Two B frames were written.
        let written = port.written();
        let b_count = written
            .windows(1)
            .filter(|w| w[0] == b'B')
            .count();
        assert!(b_count >= 2, "expected at least two B bytes, got {b_count}");
        comm.stop_receiver();
    }

    #[test]
    fn test_campaign_ic_rejection_aborts() {
        let port = ScriptPort::new();
        scripted_terminal(
            &port,
            vec![(
                b'B',
                response_frame(JobCode::PaymentApproval, approval_payload(b'X', b'1')),
            )],
        );

        let comm = Comm::with_timing(Box::new(port), fast_timing());
        comm.start_receiver();

        let cancel = AtomicBool::new(false);
        let err = comm
            .approve_payment(DEFAULT_TERMINAL_ID, &ApprovalRequest::approval(1000), &cancel)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::RejectedWaitingCardRemoval);
        comm.stop_receiver();
    }

    #[test]
    fn test_campaign_inactivity_timeout_sends_payment_wait() {
        let port = ScriptPort::new();
        // Terminal ACKs the request but never answers: the campaign must
        // exhaust its budget and fire an E frame.
        port.set_responder(Box::new(|written, rx| {
            if let Ok(frame) = Frame::decode(written) {
                if frame.job_code == b'B' {
                    rx.push_back(ACK);
                }
            }
        }));

        let comm = Comm::with_timing(Box::new(port.clone()), fast_timing());
        comm.start_receiver();

        let cancel = AtomicBool::new(false);
        let err = comm
            .approve_payment(DEFAULT_TERMINAL_ID, &ApprovalRequest::approval(1000), &cancel)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::UserInactivityTimeout);

        comm.stop_receiver();
        // An E frame went out after the B.
        let written = port.written();
        assert!(written.contains(&b'E'), "expected payment-wait frame");
    }

    #[test]
    fn test_campaign_cancel_discards_response() {
        let port = ScriptPort::new();
        // Never answer; the cancel flag stops the campaign.
        let comm = Comm::with_timing(Box::new(port), fast_timing());
        comm.start_receiver();

        let cancel = AtomicBool::new(true);
        let err = comm
            .approve_payment(DEFAULT_TERMINAL_ID, &ApprovalRequest::approval(1000), &cancel)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Cancelled);
        comm.stop_receiver();
    }

    #[test]
    fn test_extended_op_busy_during_campaign() {
        let port = ScriptPort::new();
        let comm = Arc::new(Comm::with_timing(Box::new(port.clone()), fast_timing()));
        comm.start_receiver();

        let cancel = Arc::new(AtomicBool::new(false));
        let campaign_comm = Arc::clone(&comm);
        let campaign_cancel = Arc::clone(&cancel);
        let campaign = thread::spawn(move || {
            let _ = campaign_comm.approve_payment(
                DEFAULT_TERMINAL_ID,
                &ApprovalRequest::approval(1000),
                &campaign_cancel,
            );
        });

        // Let the campaign take the exchange lock.
        thread::sleep(Duration::from_millis(50));
        let err = comm.read_card_uid(DEFAULT_TERMINAL_ID).unwrap_err();
        assert_eq!(err.code(), ErrorCode::DeviceBusy);

        // No F frame may have hit the wire.
        assert!(!port.written().contains(&b'F'));

        cancel.store(true, Ordering::SeqCst);
        campaign.join().unwrap();
        comm.stop_receiver();
    }

    #[test]
    fn test_receiver_forwards_events_without_reply() {
        let port = ScriptPort::new();
        let comm = Comm::with_timing(Box::new(port.clone()), fast_timing());
        let (tx, rx) = mpsc::channel();
        comm.set_event_sink(tx);
        comm.start_receiver();

        // Unsolicited IC-card-removed notice.
        let event = Frame {
            terminal_id: crate::smartro::frame::format_terminal_id(DEFAULT_TERMINAL_ID).unwrap(),
            datetime: *b"20250301120000",
            job_code: b'@',
            response_code: b'O',
            data: Vec::new(),
        }
        .encode();
        port.feed(&event);

        let notice = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(notice.kind, crate::smartro::messages::EventKind::IcCardRemoved);

        comm.stop_receiver();
        // The device expects no reply to events.
        assert!(port.written().is_empty());
    }

    #[test]
    fn test_receiver_nacks_bad_frame() {
        let port = ScriptPort::new();
        let comm = Comm::with_timing(Box::new(port.clone()), fast_timing());
        comm.start_receiver();

        // STX followed by a frame whose BCC is wrong.
        let mut bad = response_frame(JobCode::Reset, Vec::new());
        let last = bad.len() - 1;
        bad[last] ^= 0x5a;
        port.feed(&bad);

        // Give the receiver a moment to chew on it.
        thread::sleep(Duration::from_millis(150));
        comm.stop_receiver();
        assert_eq!(port.written(), vec![NACK]);
    }

    #[test]
    fn test_probe_accepts_well_formed_answer() {
        let mut port = ScriptPort::new();
        let reply = response_frame(JobCode::DeviceCheck, b"OOOO".to_vec());
        port.set_responder(Box::new(move |written, rx| {
            if Frame::decode(written).is_ok() {
                rx.push_back(ACK);
                rx.extend(reply.iter().copied());
            }
        }));
        assert!(probe_on(&mut port));
    }

    #[test]
    fn test_probe_rejects_silence() {
        let mut port = ScriptPort::new();
        assert!(!probe_on(&mut port));
    }
}
