use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::device::{DeviceManager, DeviceState, DeviceType};
use crate::error::{Error, Result};
use crate::ipc::message::{Command, Event, IpcErrorCode, Response};
use crate::ipc::router::Router;
use crate::ipc::transport::{FrameRead, Listener, MessageReader, MessageWriter};

/// Poll granularity of the accept loop; the stop flag is observed at this
/// rate.
const ACCEPT_TICK: Duration = Duration::from_secs(1);
/// Read timeout on the client stream.
const CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// IPC server: listens on the well-known local channel, serves one client
/// at a time, dispatches framed commands through the router and pushes
/// events to the connected client.
///
/// Events emitted while no client is attached are dropped; each connect
/// triggers a fresh system status check so the client starts from a
/// coherent snapshot.
pub struct IpcServer {
    name: String,
    router: Arc<Router>,
    devices: Arc<DeviceManager>,
    writer: Arc<Mutex<Option<Arc<MessageWriter>>>>,
    running: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl IpcServer {
    pub fn new(name: &str, router: Arc<Router>, devices: Arc<DeviceManager>) -> Arc<Self> {
        let server = Arc::new(Self {
            name: name.to_string(),
            router,
            devices,
            writer: Arc::new(Mutex::new(None)),
            running: Arc::new(AtomicBool::new(false)),
            accept_thread: Mutex::new(None),
        });

        // Events produced anywhere in the daemon funnel through the
        // currently connected client, if any.
        let writer = Arc::clone(&server.writer);
        server.router.set_event_sink(Arc::new(move |event| {
            send_event(&writer, &event);
        }));

        server
    }

    /// Bind the channel and start accepting. Fails when the endpoint cannot
    /// be bound (another daemon instance is usually the cause).
    pub fn start(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = Listener::bind(&self.name).map_err(|err| {
            self.running.store(false, Ordering::SeqCst);
            err
        })?;

        let server = Arc::clone(&self);
        let handle = thread::Builder::new()
            .name("ipc-accept".to_string())
            .spawn(move || server.accept_loop(listener))
            .map_err(|e| Error::ipc(format!("failed to spawn accept thread: {e}")))?;
        *self.accept_thread.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stop the listener and drop the connected client.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(writer) = self.writer.lock().unwrap().take() {
            writer.shutdown();
        }
        if let Some(handle) = self.accept_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
        log::info!("[IPC] server stopped");
    }

    /// Push one event to the connected client. No retry, no queueing: a
    /// missing or broken client just loses the event.
    pub fn broadcast_event(&self, event: &Event) {
        send_event(&self.writer, event);
    }

    fn accept_loop(self: Arc<Self>, listener: Listener) {
        log::info!("[IPC] accept loop running");
        while self.running.load(Ordering::SeqCst) {
            let stream = match listener.accept_timeout(ACCEPT_TICK) {
                Ok(Some(stream)) => stream,
                Ok(None) => continue,
                Err(err) => {
                    log::error!("[IPC] accept failed: {err}");
                    thread::sleep(ACCEPT_TICK);
                    continue;
                }
            };

            let reader = match stream.try_clone().map_err(Error::from).and_then(|clone| {
                MessageReader::new(clone, CLIENT_READ_TIMEOUT)
            }) {
                Ok(reader) => reader,
                Err(err) => {
                    log::error!("[IPC] client setup failed: {err}");
                    continue;
                }
            };
            let writer = Arc::new(MessageWriter::new(stream));
            *self.writer.lock().unwrap() = Some(Arc::clone(&writer));
            log::info!("[IPC] client connected");
            self.on_client_connected();

            // One client at a time: serve it on its own thread and re-arm
            // accept only after it is gone.
            let server = Arc::clone(&self);
            let client = thread::Builder::new()
                .name("ipc-client".to_string())
                .spawn(move || server.client_loop(reader, writer))
                .expect("failed to spawn client thread");
            let _ = client.join();

            *self.writer.lock().unwrap() = None;
            self.on_client_disconnected();
            log::info!("[IPC] client disconnected");
        }
        log::info!("[IPC] accept loop exiting");
    }

    fn client_loop(&self, mut reader: MessageReader, writer: Arc<MessageWriter>) {
        while self.running.load(Ordering::SeqCst) {
            match reader.recv() {
                Ok(FrameRead::Timeout) => continue,
                Ok(FrameRead::Closed) => break,
                Err(err) => {
                    // Protocol violation (oversize frame, torn stream):
                    // the connection is closed.
                    log::warn!("[IPC] dropping client: {err}");
                    break;
                }
                Ok(FrameRead::Message(bytes)) => {
                    let response = match serde_json::from_slice::<Command>(&bytes) {
                        Ok(command) => self.router.handle(&command),
                        Err(err) => {
                            log::warn!("[IPC] unparseable command: {err}");
                            Response::failed(
                                "",
                                IpcErrorCode::ParseError,
                                &format!("could not decode command: {err}"),
                            )
                        }
                    };
                    match serde_json::to_string(&response) {
                        Ok(body) => {
                            if let Err(err) = writer.send(&body) {
                                log::warn!("[IPC] response write failed: {err}");
                                break;
                            }
                        }
                        Err(err) => log::error!("[IPC] response serialization failed: {err}"),
                    }
                }
            }
        }
    }

    /// Connect hook: run the system status check without blocking command
    /// processing.
    fn on_client_connected(&self) {
        let router = Arc::clone(&self.router);
        let _ = thread::Builder::new()
            .name("status-check".to_string())
            .spawn(move || router.perform_system_status_check());
    }

    /// Disconnect hook: best-effort cancel of in-flight campaigns, and the
    /// idempotency cache dies with the connection.
    fn on_client_disconnected(&self) {
        for device_id in self.devices.device_ids(DeviceType::Payment) {
            if let Some(terminal) = self.devices.payment_terminal(&device_id) {
                if terminal.state() == DeviceState::Processing {
                    log::warn!("[IPC] client left mid-payment; cancelling {device_id}");
                    let _ = terminal.cancel_payment();
                }
            }
        }
        self.router.clear_cache();
    }
}

impl Drop for IpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn send_event(writer: &Mutex<Option<Arc<MessageWriter>>>, event: &Event) {
    let writer = writer.lock().unwrap().clone();
    let Some(writer) = writer else {
        log::debug!("[IPC] dropping {} event, no client", event.event_type);
        return;
    };
    match serde_json::to_string(event) {
        Ok(body) => {
            if let Err(err) = writer.send(&body) {
                log::warn!("[IPC] event write failed: {err}");
            }
        }
        Err(err) => log::error!("[IPC] event serialization failed: {err}"),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::device::TerminalFactory;
    use crate::ipc::message::{CommandType, EventType, ResponseStatus};
    use crate::ipc::transport::{read_frame, write_frame, Listener as TransportListener};
    use crate::ipc::WorkerQueue;
    use std::collections::BTreeMap;
    use std::io::Write as _;

    fn unique_name(tag: &str) -> String {
        format!("kiosk-hal-test-{tag}-{}", std::process::id())
    }

    fn server_fixture(name: &str) -> (Arc<IpcServer>, Arc<DeviceManager>) {
        let devices = Arc::new(DeviceManager::new());
        let router = Arc::new(Router::new(
            Arc::clone(&devices),
            Arc::new(Mutex::new(Config::default())),
            Arc::new(TerminalFactory::new()),
            Arc::new(WorkerQueue::new()),
        ));
        let server = IpcServer::new(name, router, Arc::clone(&devices));
        Arc::clone(&server).start().unwrap();
        (server, devices)
    }

    fn connect(name: &str) -> crate::ipc::transport::RawStream {
        for _ in 0..50 {
            if let Ok(stream) = TransportListener::connect(name) {
                stream
                    .set_read_timeout(Some(Duration::from_millis(200)))
                    .unwrap();
                return stream;
            }
            thread::sleep(Duration::from_millis(20));
        }
        panic!("could not connect to {name}");
    }

    fn send_command(stream: &mut crate::ipc::transport::RawStream, command: &Command) {
        let body = serde_json::to_string(command).unwrap();
        write_frame(stream, body.as_bytes()).unwrap();
    }

    /// Read messages until one matching `predicate` arrives.
    fn wait_for<T: serde::de::DeserializeOwned>(
        stream: &mut crate::ipc::transport::RawStream,
        predicate: impl Fn(&T) -> bool,
    ) -> T {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            match read_frame(stream) {
                Ok(FrameRead::Message(bytes)) => {
                    if let Ok(value) = serde_json::from_slice::<T>(&bytes) {
                        if predicate(&value) {
                            return value;
                        }
                    }
                }
                Ok(FrameRead::Timeout) => continue,
                Ok(FrameRead::Closed) => panic!("server closed the connection"),
                Err(err) => panic!("read failed: {err}"),
            }
        }
        panic!("expected message never arrived");
    }

    #[test]
    fn test_command_response_roundtrip() {
        let name = unique_name("roundtrip");
        let (server, _devices) = server_fixture(&name);
        let mut stream = connect(&name);

        let command = Command::new("c-1", CommandType::GetDeviceList);
        send_command(&mut stream, &command);

        let response: Response = wait_for(&mut stream, |r: &Response| r.kind == "response");
        assert_eq!(response.command_id, "c-1");
        assert_eq!(response.status, ResponseStatus::Ok);
        assert_eq!(response.result.unwrap()["deviceCount"], "0");

        server.stop();
    }

    #[test]
    fn test_unknown_command_rejected_end_to_end() {
        let name = unique_name("unknown");
        let (server, _devices) = server_fixture(&name);
        let mut stream = connect(&name);

        // Literal scenario: only correlation fields present.
        let body = r#"{"type":"nuke_kiosk","commandId":"abc","timestampMs":0,"payload":{}}"#;
        write_frame(&mut stream, body.as_bytes()).unwrap();

        let response: Response = wait_for(&mut stream, |r: &Response| r.kind == "response");
        assert_eq!(response.command_id, "abc");
        assert_eq!(response.status, ResponseStatus::Rejected);
        assert_eq!(response.error_code.as_deref(), Some("UNKNOWN_COMMAND"));

        server.stop();
    }

    #[test]
    fn test_garbage_json_yields_parse_error() {
        let name = unique_name("garbage");
        let (server, _devices) = server_fixture(&name);
        let mut stream = connect(&name);

        write_frame(&mut stream, b"this is not json").unwrap();
        let response: Response = wait_for(&mut stream, |r: &Response| r.kind == "response");
        assert_eq!(response.status, ResponseStatus::Failed);
        assert_eq!(response.error_code.as_deref(), Some("PARSE_ERROR"));

        server.stop();
    }

    #[test]
    fn test_connect_triggers_status_check_event() {
        let name = unique_name("statuscheck");
        let (server, _devices) = server_fixture(&name);
        let mut stream = connect(&name);

        let event: Event = wait_for(&mut stream, |e: &Event| e.kind == "event");
        assert_eq!(event.event_type, EventType::SystemStatusCheck);
        assert_eq!(event.data["allHealthy"], "true");

        server.stop();
    }

    #[test]
    fn test_oversize_frame_closes_connection() {
        let name = unique_name("oversize");
        let (server, _devices) = server_fixture(&name);
        let mut stream = connect(&name);

        // Announce more than the cap; the server must drop us.
        let huge = ((crate::ipc::MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes();
        stream.write_all(&huge).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut closed = false;
        while std::time::Instant::now() < deadline {
            match read_frame(&mut stream) {
                Ok(FrameRead::Closed) => {
                    closed = true;
                    break;
                }
                Ok(_) => continue,
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }
        assert!(closed, "server kept the connection after a protocol violation");

        server.stop();
    }

    #[test]
    fn test_broadcast_reaches_client() {
        let name = unique_name("broadcast");
        let (server, _devices) = server_fixture(&name);
        let mut stream = connect(&name);

        // Wait until the connection is fully up (status check arrives).
        let _: Event = wait_for(&mut stream, |e: &Event| e.kind == "event");

        let mut data = BTreeMap::new();
        data.insert("amount".to_string(), "1000".to_string());
        server.broadcast_event(&Event::new(EventType::PaymentComplete, "payment", data));

        let event: Event =
            wait_for(&mut stream, |e: &Event| e.event_type == EventType::PaymentComplete);
        assert_eq!(event.data["amount"], "1000");

        server.stop();
    }

    #[test]
    fn test_second_client_after_disconnect() {
        let name = unique_name("reconnect");
        let (server, _devices) = server_fixture(&name);

        {
            let mut first = connect(&name);
            send_command(&mut first, &Command::new("a-1", CommandType::GetDeviceList));
            let _: Response = wait_for(&mut first, |r: &Response| r.kind == "response");
        } // dropped: disconnect

        let mut second = connect(&name);
        send_command(&mut second, &Command::new("a-2", CommandType::GetDeviceList));
        let response: Response = wait_for(&mut second, |r: &Response| r.kind == "response");
        assert_eq!(response.command_id, "a-2");

        server.stop();
    }
}
