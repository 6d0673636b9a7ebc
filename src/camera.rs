//! Camera adapter surface.
//!
//! The EDSDK integration itself lives behind this contract; the core only
//! routes commands to it and forwards its events. The state machine every
//! implementation follows is `Disconnected → Connecting → Ready →
//! Processing → Ready`, with a 30 s stall in `Processing` self-recovering to
//! `Ready`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::device::{DeviceInfo, DeviceState};
use crate::error::Result;

/// Budget after which a capture stuck in `Processing` is abandoned and the
/// adapter recovers to `Ready`.
pub const CAPTURE_STALL_TIMEOUT_MS: u64 = 30_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CameraEventKind {
    CaptureComplete,
    CaptureFailed,
    StateChanged,
}

impl From<CameraEventKind> for &'static str {
    fn from(k: CameraEventKind) -> Self {
        match k {
            CameraEventKind::CaptureComplete => "capture_complete",
            CameraEventKind::CaptureFailed => "capture_failed",
            CameraEventKind::StateChanged => "state_changed",
        }
    }
}

impl fmt::Display for CameraEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", <&'static str>::from(*self))
    }
}

/// Event emitted by a camera adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct CameraEvent {
    pub kind: CameraEventKind,
    pub state: DeviceState,
    /// Capture correlation id supplied by the client.
    pub capture_id: String,
    /// Filesystem path of the captured image; images never travel through
    /// the command channel.
    pub image_path: String,
    pub error_code: String,
    pub error_message: String,
}

pub type CameraEventCallback = Arc<dyn Fn(&CameraEvent) + Send + Sync>;

/// Contract for camera adapters.
pub trait Camera: Send + Sync {
    fn device_info(&self) -> DeviceInfo;

    fn state(&self) -> DeviceState;

    /// Start a capture; the result arrives as a [`CameraEvent`] carrying the
    /// image path.
    fn capture(&self, capture_id: &str) -> Result<()>;

    /// Spawn the local MJPEG preview endpoint; returns its URL.
    fn start_preview(&self) -> Result<String>;

    fn stop_preview(&self) -> Result<()>;

    /// Apply vendor settings (ISO, aperture, white balance, ...).
    fn set_settings(&self, settings: &BTreeMap<String, String>) -> Result<()>;

    /// Open or close the vendor session.
    fn set_session(&self, open: bool) -> Result<()>;

    /// Tear down and re-establish the vendor connection.
    fn reconnect(&self) -> Result<()>;

    fn set_event_callback(&self, callback: CameraEventCallback);
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Scripted camera for router and manager tests.
    pub struct MockCamera {
        pub info: Mutex<DeviceInfo>,
        pub callback: Mutex<Option<CameraEventCallback>>,
    }

    impl MockCamera {
        pub fn ready(device_id: &str) -> Self {
            let mut info =
                DeviceInfo::new(device_id, crate::device::DeviceType::Camera, "Mock Camera");
            info.state = DeviceState::Ready;
            Self {
                info: Mutex::new(info),
                callback: Mutex::new(None),
            }
        }
    }

    impl Camera for MockCamera {
        fn device_info(&self) -> DeviceInfo {
            self.info.lock().unwrap().clone()
        }

        fn state(&self) -> DeviceState {
            self.info.lock().unwrap().state
        }

        fn capture(&self, capture_id: &str) -> Result<()> {
            let callback = self.callback.lock().unwrap().clone();
            if let Some(callback) = callback {
                callback(&CameraEvent {
                    kind: CameraEventKind::CaptureComplete,
                    state: DeviceState::Ready,
                    capture_id: capture_id.to_string(),
                    image_path: format!("/tmp/{capture_id}.jpg"),
                    error_code: String::new(),
                    error_message: String::new(),
                });
            }
            Ok(())
        }

        fn start_preview(&self) -> Result<String> {
            Ok("http://127.0.0.1:18080/preview".to_string())
        }

        fn stop_preview(&self) -> Result<()> {
            Ok(())
        }

        fn set_settings(&self, _settings: &BTreeMap<String, String>) -> Result<()> {
            Ok(())
        }

        fn set_session(&self, _open: bool) -> Result<()> {
            Ok(())
        }

        fn reconnect(&self) -> Result<()> {
            Ok(())
        }

        fn set_event_callback(&self, callback: CameraEventCallback) {
            *self.callback.lock().unwrap() = Some(callback);
        }
    }
}
