#![no_main]

use libfuzzer_sys::fuzz_target;

use kiosk_hal::smartro::frame::{Frame, MIN_FRAME_SIZE};

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        // Anything that decodes re-encodes to the identical bytes.
        assert!(data.len() >= MIN_FRAME_SIZE);
        assert_eq!(frame.encode(), data);
    }
});
