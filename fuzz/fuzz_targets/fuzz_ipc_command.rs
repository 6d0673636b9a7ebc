#![no_main]

use libfuzzer_sys::fuzz_target;

use kiosk_hal::ipc::Command;

fuzz_target!(|data: &[u8]| {
    if let Ok(command) = serde_json::from_slice::<Command>(data) {
        // Every parsed command resolves to some type tag and survives
        // re-serialization.
        let _ = command.command_type();
        let body = serde_json::to_string(&command).unwrap();
        let back: Command = serde_json::from_str(&body).unwrap();
        assert_eq!(back.command_id, command.command_id);
    }
});
