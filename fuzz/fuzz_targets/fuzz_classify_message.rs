//! Fuzz target: inbound monitor-message classification.
//!
//! Feeds arbitrary bytes through the JSON decoder and the structural
//! classifier, then through each typed parser. None of them may panic,
//! whatever the peer sends.
#![no_main]

use caravel_host::protocol::{
    Greeting, MessageKind, MonitorEvent, MonitorResponse,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };

    match MessageKind::classify(&value) {
        MessageKind::Greeting => {
            let _ = Greeting::from_value(value);
        }
        MessageKind::Event => {
            let _ = MonitorEvent::from_value(value);
        }
        MessageKind::Response => {
            let _ = MonitorResponse::from_value(value);
        }
        MessageKind::Unknown => {}
    }
});
