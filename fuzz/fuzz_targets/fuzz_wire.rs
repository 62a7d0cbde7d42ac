#![no_main]

use backup_protocol::core::packet::WireMessage;
use backup_protocol::protocol::message::Request;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Arbitrary frames must never panic the parser
    if let Ok(msg) = WireMessage::decode(data) {
        let _ = Request::parse(msg);
    }
});
