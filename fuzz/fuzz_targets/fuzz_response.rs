#![no_main]

use backup_protocol::protocol::message::WireResponse;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decoding must not panic, and neither must re-encoding what decoded
    if let Ok(resp) = WireResponse::decode(data) {
        let encoded = resp.encode();
        let _ = WireResponse::decode(&encoded);
    }
});
