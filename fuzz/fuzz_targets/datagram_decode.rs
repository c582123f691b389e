#![no_main]

use libfuzzer_sys::fuzz_target;
use teredo_relay::wire::{decode, parse_advertisement};

// Arbitrary UDP payloads through the decoder and, when they decode, the
// Router Advertisement parser.
fuzz_target!(|data: &[u8]| {
    if let Ok(dgram) = decode(data) {
        let _ = parse_advertisement(&dgram);
        let _ = dgram.is_bubble();
    }
});
