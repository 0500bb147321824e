//! Fuzz target for frame decoding
//!
//! The decoder must never panic, and any frame it accepts that fits the
//! frame ceiling must survive an unpadded re-encode unchanged.

#![no_main]

use chimera_core::Frame;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(frame) = Frame::decode(data) {
        if let Ok(encoded) = frame.encode() {
            assert_eq!(Frame::decode(&encoded).expect("re-decode"), frame);
        }
    }
});
