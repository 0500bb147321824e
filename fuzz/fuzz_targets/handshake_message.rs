//! Fuzz target for broker handshake messages

#![no_main]

use chimera_handshake::HandshakeMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(message) = HandshakeMessage::from_bytes(data) {
        let _ = message.public_key();
        let _ = message.real_address();
    }
});
