//! Fuzz test for handshake configuration parsing
//!
//! Arbitrary TOML must never panic the deserializer or the validator.

#![no_main]

use chimera_handshake::HandshakeConfig;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(s) = std::str::from_utf8(data) {
        if let Ok(config) = toml::from_str::<HandshakeConfig>(s) {
            let _ = config.validate();
            let _ = config.reply_timeout();
            let _ = config.listen_timeout();
        }
    }
});
