//! Fuzz target for the sealed envelope
//!
//! Opening arbitrary bytes must fail cleanly, and anything sealed must open.

#![no_main]

use arbitrary::Arbitrary;
use chimera_crypto::aead::{SessionKey, TunnelCipher};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Arbitrary)]
struct EnvelopeInput {
    key: [u8; 32],
    plaintext: Vec<u8>,
    envelope: Vec<u8>,
}

fuzz_target!(|input: EnvelopeInput| {
    let cipher = TunnelCipher::new(&SessionKey::new(input.key));

    let _ = cipher.open(&input.envelope);

    if let Ok(sealed) = cipher.seal(&input.plaintext) {
        assert_eq!(cipher.open(&sealed).expect("open own seal"), input.plaintext);
    }
});
