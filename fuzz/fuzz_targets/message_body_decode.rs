//! Fuzz target for MessageBody::decode
//!
//! Decrypted plaintext is still attacker-controlled: a peer can encrypt any
//! bytes it likes. Tests every type byte against arbitrary bodies:
//! - Truncated and oversized control messages
//! - Non-UTF-8 text and location strings
//! - Out-of-range coordinates and receipt types
//!
//! The fuzzer should NEVER panic. Accepted bodies must survive a re-encode.

#![no_main]

use keyline_core::MessageBody;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&type_byte, body)) = data.split_first() else {
        return;
    };

    if let Ok(decoded) = MessageBody::decode(type_byte, body) {
        assert_eq!(decoded.type_byte(), type_byte);

        let mut encoded = Vec::new();
        decoded.encode(&mut encoded);
        let again = MessageBody::decode(type_byte, &encoded);
        assert_eq!(again.as_ref(), Ok(&decoded));
    }
});
