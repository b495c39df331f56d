//! Fuzz target for HandshakePayload::decode
//!
//! Init and Accept payloads arrive from untrusted peers. Tests:
//! - Arbitrary lengths (short, long, exact)
//! - Inverted version ranges
//! - Arbitrary ephemeral key bytes
//!
//! The fuzzer should NEVER panic. Accepted payloads must re-encode to the
//! exact input bytes.

#![no_main]

use keyline_core::HandshakePayload;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(payload) = HandshakePayload::decode(data) {
        assert!(payload.versions.min <= payload.versions.max);
        assert_eq!(&payload.encode()[..], data);
    }
});
