//! Fuzz target for the KDF ratchet
//!
//! # Strategy
//!
//! - Arbitrary chain keys and starting counters (including near u64::MAX)
//! - Random sequences of single turns and catch-up targets
//! - Targets behind the ratchet and beyond the catch-up bound
//!
//! # Invariants
//!
//! - Failed operations leave the ratchet untouched
//! - turn_until(n) yields the same key as the equivalent single turns
//! - The counter only moves forward

#![no_main]

use arbitrary::Arbitrary;
use keyline_crypto::{KdfRatchet, MAX_COUNTER_INCREMENT};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
struct RatchetScenario {
    chain_key: [u8; 32],
    start: u64,
    operations: Vec<RatchetOperation>,
}

#[derive(Debug, Clone, Arbitrary)]
enum RatchetOperation {
    Turn,
    /// Offset from the current counter, may point backwards
    TurnUntil(i16),
    /// Absolute target, usually far out of range
    TurnUntilAbsolute(u64),
}

fuzz_target!(|scenario: RatchetScenario| {
    let mut ratchet = KdfRatchet::new(scenario.start, scenario.chain_key);
    let mut shadow = KdfRatchet::new(scenario.start, scenario.chain_key);

    for operation in scenario.operations.into_iter().take(64) {
        let before_counter = ratchet.counter();
        let before_key = ratchet.current_encryption_key();

        let target = match operation {
            RatchetOperation::Turn => before_counter.checked_add(1),
            RatchetOperation::TurnUntil(offset) => {
                before_counter.checked_add_signed(i64::from(offset))
            },
            RatchetOperation::TurnUntilAbsolute(target) => Some(target),
        };
        let Some(target) = target else {
            continue;
        };

        match ratchet.turn_until(target) {
            Ok(steps) => {
                assert!(steps <= MAX_COUNTER_INCREMENT);
                assert_eq!(ratchet.counter(), target);
                for _ in 0..steps {
                    shadow.turn().expect("shadow follows a successful catch-up");
                }
                assert_eq!(shadow.counter(), ratchet.counter());
                assert_eq!(shadow.current_encryption_key(), ratchet.current_encryption_key());
            },
            Err(_) => {
                assert_eq!(ratchet.counter(), before_counter);
                assert_eq!(ratchet.current_encryption_key(), before_key);
            },
        }

        assert!(ratchet.counter() >= before_counter);
    }
});
