//! Key derivation using HKDF-SHA256
//!
//! Every derived key in keyline goes through [`derive_key`]. The secret is the
//! HKDF input keying material, a fixed personalization string is the extract
//! salt, and the caller's purpose label is the expand info. Two derivations
//! with different labels are independent even for the same secret.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Personalization used as the HKDF extract salt for all derivations.
pub const KDF_PERSONAL: &[u8] = b"keyline-e2e";

/// Size of every derived key (32 bytes).
pub const KEY_SIZE: usize = 32;

/// Derive a 32-byte key from `secret` for the purpose named by `salt`.
///
/// # Security
///
/// - Different salts produce independent keys (key separation)
/// - Deterministic: same inputs always produce same output
pub fn derive_key(secret: &[u8], salt: &[u8]) -> [u8; KEY_SIZE] {
    let hkdf = Hkdf::<Sha256>::new(Some(KDF_PERSONAL), secret);

    let mut key = [0u8; KEY_SIZE];
    let Ok(()) = hkdf.expand(salt, &mut key) else {
        unreachable!("32 bytes is a valid HKDF-SHA256 output length");
    };

    key
}

/// Derive a key from the concatenation of several secrets.
///
/// Used for the DH root keys, where the input is `SS || SE` (2-DH) or
/// `SS || SE || ES || EE` (4-DH). The concatenation buffer is zeroized
/// before returning.
pub fn derive_key_from_parts(parts: &[&[u8]], salt: &[u8]) -> [u8; KEY_SIZE] {
    let capacity = parts.iter().map(|part| part.len()).sum();
    let mut combined = Zeroizing::new(Vec::with_capacity(capacity));
    for part in parts {
        combined.extend_from_slice(part);
    }

    derive_key(&combined, salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derive_matches_vector() {
        let key = derive_key(&[0u8; 32], b"ke-2dh-ALICE001");
        assert_eq!(
            hex::encode(key),
            "ae655dd97dfccea68259c2c9f61fe2daf3587ed28811bda429e168c8760b58b8"
        );
    }

    #[test]
    fn derive_is_deterministic() {
        let secret = b"test_secret_material_for_kdf!!!!";
        assert_eq!(derive_key(secret, b"salt"), derive_key(secret, b"salt"));
    }

    #[test]
    fn different_salts_produce_different_keys() {
        let secret = b"test_secret_material_for_kdf!!!!";
        assert_ne!(derive_key(secret, b"kdf-ck"), derive_key(secret, b"kdf-aek"));
    }

    #[test]
    fn different_secrets_produce_different_keys() {
        assert_ne!(derive_key(&[1u8; 32], b"salt"), derive_key(&[2u8; 32], b"salt"));
    }

    #[test]
    fn parts_equal_concatenation() {
        let a = [0x11u8; 32];
        let b = [0x22u8; 32];
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);

        assert_eq!(derive_key_from_parts(&[&a, &b], b"salt"), derive_key(&joined, b"salt"));
    }

    #[test]
    fn works_with_empty_secret() {
        let key = derive_key(&[], b"salt");
        assert_eq!(key.len(), KEY_SIZE);
    }
}
