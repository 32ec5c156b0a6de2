//! 512-bit hash and keyed-KDF primitives.
//!
//! Substitutes `sha2::Sha512` + `hmac` for the specification's named
//! Skein-512 family, the same substitution the teacher's own session-setup
//! code already makes for its KBKDF core.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha512};

type HmacSha512 = Hmac<Sha512>;

/// Unkeyed hash of the handshake transcript, used as the MQV combiner input
/// `H(A‖B‖Y‖r)`.
pub fn hash512(parts: &[&[u8]]) -> [u8; 64] {
    let mut hasher = Sha512::new();
    for p in parts {
        hasher.update(p);
    }
    hasher.finalize().into()
}

/// Keyed derivation: `HMAC-SHA512(key, label ‖ context)`, truncated to
/// `out_len` bytes. Used to derive the four per-direction sub-keys from the
/// MQV shared secret.
pub fn kdf(key: &[u8], label: &[u8], context: &[u8], out_len: usize) -> Vec<u8> {
    let mut mac = HmacSha512::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(label);
    mac.update(context);
    let full = mac.finalize().into_bytes();
    full[..out_len.min(full.len())].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kdf_is_deterministic_and_label_separated() {
        let key = [7u8; 32];
        let a = kdf(&key, b"c2s-mac", b"ctx", 32);
        let b = kdf(&key, b"s2c-mac", b"ctx", 32);
        assert_eq!(a, kdf(&key, b"c2s-mac", b"ctx", 32));
        assert_ne!(a, b);
    }
}
