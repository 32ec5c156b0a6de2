//! Per-packet message authentication code.
//!
//! HMAC-MD5, truncated to 64 bits, exactly as the original's
//! `AuthenticatedEncryption` class uses it. This is a literal match, not a
//! substitution: both the primitive and its truncation width are named
//! directly by the specification.

use hmac::{Hmac, Mac};
use md5::Md5;
use subtle::ConstantTimeEq;

type HmacMd5 = Hmac<Md5>;

pub const MAC_BYTES: usize = 8;

/// Computes the truncated MAC over `iv ‖ message`.
pub fn compute(mac_key: &[u8], iv: u64, message: &[u8]) -> [u8; MAC_BYTES] {
    let mut mac = HmacMd5::new_from_slice(mac_key).expect("hmac accepts any key length");
    mac.update(&iv.to_le_bytes());
    mac.update(message);
    let full = mac.finalize().into_bytes();
    let mut out = [0u8; MAC_BYTES];
    out.copy_from_slice(&full[..MAC_BYTES]);
    out
}

/// Constant-time verification against `expected`.
pub fn verify(mac_key: &[u8], iv: u64, message: &[u8], expected: &[u8; MAC_BYTES]) -> bool {
    let computed = compute(mac_key, iv, message);
    computed.ct_eq(expected).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_rejects_tampered_message() {
        let key = [1u8; 16];
        let tag = compute(&key, 42, b"hello");
        assert!(verify(&key, 42, b"hello", &tag));
        assert!(!verify(&key, 42, b"hellp", &tag));
        assert!(!verify(&key, 43, b"hello", &tag));
    }
}
