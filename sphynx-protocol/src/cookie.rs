//! Stateless reachability proof for the HELLO/COOKIE/CHALLENGE round trip.
//!
//! No per-client storage: the cookie is a deterministic function of the
//! source address, a rotating process-wide secret, and a coarse epoch. An
//! attacker spoofing the source address cannot complete the handshake
//! without actually receiving the cookie at that address.

use sphynx_crypto::hash::kdf;
use sphynx_crypto::random::SecureRandom;

use crate::constants::{COOKIE_BYTES, COOKIE_EPOCH_MS};

pub struct CookieJar {
    secret: [u8; 32],
    previous_secret: [u8; 32],
    secret_epoch: i64,
}

impl CookieJar {
    pub fn new(rng: &mut SecureRandom) -> Self {
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        Self { secret, previous_secret: secret, secret_epoch: 0 }
    }

    /// Rotates the secret if a new coarse epoch has begun. Call this from
    /// the worker tick; `now_ms` is the caller's monotonic clock.
    pub fn maybe_rotate(&mut self, now_ms: i64, rng: &mut SecureRandom) {
        let epoch = now_ms / COOKIE_EPOCH_MS;
        if epoch != self.secret_epoch {
            self.previous_secret = self.secret;
            rng.fill_bytes(&mut self.secret);
            self.secret_epoch = epoch;
        }
    }

    pub fn issue(&self, addr_bytes: &[u8]) -> [u8; COOKIE_BYTES] {
        Self::derive(&self.secret, addr_bytes)
    }

    /// Accepts cookies minted under the current or immediately previous
    /// secret, so a cookie issued just before a rotation still verifies.
    pub fn verify(&self, addr_bytes: &[u8], cookie: &[u8; COOKIE_BYTES]) -> bool {
        &Self::derive(&self.secret, addr_bytes) == cookie
            || &Self::derive(&self.previous_secret, addr_bytes) == cookie
    }

    fn derive(secret: &[u8; 32], addr_bytes: &[u8]) -> [u8; COOKIE_BYTES] {
        let digest = kdf(secret, b"sphynx-cookie", addr_bytes, COOKIE_BYTES);
        let mut out = [0u8; COOKIE_BYTES];
        out.copy_from_slice(&digest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_cookie_verifies_for_same_address() {
        let mut rng = SecureRandom::new();
        let jar = CookieJar::new(&mut rng);
        let addr = b"1.2.3.4:5555";
        let cookie = jar.issue(addr);
        assert!(jar.verify(addr, &cookie));
    }

    #[test]
    fn cookie_does_not_verify_for_different_address() {
        let mut rng = SecureRandom::new();
        let jar = CookieJar::new(&mut rng);
        let cookie = jar.issue(b"1.2.3.4:5555");
        assert!(!jar.verify(b"6.6.6.6:5555", &cookie));
    }

    #[test]
    fn rotation_still_accepts_previous_epoch_cookie() {
        let mut rng = SecureRandom::new();
        let mut jar = CookieJar::new(&mut rng);
        let addr = b"1.2.3.4:5555";
        let cookie = jar.issue(addr);
        jar.maybe_rotate(COOKIE_EPOCH_MS + 1, &mut rng);
        assert!(jar.verify(addr, &cookie));
        jar.maybe_rotate(COOKIE_EPOCH_MS * 2 + 1, &mut rng);
        assert!(!jar.verify(addr, &cookie));
    }
}
