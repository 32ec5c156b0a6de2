//! CSPRNG used for cookies, salts, ephemeral handshake scalars, and
//! MTU-probe padding.
//!
//! Substitutes `rand_chacha`'s `ChaCha20Rng`, seeded from the OS CSPRNG, for
//! the specification's named Fortuna generator — the same "wrap the OS
//! CSPRNG" shape the teacher's own random module uses.

use rand::RngCore;
use rand_chacha::rand_core::SeedableRng;
use rand_chacha::ChaCha20Rng;

/// A thread-local-free, explicitly owned CSPRNG handle. Each worker owns one
/// instance; it is never shared across threads.
pub struct SecureRandom(ChaCha20Rng);

impl SecureRandom {
    pub fn new() -> Self {
        Self(ChaCha20Rng::from_entropy())
    }

    pub fn fill_bytes(&mut self, buf: &mut [u8]) {
        self.0.fill_bytes(buf);
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    pub fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }
}

impl Default for SecureRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl RngCore for SecureRandom {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0.fill_bytes(dest)
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0.try_fill_bytes(dest)
    }
}
