//! Calico-style authenticated encryption: per-direction keys, a monotonic
//! 64-bit IV, and a 1024-bit sliding anti-replay window.
//!
//! Wire layout of one encrypted datagram body: `encrypted { message ‖
//! mac(8) } ‖ obfuscated_iv(3)`, grounded on
//! `original_source/include/cat/crypt/tunnel/AuthenticatedEncryption.hpp`'s
//! header comment and `TunnelSession.cpp`'s `Encrypt`/`Decrypt`: the MAC is
//! computed over `iv ‖ plaintext`, then the plaintext and MAC are encrypted
//! together, and only the truncated IV trailer is left in clear. The
//! obfuscation mix for that trailer is the leading 4 bytes of the
//! *already-encrypted* MAC field (not the plaintext tag) — that's what lets
//! the receiver de-obfuscate the IV straight off the wire before decrypting
//! anything, and it's also why authenticity can only be checked after
//! decryption here rather than before, matching the original exactly rather
//! than reordering it. See `DESIGN.md`.

use sphynx_crypto::cipher;
use sphynx_crypto::mac::{self, MAC_BYTES};
use sphynx_crypto::secret::Secret;
use subtle::ConstantTimeEq;

use crate::error::Error;

const IV_TRAILER_BYTES: usize = 3;
const IV_FUZZ: u32 = 0xCA7D_CA7D;
const REPLAY_WINDOW_BITS: usize = 1024;
const REPLAY_WINDOW_WORDS: usize = REPLAY_WINDOW_BITS / 64;

pub const OVERHEAD_BYTES: usize = MAC_BYTES + IV_TRAILER_BYTES;

struct SendDirection {
    mac_key: Secret<16>,
    cipher_key: Secret<32>,
    next_iv: u64,
}

struct ReceiveDirection {
    mac_key: Secret<16>,
    cipher_key: Secret<32>,
    high_water: u64,
    seen_any: bool,
    window: [u64; REPLAY_WINDOW_WORDS],
}

/// One direction's live encryption/decryption state. A `Connexion` holds two
/// of these, one per direction, built from the session keys the handshake
/// produced.
pub struct AuthenticatedEncryption {
    send: SendDirection,
    recv: ReceiveDirection,
}

impl AuthenticatedEncryption {
    pub fn new(local_mac: Secret<16>, local_enc: Secret<32>, remote_mac: Secret<16>, remote_enc: Secret<32>, is_initiator: bool) -> Self {
        Self {
            send: SendDirection { mac_key: local_mac, cipher_key: local_enc, next_iv: if is_initiator { 0 } else { 1 } },
            recv: ReceiveDirection {
                mac_key: remote_mac,
                cipher_key: remote_enc,
                high_water: 0,
                seen_any: false,
                window: [0u64; REPLAY_WINDOW_WORDS],
            },
        }
    }

    /// Encrypts `plaintext`, returning the full on-wire body: the encrypted
    /// `message ‖ mac` followed by the obfuscated IV trailer. Returns `Err`
    /// if the IV counter has exhausted its 64-bit range.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        let iv = self.send.next_iv;
        self.send.next_iv = self.send.next_iv.checked_add(1).ok_or(Error::ReplayedIv)?;

        let tag = mac::compute(self.send.mac_key.as_bytes(), iv, plaintext);

        let mut combined = Vec::with_capacity(plaintext.len() + MAC_BYTES);
        combined.extend_from_slice(plaintext);
        combined.extend_from_slice(&tag);
        cipher::apply_keystream(self.send.cipher_key.as_bytes(), iv, &mut combined);

        let mac_ct_start = combined.len() - MAC_BYTES;
        let mix: [u8; 4] = combined[mac_ct_start..mac_ct_start + 4].try_into().unwrap();
        let trailer = obfuscate_iv(iv, &mix);

        let mut out = Vec::with_capacity(combined.len() + IV_TRAILER_BYTES);
        out.extend_from_slice(&combined);
        out.extend_from_slice(&trailer);
        Ok(out)
    }

    /// Verifies and decrypts one received body. On any failure the buffer is
    /// rejected with no side effect on the replay window; per the
    /// specification this must never surface a distinguishable error to the
    /// remote peer.
    pub fn decrypt(&mut self, buffer: &[u8]) -> Result<Vec<u8>, Error> {
        if buffer.len() < OVERHEAD_BYTES {
            return Err(Error::DecryptFailed);
        }
        let trailer_start = buffer.len() - IV_TRAILER_BYTES;
        let mac_ct_start = trailer_start - MAC_BYTES;

        let trailer: [u8; IV_TRAILER_BYTES] = buffer[trailer_start..].try_into().unwrap();
        let mix: [u8; 4] = buffer[mac_ct_start..mac_ct_start + 4].try_into().unwrap();

        let low24 = deobfuscate_iv(trailer, &mix);
        let iv = reconstruct_iv(self.recv.high_water, self.recv.seen_any, low24);

        if !self.recv.is_new(iv) {
            return Err(Error::ReplayedIv);
        }

        let mut combined = buffer[..trailer_start].to_vec();
        cipher::apply_keystream(self.recv.cipher_key.as_bytes(), iv, &mut combined);

        let msg_len = combined.len() - MAC_BYTES;
        let tag: [u8; MAC_BYTES] = combined[msg_len..].try_into().unwrap();
        let plaintext = combined[..msg_len].to_vec();

        let expected_tag = mac::compute(self.recv.mac_key.as_bytes(), iv, &plaintext);
        if !bool::from(expected_tag.ct_eq(&tag)) {
            return Err(Error::DecryptFailed);
        }

        self.recv.accept(iv);
        Ok(plaintext)
    }
}

impl ReceiveDirection {
    fn is_new(&self, iv: u64) -> bool {
        if !self.seen_any {
            return true;
        }
        if iv > self.high_water {
            return true;
        }
        let age = self.high_water - iv;
        if age as usize >= REPLAY_WINDOW_BITS {
            return false;
        }
        !get_bit(&self.window, age as usize)
    }

    fn accept(&mut self, iv: u64) {
        if !self.seen_any {
            self.seen_any = true;
            self.high_water = iv;
            set_bit(&mut self.window, 0);
            return;
        }
        if iv > self.high_water {
            let shift = iv - self.high_water;
            shift_window(&mut self.window, shift);
            self.high_water = iv;
            set_bit(&mut self.window, 0);
        } else {
            let age = (self.high_water - iv) as usize;
            set_bit(&mut self.window, age);
        }
    }
}

fn get_bit(window: &[u64; REPLAY_WINDOW_WORDS], pos: usize) -> bool {
    if pos >= REPLAY_WINDOW_BITS {
        return false;
    }
    (window[pos / 64] >> (pos % 64)) & 1 != 0
}

fn set_bit(window: &mut [u64; REPLAY_WINDOW_WORDS], pos: usize) {
    if pos >= REPLAY_WINDOW_BITS {
        return;
    }
    window[pos / 64] |= 1 << (pos % 64);
}

fn shift_window(window: &mut [u64; REPLAY_WINDOW_WORDS], shift: u64) {
    if shift as usize >= REPLAY_WINDOW_BITS {
        *window = [0u64; REPLAY_WINDOW_WORDS];
        return;
    }
    let shift = shift as usize;
    for pos in (0..REPLAY_WINDOW_BITS).rev() {
        let new_pos = pos + shift;
        if new_pos < REPLAY_WINDOW_BITS {
            let bit = get_bit(window, pos);
            if bit {
                set_bit(window, new_pos);
            } else {
                clear_bit(window, new_pos);
            }
        }
    }
    for pos in 0..shift.min(REPLAY_WINDOW_BITS) {
        clear_bit(window, pos);
    }
}

fn clear_bit(window: &mut [u64; REPLAY_WINDOW_WORDS], pos: usize) {
    if pos >= REPLAY_WINDOW_BITS {
        return;
    }
    window[pos / 64] &= !(1 << (pos % 64));
}

/// `mix` is the leading 4 bytes of the already-encrypted MAC field, used as
/// the original's `*(u32*)overhead` obfuscation source.
fn obfuscate_iv(iv: u64, mix: &[u8; 4]) -> [u8; IV_TRAILER_BYTES] {
    let low24 = (iv & 0xFF_FFFF) as u32;
    let mix = u32::from_le_bytes(*mix);
    let obf = (low24 ^ mix ^ (IV_FUZZ & 0xFF_FFFF)) & 0xFF_FFFF;
    let bytes = obf.to_le_bytes();
    [bytes[0], bytes[1], bytes[2]]
}

fn deobfuscate_iv(trailer: [u8; IV_TRAILER_BYTES], mix: &[u8; 4]) -> u32 {
    let obf = u32::from(trailer[0]) | (u32::from(trailer[1]) << 8) | (u32::from(trailer[2]) << 16);
    let mix = u32::from_le_bytes(*mix);
    (obf ^ mix ^ (IV_FUZZ & 0xFF_FFFF)) & 0xFF_FFFF
}

/// Picks, among the integers within `2^23` of `high_water` whose low 24
/// bits equal `low24`, the one nearest to `high_water + 1` (the expected
/// next IV). Before any IV has been accepted, the low 24 bits are taken
/// verbatim.
fn reconstruct_iv(high_water: u64, seen_any: bool, low24: u32) -> u64 {
    if !seen_any {
        return low24 as u64;
    }
    let base = high_water & !0xFF_FFFF;
    let candidates = [base.wrapping_sub(0x100_0000) | low24 as u64, base | low24 as u64, base.wrapping_add(0x100_0000) | low24 as u64];
    candidates
        .into_iter()
        .min_by_key(|c| (*c as i128 - (high_water as i128 + 1)).abs())
        .unwrap()
}
