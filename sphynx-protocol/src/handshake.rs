//! The three-packet Tabby handshake: an MQV-family key agreement over the
//! curve wrapped by `sphynx_crypto::curve`.
//!
//! Wire point encodings here are 32 bytes (the `curve25519-dalek` Edwards
//! point size) rather than the 64 bytes a bit-exact original-curve peer
//! would use; this follows directly from the curve substitution documented
//! in `DESIGN.md` and is not an independent deviation.

use sphynx_crypto::curve::{CurvePoint, CurveScalar};
use sphynx_crypto::hash::{hash512, kdf};
use sphynx_crypto::random::SecureRandom;
use sphynx_crypto::secret::Secret;
use subtle::ConstantTimeEq;

use crate::constants::{HandshakeError, HandshakeType, PROTOCOL_MAGIC};
use crate::error::Error;

const POINT_BYTES: usize = 32;
const NONCE_BYTES: usize = 32;
const PROOF_BYTES: usize = 32;
/// Reject combiner scalars below this threshold (degenerate small-scalar
/// case); mirrors the original's `S >= 1000` requirement.
const MIN_COMBINER: u64 = 1000;

pub struct ServerIdentity {
    pub private: CurveScalar,
    pub public: CurvePoint,
}

impl ServerIdentity {
    pub fn generate(rng: &mut SecureRandom) -> Self {
        let private = CurveScalar::random(rng);
        let public = CurvePoint::base_mul(&private);
        Self { private, public }
    }
}

/// The four sub-keys derived from one completed handshake.
pub struct SessionKeys {
    pub c2s_mac: Secret<16>,
    pub s2c_mac: Secret<16>,
    pub c2s_enc: Secret<32>,
    pub s2c_enc: Secret<32>,
}

fn derive_session_keys(shared_x: &[u8; 32], transcript: &[u8]) -> SessionKeys {
    let c2s_mac = kdf(shared_x, b"sphynx-c2s-mac", transcript, 16);
    let s2c_mac = kdf(shared_x, b"sphynx-s2c-mac", transcript, 16);
    let c2s_enc = kdf(shared_x, b"sphynx-c2s-enc", transcript, 32);
    let s2c_enc = kdf(shared_x, b"sphynx-s2c-enc", transcript, 32);
    SessionKeys {
        c2s_mac: Secret::new(c2s_mac.try_into().unwrap()),
        s2c_mac: Secret::new(s2c_mac.try_into().unwrap()),
        c2s_enc: Secret::new(c2s_enc.try_into().unwrap()),
        s2c_enc: Secret::new(s2c_enc.try_into().unwrap()),
    }
}

fn derive_proof(shared_x: &[u8; 32], transcript: &[u8]) -> [u8; PROOF_BYTES] {
    kdf(shared_x, b"sphynx-proof", transcript, PROOF_BYTES).try_into().unwrap()
}

fn combiner_scalar(big_a: &CurvePoint, server_pub: &CurvePoint, big_y: &CurvePoint, r: &[u8; NONCE_BYTES]) -> CurveScalar {
    let digest = hash512(&[&big_a.encode(), &server_pub.encode(), &big_y.encode(), r]);
    CurveScalar::from_wide_bytes(digest)
}

/// Client step 1: produce the ephemeral key pair sent in CHALLENGE.
pub fn client_begin(rng: &mut SecureRandom) -> (CurveScalar, CurvePoint) {
    let a = CurveScalar::random(rng);
    let big_a = CurvePoint::base_mul(&a);
    (a, big_a)
}

/// Server step: having received CHALLENGE's `big_a`, produce the ephemeral
/// response, the derived session keys, and the proof to send back in
/// ANSWER. Returns `Err` if the combiner scalar is degenerate.
pub fn server_respond(
    identity: &ServerIdentity,
    big_a: &CurvePoint,
    rng: &mut SecureRandom,
) -> Result<(CurvePoint, [u8; NONCE_BYTES], SessionKeys, [u8; PROOF_BYTES]), Error> {
    let y = CurveScalar::random(rng);
    let big_y = CurvePoint::base_mul(&y);
    let mut r = [0u8; NONCE_BYTES];
    rng.fill_bytes(&mut r);

    let s = combiner_scalar(big_a, &identity.public, &big_y, &r);
    if s.is_below(MIN_COMBINER) {
        return Err(Error::Handshake(HandshakeError::ServerError));
    }

    let combined_scalar = identity.private + (y * s);
    let shared_point = big_a.mul(&combined_scalar).mul_by_cofactor();
    let shared_x = shared_point.affine_x();

    let transcript = transcript_bytes(big_a, &identity.public, &big_y, &r);
    let keys = derive_session_keys(&shared_x, &transcript);
    let proof = derive_proof(&shared_x, &transcript);

    Ok((big_y, r, keys, proof))
}

/// Client step 2: having received ANSWER, validate the proof and derive the
/// same session keys the server derived.
pub fn client_finish(
    server_pub: &CurvePoint,
    a: &CurveScalar,
    big_a: &CurvePoint,
    big_y: &CurvePoint,
    r: &[u8; NONCE_BYTES],
    proof: &[u8; PROOF_BYTES],
) -> Result<SessionKeys, Error> {
    let s = combiner_scalar(big_a, server_pub, big_y, r);
    if s.is_below(MIN_COMBINER) {
        return Err(Error::Handshake(HandshakeError::ServerError));
    }

    let combined_point = server_pub.mul_by_cofactor().add(&big_y.mul_by_cofactor().mul(&s));
    let shared_point = combined_point.mul(a);
    let shared_x = shared_point.affine_x();

    let transcript = transcript_bytes(big_a, server_pub, big_y, r);
    let expected_proof = derive_proof(&shared_x, &transcript);
    if !bool::from(expected_proof.ct_eq(proof)) {
        return Err(Error::Handshake(HandshakeError::WrongKey));
    }

    Ok(derive_session_keys(&shared_x, &transcript))
}

fn transcript_bytes(big_a: &CurvePoint, server_pub: &CurvePoint, big_y: &CurvePoint, r: &[u8; NONCE_BYTES]) -> Vec<u8> {
    let mut out = Vec::with_capacity(POINT_BYTES * 3 + NONCE_BYTES);
    out.extend_from_slice(&big_a.encode());
    out.extend_from_slice(&server_pub.encode());
    out.extend_from_slice(&big_y.encode());
    out.extend_from_slice(r);
    out
}

// --- wire encode/decode ---

pub fn encode_hello(server_pub_echo: &CurvePoint) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + POINT_BYTES);
    out.push(HandshakeType::C2sHello as u8);
    out.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    out.extend_from_slice(&server_pub_echo.encode());
    out
}

pub fn decode_hello(bytes: &[u8]) -> Result<CurvePoint, Error> {
    if bytes.len() != 1 + 4 + POINT_BYTES || bytes[0] != HandshakeType::C2sHello as u8 {
        return Err(Error::Malformed);
    }
    let magic = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
    if magic != PROTOCOL_MAGIC {
        return Err(Error::Malformed);
    }
    let point: [u8; POINT_BYTES] = bytes[5..].try_into().unwrap();
    Ok(CurvePoint::decode(&point)?)
}

pub fn encode_cookie(cookie: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4);
    out.push(HandshakeType::S2cCookie as u8);
    out.extend_from_slice(&cookie);
    out
}

pub fn decode_cookie(bytes: &[u8]) -> Result<[u8; 4], Error> {
    if bytes.len() != 5 || bytes[0] != HandshakeType::S2cCookie as u8 {
        return Err(Error::Malformed);
    }
    Ok(bytes[1..5].try_into().unwrap())
}

pub fn encode_challenge(cookie: [u8; 4], big_a: &CurvePoint) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + 4 + POINT_BYTES);
    out.push(HandshakeType::C2sChallenge as u8);
    out.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
    out.extend_from_slice(&cookie);
    out.extend_from_slice(&big_a.encode());
    out
}

pub fn decode_challenge(bytes: &[u8]) -> Result<([u8; 4], CurvePoint), Error> {
    if bytes.len() != 1 + 4 + 4 + POINT_BYTES || bytes[0] != HandshakeType::C2sChallenge as u8 {
        return Err(Error::Malformed);
    }
    let magic = u32::from_be_bytes(bytes[1..5].try_into().unwrap());
    if magic != PROTOCOL_MAGIC {
        return Err(Error::Malformed);
    }
    let cookie: [u8; 4] = bytes[5..9].try_into().unwrap();
    let point: [u8; POINT_BYTES] = bytes[9..].try_into().unwrap();
    Ok((cookie, CurvePoint::decode(&point)?))
}

pub fn encode_answer(data_port: u16, big_y: &CurvePoint, r: &[u8; NONCE_BYTES], proof: &[u8; PROOF_BYTES]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 2 + POINT_BYTES + NONCE_BYTES + PROOF_BYTES);
    out.push(HandshakeType::S2cAnswer as u8);
    out.extend_from_slice(&data_port.to_le_bytes());
    out.extend_from_slice(&big_y.encode());
    out.extend_from_slice(r);
    out.extend_from_slice(proof);
    out
}

pub fn decode_answer(bytes: &[u8]) -> Result<(u16, CurvePoint, [u8; NONCE_BYTES], [u8; PROOF_BYTES]), Error> {
    let expected_len = 1 + 2 + POINT_BYTES + NONCE_BYTES + PROOF_BYTES;
    if bytes.len() != expected_len || bytes[0] != HandshakeType::S2cAnswer as u8 {
        return Err(Error::Malformed);
    }
    let data_port = u16::from_le_bytes(bytes[1..3].try_into().unwrap());
    let point: [u8; POINT_BYTES] = bytes[3..3 + POINT_BYTES].try_into().unwrap();
    let mut off = 3 + POINT_BYTES;
    let r: [u8; NONCE_BYTES] = bytes[off..off + NONCE_BYTES].try_into().unwrap();
    off += NONCE_BYTES;
    let proof: [u8; PROOF_BYTES] = bytes[off..off + PROOF_BYTES].try_into().unwrap();
    Ok((data_port, CurvePoint::decode(&point)?, r, proof))
}

pub fn encode_error(reason: HandshakeError) -> Vec<u8> {
    vec![HandshakeType::S2cError as u8, reason as u8]
}

pub fn decode_error(bytes: &[u8]) -> Result<HandshakeError, Error> {
    if bytes.len() != 2 || bytes[0] != HandshakeType::S2cError as u8 {
        return Err(Error::Malformed);
    }
    HandshakeError::from_u8(bytes[1]).ok_or(Error::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_handshake_derives_identical_keys() {
        let mut rng = SecureRandom::new();
        let server = ServerIdentity::generate(&mut rng);

        let (a, big_a) = client_begin(&mut rng);
        let (big_y, r, server_keys, proof) = server_respond(&server, &big_a, &mut rng).unwrap();
        let client_keys = client_finish(&server.public, &a, &big_a, &big_y, &r, &proof).unwrap();

        assert_eq!(server_keys.c2s_mac.as_bytes(), client_keys.c2s_mac.as_bytes());
        assert_eq!(server_keys.s2c_mac.as_bytes(), client_keys.s2c_mac.as_bytes());
        assert_eq!(server_keys.c2s_enc.as_bytes(), client_keys.c2s_enc.as_bytes());
        assert_eq!(server_keys.s2c_enc.as_bytes(), client_keys.s2c_enc.as_bytes());
    }

    #[test]
    fn tampered_proof_is_rejected() {
        let mut rng = SecureRandom::new();
        let server = ServerIdentity::generate(&mut rng);
        let (a, big_a) = client_begin(&mut rng);
        let (big_y, r, _keys, mut proof) = server_respond(&server, &big_a, &mut rng).unwrap();
        proof[0] ^= 0xff;
        assert!(client_finish(&server.public, &a, &big_a, &big_y, &r, &proof).is_err());
    }

    #[test]
    fn hello_roundtrips() {
        let mut rng = SecureRandom::new();
        let server = ServerIdentity::generate(&mut rng);
        let encoded = encode_hello(&server.public);
        let decoded = decode_hello(&encoded).unwrap();
        assert_eq!(decoded.encode(), server.public.encode());
    }

    #[test]
    fn challenge_roundtrips() {
        let mut rng = SecureRandom::new();
        let (_a, big_a) = client_begin(&mut rng);
        let cookie = [1, 2, 3, 4];
        let encoded = encode_challenge(cookie, &big_a);
        let (decoded_cookie, decoded_point) = decode_challenge(&encoded).unwrap();
        assert_eq!(decoded_cookie, cookie);
        assert_eq!(decoded_point.encode(), big_a.encode());
    }

    #[test]
    fn error_roundtrips() {
        let encoded = encode_error(HandshakeError::ServerFull);
        assert_eq!(decode_error(&encoded).unwrap(), HandshakeError::ServerFull);
    }
}
