//! Primitive cryptographic black boxes used by the rest of the Sphynx stack.
//!
//! Nothing in this crate is Sphynx-protocol-aware: it only wraps maintained
//! RustCrypto-family crates behind the narrow contracts the protocol layer
//! needs (see `DESIGN.md` at the workspace root for the exact substitutions
//! made for primitives that have no bit-compatible maintained crate).

pub mod cipher;
pub mod curve;
pub mod error;
pub mod hash;
pub mod mac;
pub mod random;
pub mod secret;

pub use error::Error;
