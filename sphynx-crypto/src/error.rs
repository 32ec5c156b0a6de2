use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("point is not on the curve")]
    NotOnCurve,
    #[error("point is the additive identity")]
    IdentityPoint,
    #[error("scalar must be non-zero")]
    ZeroScalar,
    #[error("mac verification failed")]
    MacMismatch,
}
