use thiserror::Error;

use crate::constants::HandshakeError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("handshake rejected: {0:?}")]
    Handshake(HandshakeError),
    #[error("cookie did not verify")]
    InvalidCookie,
    #[error("malformed handshake packet")]
    Malformed,
    #[error("crypto primitive error: {0}")]
    Crypto(#[from] sphynx_crypto::Error),
    #[error("decrypt failed authentication")]
    DecryptFailed,
    #[error("replayed or out-of-window iv")]
    ReplayedIv,
    #[error("chunk header malformed")]
    BadChunk,
}
