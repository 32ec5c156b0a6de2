use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol layer error: {0}")]
    Protocol(#[from] sphynx_protocol::Error),
    #[error("message exceeds MAX_MESSAGE_SIZE, use the huge-transfer path")]
    MessageTooLarge,
    #[error("send buffer is full")]
    Busy,
    #[error("unknown stream id {0}")]
    UnknownStream(u8),
    #[error("huge transfer aborted: {0:?}")]
    HugeAborted(crate::huge::AbortReason),
}
