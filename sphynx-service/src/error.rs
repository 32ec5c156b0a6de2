use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol layer error: {0}")]
    Protocol(#[from] sphynx_protocol::Error),
    #[error("transport layer error: {0}")]
    Transport(#[from] sphynx_transport::Error),
    #[error("connexion map is full")]
    MapFull,
    #[error("source address is flood-limited")]
    FloodLimited,
    #[error("no connexion for this address")]
    NotFound,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
