//! Error types for snirelay.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid TLS ClientHello data")]
    InvalidClientHello,

    #[error("invalid TLS packet data")]
    InvalidTlsPacket,

    #[error("invalid TLS protocol")]
    InvalidTlsProtocol,

    #[error("target host rejected")]
    TargetRejected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
