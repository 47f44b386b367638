//! error taxonomy shared across the agent crates

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("bad input: {0}")]
    BadInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("disk error: {0}")]
    Disk(String),

    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    #[error("chain rejected: {0}")]
    ChainRejected(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("unrecognized deposit code version {0}")]
    BadVersion(u8),

    #[error("deposit code length {0} does not match its version")]
    BadLength(usize),

    #[error("deposit code is not valid base58")]
    BadEncoding,
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Disk(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
