use std::io;

/// Any error that can occur inside the core crates.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An object failed apply-time validation. The previous version of the
    /// object (if any) stays in place.
    #[error("configuration rejected: {0}")]
    Config(String),

    #[error(transparent)]
    Parse(#[from] rsip::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("transport {0} is not registered")]
    NoTransport(String),

    #[error("request towards {0} timed out")]
    Timeout(String),

    #[error("serializer {0} no longer accepts tasks")]
    SerializerClosed(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
