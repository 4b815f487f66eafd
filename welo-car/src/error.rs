use welo_base::BlockError;

/// Car utility error
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The header or a section could not be parsed.
    #[error("Failed to parse CAR file: {0}")]
    Parsing(String),
    /// The archive is well formed but not something we accept.
    #[error("Invalid CAR file: {0}")]
    InvalidFile(String),
    /// A section length exceeded [`MAX_ALLOC`](crate::util::MAX_ALLOC).
    #[error("section too large: {0} bytes")]
    LdReadTooLarge(usize),
    /// A section's bytes do not hash to the identifier it was stored under.
    #[error(transparent)]
    Block(#[from] BlockError),
    /// The header could not be encoded.
    #[error("encoding header: {0}")]
    Encoding(String),
    /// Underlying reader or writer failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cid::Error> for Error {
    fn from(err: cid::Error) -> Error {
        Error::Parsing(err.to_string())
    }
}
