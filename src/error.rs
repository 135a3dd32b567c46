use thiserror::Error;

use crate::datamodel::ChunkId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{handle} had wrong hash: {actual}")]
    HashMismatch { handle: String, actual: String },

    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("decryption failed: wrong key or corrupted data")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    #[error("no blob for chunk {chunk_id:?}")]
    MissingBlob { chunk_id: ChunkId },

    #[error("malformed change set: {0}")]
    MalformedChangeSet(String),

    #[error("local store error: {0}")]
    LocalStore(#[from] fjall::Error),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Backend(Box::new(err))
    }

    /// Whether this error is about the integrity of stored data rather than
    /// about reaching it.
    pub fn is_integrity_error(&self) -> bool {
        matches!(
            self,
            Error::HashMismatch { .. }
                | Error::UnsupportedVersion(_)
                | Error::InvalidFormat(_)
                | Error::DecryptionFailed
                | Error::Decompression(_)
                | Error::Serialization(_)
                | Error::MissingBlob { .. }
        )
    }
}

/// Returns an [`Error::IllegalState`] from the current function unless the
/// condition holds.
macro_rules! ensure_state {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::IllegalState(format!($($arg)+)));
        }
    };
}
pub(crate) use ensure_state;

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            other => std::io::Error::other(other),
        }
    }
}
