use core::num::TryFromIntError;

use block_io::IoError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// An on-disk structure failed a magic, size, or nonce check. The layout
    /// must be treated as unreadable.
    #[error("corrupt {0}")]
    CorruptComponent(&'static str),
    #[error("unsupported version {0}")]
    UnsupportedVersion(u32),
    /// The persisted geometry disagrees with what the caller asked for.
    #[error("index config differs from the on-disk layout")]
    WrongIndexConfig,
    /// Nothing recognizable has ever been written here.
    #[error("no index found")]
    NoIndex,
    /// Saves exist but none of them validates.
    #[error("the index was not saved cleanly")]
    IndexNotSavedCleanly,
    #[error("insufficient index space: need {needed} bytes, have {available}")]
    InsufficientIndexSpace { needed: u64, available: u64 },
    #[error("incorrect alignment: {0}")]
    IncorrectAlignment(&'static str),
    #[error("bad state: {0}")]
    BadState(&'static str),
    #[error("unexpected result: {0}")]
    UnexpectedResult(&'static str),
    #[error(transparent)]
    Io(#[from] IoError),
}

impl From<TryFromIntError> for Error {
    fn from(err: TryFromIntError) -> Self {
        Error::Io(IoError::NumericConversion(err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
