use core::num::TryFromIntError;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IoError {
    /// A read started at or ran past the end of the addressable range.
    #[error("end of file")]
    EndOfFile,
    /// A read returned fewer bytes than the caller's minimum.
    #[error("short read at offset {offset}: expected {expected} bytes, read {actual}")]
    ShortRead {
        offset: u64,
        expected: usize,
        actual: usize,
    },
    /// An access fell outside the region or factory bounds.
    #[error("access at offset {offset} of {len} bytes outside a capacity of {capacity}")]
    OutOfRange { offset: u64, len: u64, capacity: u64 },
    #[error("buffer error: {0}")]
    Buffer(&'static str),
    #[error("could not convert number: {0}")]
    NumericConversion(#[from] TryFromIntError),
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, IoError>;
