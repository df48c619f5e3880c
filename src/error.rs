//! Crate-wide error kinds.
//!
//! Every fallible operation in the library returns [`Result`].  The kinds
//! mirror the failure surface of the on-disk protocol: callers are expected
//! to match on them — `TooBig` and `Empty` in particular are retry/termination
//! signals rather than hard failures.

use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Null argument, out-of-range id, or malformed payload.
    #[error("invalid parameter: {0}")]
    ParameterInvalid(String),

    /// A fixed buffer (serializer scratch, staging) would be exceeded.
    #[error("not enough memory in fixed buffer")]
    NotEnoughMemory,

    /// Duplicate source or signal id on the writer.
    #[error("id is already defined")]
    AlreadyExists,

    /// Lookup of an undefined source or signal id.
    #[error("id is not defined")]
    NotFound,

    /// Unimplemented data type or signal-type operation.
    #[error("operation is not supported")]
    NotSupported,

    /// A chunk payload exceeds the caller's buffer.  The caller must grow
    /// to at least `needed` bytes and retry; the read position is unchanged.
    #[error("payload too big for buffer ({needed} bytes required)")]
    TooBig { needed: usize },

    /// End of file or end of chain.
    #[error("end of file or chain")]
    Empty,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn param(msg: impl Into<String>) -> Self {
        Error::ParameterInvalid(msg.into())
    }
}
