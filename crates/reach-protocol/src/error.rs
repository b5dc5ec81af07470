//! Codec errors.

use thiserror::Error;

use crate::message::{MAX_MESSAGE_SIZE, PATH_LENGTH};

/// A received datagram could not be decoded.
///
/// Every variant means the datagram is dropped; none of them is fatal to the
/// receive loop.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown message tag {0}")]
    UnknownTag(u8),

    #[error("truncated {field}: need {needed} bytes, {remaining} left")]
    Truncated {
        field: &'static str,
        needed: usize,
        remaining: usize,
    },

    #[error("request path is not valid UTF-8")]
    InvalidPath,

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// An outgoing message does not fit the wire format.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("path is {len} bytes, limit is {PATH_LENGTH}")]
    PathTooLong { len: usize },

    #[error("path contains a NUL byte")]
    PathContainsNul,

    #[error("interval set has {0} intervals, at most 255 can be encoded")]
    TooManyIntervals(usize),

    #[error("message is {len} bytes, limit is {MAX_MESSAGE_SIZE}")]
    MessageTooLarge { len: usize },
}
