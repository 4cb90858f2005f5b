//! # Codec Error Types

use thiserror::Error;

use super::MessageId;

/// Errors raised while encoding or decoding messages.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The input ended before a field could be read.
    #[error("unexpected end of message: need {needed} bytes, have {remaining}")]
    UnexpectedEnd {
        /// Bytes the field needs.
        needed: usize,
        /// Bytes left in the input.
        remaining: usize,
    },

    /// The encoded message would exceed the size limit.
    #[error("message too large: {size} bytes (max {max})")]
    TooLarge {
        /// Size the message would reach.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// A string field is not valid UTF-8.
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,

    /// A plain-old-data field could not be reinterpreted.
    #[error("invalid plain-old-data field")]
    InvalidPod,

    /// The id lies in the range reserved for runtime frames.
    #[error("message id {0} is reserved")]
    ReservedId(MessageId),

    /// Two different types claim the same id.
    #[error("message id {id} already registered by {existing}, refusing {incoming}")]
    IdCollision {
        /// The contested id.
        id: MessageId,
        /// Type that registered first.
        existing: &'static str,
        /// Type that tried to register.
        incoming: &'static str,
    },

    /// A frame is shorter than its own header.
    #[error("frame truncated: {0} bytes")]
    Truncated(usize),
}

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;
