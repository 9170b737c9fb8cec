//! Codec error types.

use thiserror::Error;

/// Errors produced while framing or decoding supervisor traffic.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Underlying stream failure.
    #[error("transport i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame length prefix exceeds the configured read buffer.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced frame length.
        len: usize,
        /// Configured limit.
        max: usize,
    },

    /// Frame body is not a well-formed record.
    #[error("malformed frame: {0}")]
    Malformed(String),
}
