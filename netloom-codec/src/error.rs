use netloom_core::error::HandlerError;
use thiserror::Error;

/// Framing and text codec errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame of {length} bytes exceeds the maximum of {max}")]
    FrameTooLong { length: u64, max: usize },

    #[error("frame of {length} bytes does not fit a {width}-byte length field")]
    LengthOverflow { length: usize, width: usize },

    #[error("invalid UTF-8: {0}")]
    InvalidUtf8(String),
}

/// Result type alias for codec operations
pub type Result<T> = std::result::Result<T, CodecError>;

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::LengthOverflow { .. } => Self::Encode(err.to_string()),
            CodecError::FrameTooLong { .. } | CodecError::InvalidUtf8(_) => {
                Self::Decode(err.to_string())
            }
        }
    }
}
