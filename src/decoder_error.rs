//! Decoder errors.

/// Errors thrown by the decoder.
#[derive(Debug)]
pub enum DecoderError {
    /// The frame size is not one of 120, 240, 480 or 960 samples.
    InvalidFrameSize,
    /// The output buffer cannot hold one frame per channel.
    BufferTooSmall,
    /// An internal decoder error.
    InternalError(&'static str),
}

impl std::fmt::Display for DecoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecoderError::InvalidFrameSize => {
                write!(f, "frame size must be 120, 240, 480 or 960 samples")
            }
            DecoderError::BufferTooSmall => {
                write!(f, "output buffer is too small")
            }
            DecoderError::InternalError(message) => {
                write!(f, "{}", message)
            }
        }
    }
}

impl std::error::Error for DecoderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
