//! Encoder errors.

/// Errors thrown by the encoder.
#[derive(Debug)]
pub enum EncoderError {
    /// The output buffer is too small.
    BufferTooSmall,
    /// The frame size is not one of 120, 240, 480 or 960 samples.
    InvalidFrameSize,
    /// The input does not hold one full frame per channel.
    InvalidInputSize,
    /// An internal encoder error.
    InternalError(&'static str),
}

impl std::fmt::Display for EncoderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncoderError::BufferTooSmall => {
                write!(f, "output buffer is too small")
            }
            EncoderError::InvalidFrameSize => {
                write!(f, "frame size must be 120, 240, 480 or 960 samples")
            }
            EncoderError::InvalidInputSize => {
                write!(f, "input must hold frame_size samples per channel")
            }
            EncoderError::InternalError(message) => {
                write!(f, "{}", message)
            }
        }
    }
}

impl std::error::Error for EncoderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}
