#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
//! Implements the CELT layer of the Opus audio codec in Rust.
//!
//! CELT is the transform codec inside Opus (RFC 6716 §4.3), responsible for
//! music and general audio. It codes 48 kHz PCM, mono or stereo, in frames
//! of 120, 240, 480 or 960 samples (2.5 to 20 ms). Every frame runs through
//! a lapped MDCT, per-band energy quantization and a pyramid vector
//! quantizer for the spectral shapes, all sharing a single range coder and
//! a single bit budget that the encoder and the decoder derive identically.
//!
//! The crate exposes the layer on its own: framing, the SILK layer and the
//! hybrid multiplexing above the CELT start band belong to an outer layer.
//! Its main features are:
//!
//! * Frame sizes from 2.5 ms to 20 ms at 48 kHz
//! * Constant and variable bitrate operation
//! * Mono and stereo, with intensity and dual stereo coding
//! * Inter-frame packet loss concealment
//! * A pitch prefilter/postfilter pair for periodic material

pub use decoder::*;
pub use decoder_error::*;
pub use encoder::*;
pub use encoder_error::*;

pub(crate) mod celt;
mod decoder;
mod decoder_error;
mod encoder;
mod encoder_error;
pub(crate) mod math;
pub(crate) mod range_coder;

// Affects the following targets: avr and msp430
#[cfg(any(target_pointer_width = "8", target_pointer_width = "16"))]
compile_error!("usize needs to be at least 32 bit wide");

/// Allows applications to use their own sample format.
pub trait Sample {
    /// Converts the given float into the custom sample.
    fn from_f32(float: f32) -> Self;
}

impl Sample for f32 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        float
    }
}

impl Sample for f64 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        f64::from(float)
    }
}

impl Sample for i16 {
    #[inline(always)]
    fn from_f32(float: f32) -> Self {
        let float = float * 32768.0;
        if float > 32767.0 {
            32767
        } else if float < -32768.0 {
            -32768
        } else {
            float as i16
        }
    }
}

/// Audio channels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Channels {
    /// Mono - 1 channel
    Mono = 1,
    /// Stereo - 2 channels
    Stereo = 2,
}

/// Audio bandwidth.
///
/// Limits how many of the 21 bands are coded; the bins above the limit stay
/// zero on both sides.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Bandwidth {
    /// Automatic selection (codes the full range).
    Auto,
    /// 4 kHz passband.
    Narrowband,
    /// 6 kHz passband.
    Mediumband,
    /// 8 kHz passband.
    Wideband,
    /// 12 kHz passband.
    Superwideband,
    /// 20 kHz passband.
    Fullband,
}
