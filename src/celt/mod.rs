//! Implements the CELT transform codec layer.
//!
//! CELT codes 48 kHz audio in frames of 120 to 960 samples. Each frame is a
//! lapped MDCT whose spectrum is split into critical bands; per-band energy
//! and a unit-norm "shape" are quantized separately, with a closed-form bit
//! allocation shared between the encoder and the decoder so that no explicit
//! allocation information has to be transmitted.
pub(crate) use decoder::CeltDecoder;
pub(crate) use encoder::CeltEncoder;

pub(crate) mod bands;
pub(crate) mod comb_filter;
pub(crate) mod cwrs;
pub(crate) mod decoder;
pub(crate) mod encoder;
pub(crate) mod kiss_fft;
pub(crate) mod mdct;
pub(crate) mod mode;
pub(crate) mod pitch;
pub(crate) mod quant_energy;
pub(crate) mod rate;
pub(crate) mod tables;
pub(crate) mod vq;

/// Number of critical bands at 48 kHz.
pub(crate) const NB_BANDS: usize = 21;
/// Length of the MDCT window and of the inter-frame overlap region.
pub(crate) const OVERLAP: usize = 120;
/// Number of frequency coefficients of one short MDCT block.
pub(crate) const SHORT_MDCT_SIZE: usize = 120;
/// The largest supported size shift (960-sample frames).
pub(crate) const MAX_LM: usize = 3;
/// Shortest comb filter period.
pub(crate) const COMB_MIN_PERIOD: usize = 15;
/// Longest comb filter period.
pub(crate) const COMB_MAX_PERIOD: usize = 1024;
/// Synthesis history kept by the decoder, used by the postfilter and the PLC.
pub(crate) const DECODE_BUFFER_SIZE: usize = 2048;
/// The signal path runs at a nominal ±32768 full-scale.
pub(crate) const SIG_SCALE: f32 = 32768.0;
/// Floor to keep divisions and square roots away from zero.
pub(crate) const EPSILON: f32 = 1e-15;
/// Amplitude floor for band energies.
pub(crate) const ENERGY_FLOOR: f32 = 1e-27;
/// Maximum number of fine energy bits per band.
pub(crate) const MAX_FINE_BITS: i32 = 8;
/// Bias of the fine-bits split inside the allocator, in 1/8 bits.
pub(crate) const FINE_OFFSET: i32 = 21;
/// Rate offset of the theta quantizer for mono/split bands, in 1/8 bits.
pub(crate) const QTHETA_OFFSET: i32 = 4;
/// Rate offset of the theta quantizer for two-phase stereo, in 1/8 bits.
pub(crate) const QTHETA_OFFSET_TWOPHASE: i32 = 16;
/// First band coded when the layer runs above another codec (hybrid mode).
pub(crate) const HYBRID_START_BAND: usize = 17;

/// No rotation: the band is assumed tonal enough already.
pub(crate) const SPREAD_NONE: usize = 0;
/// A light rotation.
pub(crate) const SPREAD_LIGHT: usize = 1;
/// The default rotation.
pub(crate) const SPREAD_NORMAL: usize = 2;
/// The strongest rotation, for noise-like content.
pub(crate) const SPREAD_AGGRESSIVE: usize = 3;

/// Frame sizes, in samples per channel, the layer accepts.
pub(crate) const FRAME_SIZES: [usize; 4] = [120, 240, 480, 960];

/// Returns the size shift for a valid frame size, or `None`.
pub(crate) fn frame_size_to_lm(frame_size: usize) -> Option<usize> {
    FRAME_SIZES
        .iter()
        .position(|&size| size == frame_size)
}

use crate::encoder_error::EncoderError;
use crate::range_coder::{RangeDecoder, RangeEncoder, Tell};

/// Either side of the range coder.
///
/// The bit allocation and all flag fields are decisions both sides must
/// derive identically; running one function body over this wrapper makes a
/// divergence impossible. On encode the passed symbol value is written and
/// returned, on decode it is ignored and the decoded value returned.
pub(crate) enum Coder<'a, 'b> {
    Encode(&'a mut RangeEncoder<'b>),
    Decode(&'a mut RangeDecoder<'b>),
}

impl<'a, 'b> Coder<'a, 'b> {
    /// True for the encoding side.
    pub(crate) fn is_encoder(&self) -> bool {
        matches!(self, Coder::Encode(_))
    }

    /// Whole bits consumed so far.
    pub(crate) fn tell(&self) -> u32 {
        match self {
            Coder::Encode(enc) => enc.tell(),
            Coder::Decode(dec) => dec.tell(),
        }
    }

    /// 1/8 bits consumed so far.
    pub(crate) fn tell_frac(&self) -> u32 {
        match self {
            Coder::Encode(enc) => enc.tell_frac(),
            Coder::Decode(dec) => dec.tell_frac(),
        }
    }

    /// Codes one bit with probability `1/2^logp` of being set.
    pub(crate) fn bit_logp(&mut self, value: bool, logp: u32) -> Result<bool, EncoderError> {
        match self {
            Coder::Encode(enc) => {
                enc.encode_bit_logp(u32::from(value), logp)?;
                Ok(value)
            }
            Coder::Decode(dec) => Ok(dec.decode_bit_logp(logp)),
        }
    }

    /// Codes raw bits.
    pub(crate) fn bits(&mut self, value: u32, bits: u32) -> Result<u32, EncoderError> {
        match self {
            Coder::Encode(enc) => {
                enc.encode_bits(value, bits)?;
                Ok(value)
            }
            Coder::Decode(dec) => Ok(dec.decode_bits(bits)),
        }
    }

    /// Codes a uniform integer in `[0, ft)`.
    pub(crate) fn uint(&mut self, value: u32, ft: u32) -> Result<u32, EncoderError> {
        match self {
            Coder::Encode(enc) => {
                enc.encode_uint(value, ft)?;
                Ok(value)
            }
            Coder::Decode(dec) => Ok(dec.decode_uint(ft)),
        }
    }

}
