//! Implements the encoder.

use crate::celt::CeltEncoder;
use crate::{Bandwidth, Channels, EncoderError};

/// Configures the encoder on creation.
#[derive(Clone, Debug)]
pub struct EncoderConfiguration {
    /// Number of channels to encode. Default: Stereo.
    pub channels: Channels,
    /// Target bitrate in bits per second; 0 fills whatever buffer is given.
    /// Default: 64000.
    pub bitrate: u32,
    /// Variable bitrate operation. Default: off (constant bitrate).
    pub vbr: bool,
    /// Search effort from 0 to 10. Only changes the encoder's decisions,
    /// never what a decoder must do. Default: 5.
    pub complexity: u32,
    /// Signal bandwidth to code. Default: automatic (full band).
    pub bandwidth: Bandwidth,
}

impl Default for EncoderConfiguration {
    fn default() -> Self {
        Self {
            channels: Channels::Stereo,
            bitrate: 64_000,
            vbr: false,
            complexity: 5,
            bandwidth: Bandwidth::Auto,
        }
    }
}

/// CELT encoder.
///
/// The encoder is stateful: frames must be passed in order, and the decoder
/// on the other end must see every packet in the same order to stay in sync
/// with the energy predictors and the overlap.
pub struct Encoder {
    celt: CeltEncoder,
    channels: Channels,
    bitrate: u32,
}

impl Encoder {
    /// Creates a new `Encoder` with the given configuration.
    pub fn new(configuration: &EncoderConfiguration) -> Result<Self, EncoderError> {
        let mut celt = CeltEncoder::new(configuration.channels)?;
        celt.set_bitrate(configuration.bitrate);
        celt.set_vbr(configuration.vbr);
        celt.set_complexity(configuration.complexity);
        celt.set_bandwidth(configuration.bandwidth);

        Ok(Self {
            celt,
            channels: configuration.channels,
            bitrate: configuration.bitrate,
        })
    }

    /// Resets the encoder to be equivalent to a freshly initialized one.
    pub fn reset(&mut self) {
        self.celt.reset();
    }

    /// Returns the channels the encoder was initialized with.
    pub fn channels(&self) -> Channels {
        self.channels
    }

    /// Returns the configured bitrate in bits per second.
    pub fn bitrate(&self) -> u32 {
        self.bitrate
    }

    /// Changes the target bitrate.
    pub fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate;
        self.celt.set_bitrate(bitrate);
    }

    /// Switches variable bitrate operation on or off.
    pub fn set_vbr(&mut self, vbr: bool) {
        self.celt.set_vbr(vbr);
    }

    /// Changes the search effort (0 to 10).
    pub fn set_complexity(&mut self, complexity: u32) {
        self.celt.set_complexity(complexity);
    }

    /// Tells the encoder how many percent of packets are expected to be
    /// lost, shifting its decisions towards loss robustness.
    pub fn set_packet_loss(&mut self, percent: i32) {
        self.celt.set_packet_loss(percent);
    }

    /// Marks the stream as a low-frequency-effects channel.
    pub fn set_lfe(&mut self, lfe: bool) {
        self.celt.set_lfe(lfe);
    }

    /// Limits the coded bandwidth.
    pub fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.celt.set_bandwidth(bandwidth);
    }

    /// Forces the packets to carry the given channel count, independent of
    /// the input channels. A stereo input forced to mono is downmixed.
    pub fn set_force_channels(&mut self, channels: Channels) {
        self.celt.set_stream_channels(channels);
    }

    /// Returns the final state of the range coder after the last frame.
    ///
    /// The decoder's state must be identical after decoding that frame,
    /// assuming no corruption; the conformance tests rely on this.
    pub fn final_range(&self) -> u32 {
        self.celt.final_range()
    }

    /// Encodes one frame of interleaved float samples in the ±1.0 range.
    ///
    /// `samples` must hold `frame_size * channels` values and `frame_size`
    /// must be 120, 240, 480 or 960. Returns the number of bytes written
    /// into `packet`.
    pub fn encode_float(
        &mut self,
        samples: &[f32],
        frame_size: usize,
        packet: &mut [u8],
    ) -> Result<usize, EncoderError> {
        self.celt.encode(samples, frame_size, packet)
    }

    /// Restricts coding to the bands above the hybrid start band, for use
    /// below another codec covering the low frequencies.
    pub fn set_hybrid(&mut self, hybrid: bool) {
        self.celt.set_start_band(if hybrid {
            crate::celt::HYBRID_START_BAND
        } else {
            0
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    fn sine(frequency: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .into_iter()
            .map(|i| {
                amplitude
                    * (2.0 * std::f32::consts::PI * frequency * i as f32 / 48_000.0).sin()
            })
            .collect()
    }

    #[test]
    fn test_invalid_frame_size_is_rejected() {
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: Channels::Mono,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let samples = vec![0_f32; 1000];
        let mut packet = [0_u8; 400];
        assert!(matches!(
            encoder.encode_float(&samples, 1000, &mut packet),
            Err(EncoderError::InvalidFrameSize)
        ));
    }

    #[test]
    fn test_cbr_packet_size_follows_bitrate() {
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: Channels::Mono,
            bitrate: 64_000,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let samples = sine(440.0, 0.5, 960);
        let mut packet = [0_u8; 1275];

        let len = encoder.encode_float(&samples, 960, &mut packet).unwrap();
        // 64 kb/s at 20 ms is exactly 160 bytes.
        assert_eq!(len, 160);
    }

    #[test]
    fn test_every_frame_size_encodes() {
        [120_usize, 240, 480, 960].iter().for_each(|&frame_size| {
            let mut encoder = Encoder::new(&EncoderConfiguration {
                channels: Channels::Mono,
                bitrate: 64_000,
                ..EncoderConfiguration::default()
            })
            .unwrap();
            let samples = sine(1000.0, 0.4, frame_size);
            let mut packet = [0_u8; 1275];
            let len = encoder
                .encode_float(&samples, frame_size, &mut packet)
                .unwrap();
            assert!(len >= 2);
            assert!(encoder.final_range() != 0);
        });
    }

    #[test]
    fn test_vbr_spends_fewer_bytes_on_easy_frames() {
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: Channels::Mono,
            bitrate: 64_000,
            vbr: true,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let quiet = sine(440.0, 0.01, 960);
        let mut packet = [0_u8; 1275];

        let mut total = 0;
        (0..10).into_iter().for_each(|_| {
            total += encoder.encode_float(&quiet, 960, &mut packet).unwrap();
        });
        // A quiet tone should stay well below ten full CBR packets.
        assert!(total <= 10 * 170, "vbr spent {} bytes", total);
    }

    #[test]
    fn test_silence_is_flagged_in_the_bitstream() {
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: Channels::Mono,
            bitrate: 64_000,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let samples = vec![0_f32; 960];
        let mut packet = [0_u8; 1275];
        let len = encoder.encode_float(&samples, 960, &mut packet).unwrap();

        let mut dec = crate::range_coder::RangeDecoder::new(&packet[..len]);
        assert!(dec.decode_bit_logp(15), "silence flag not set");
    }
}
