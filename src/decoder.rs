//! Implements the decoder.

use crate::celt::CeltDecoder;
use crate::{Bandwidth, Channels, DecoderError, Sample};

/// Configures the decoder on creation.
#[derive(Clone, Debug)]
pub struct DecoderConfiguration {
    /// Number of channels to decode. Default: Stereo.
    pub channels: Channels,
    /// Scales the decoded output by a factor specified in Q8 dB units.
    /// Default: 0.
    pub gain: i16,
}

impl Default for DecoderConfiguration {
    fn default() -> Self {
        Self {
            channels: Channels::Stereo,
            gain: 0,
        }
    }
}

/// CELT decoder.
///
/// The codec is stateful: packets are not coded independently of each other
/// and must be passed in serially and in the correct order. A lost packet
/// can be replaced with loss concealment by calling the decoder with `None`
/// for the missing packet.
pub struct Decoder {
    celt: CeltDecoder,
    channels: Channels,
    stream_channels: Channels,
    decode_gain: i16,
    final_range: u32,
}

impl Decoder {
    /// Creates a new `Decoder` with the given configuration.
    pub fn new(configuration: &DecoderConfiguration) -> Result<Self, DecoderError> {
        let celt = CeltDecoder::new(configuration.channels)?;

        Ok(Self {
            celt,
            channels: configuration.channels,
            stream_channels: configuration.channels,
            decode_gain: configuration.gain,
            final_range: 0,
        })
    }

    /// Resets the decoder to be equivalent to a freshly initialized decoder.
    ///
    /// This should be called when switching streams in order to prevent
    /// back-to-back decoding from giving different results from one-at-a-
    /// time decoding.
    pub fn reset(&mut self) {
        self.celt.reset();
    }

    /// Returns the channels the decoder was initialized with.
    pub fn channels(&self) -> Channels {
        self.channels
    }

    /// Returns the amount the PCM signal is scaled by, in Q8 dB units.
    pub fn gain(&self) -> i16 {
        self.decode_gain
    }

    /// Number of channels carried by the incoming packets.
    ///
    /// A mono stream decoded by a stereo decoder is duplicated to both
    /// channels; a stereo stream decoded by a mono decoder is downmixed.
    pub fn set_stream_channels(&mut self, channels: Channels) {
        self.stream_channels = channels;
        self.celt.set_stream_channels(channels);
    }

    /// Limits the coded bands to the signal bandwidth.
    pub fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.celt.set_bandwidth(bandwidth);
    }

    /// Restricts decoding to the bands above the hybrid start band, for use
    /// below another codec covering the low frequencies.
    pub fn set_hybrid(&mut self, hybrid: bool) {
        self.celt.set_start_band(if hybrid {
            crate::celt::HYBRID_START_BAND
        } else {
            0
        });
    }

    /// Returns the pitch period of the last decoded frame's postfilter,
    /// in samples at 48 kHz.
    pub fn pitch(&self) -> usize {
        self.celt.pitch()
    }

    /// Returns the final state of the codec's range coder.
    ///
    /// This is used for testing purposes: the encoder and decoder states
    /// should be identical after coding a payload, assuming no data
    /// corruption or software bugs.
    pub fn final_range(&self) -> u32 {
        self.final_range
    }

    /// Decodes a CELT packet with floating point output.
    ///
    /// Returns the number of decoded samples per channel.
    ///
    /// # Arguments
    /// * `packet`     - Input payload. Use `None` to indicate packet loss.
    /// * `samples`    - Output PCM, interleaved if stereo. Must hold at
    ///                  least `frame_size * channels` values.
    /// * `frame_size` - Samples per channel; 120, 240, 480 or 960.
    ///
    pub fn decode_float(
        &mut self,
        packet: Option<&[u8]>,
        samples: &mut [f32],
        frame_size: usize,
    ) -> Result<usize, DecoderError> {
        let decoded = self.celt.decode(packet, samples, frame_size)?;
        self.final_range = self.celt.final_range();

        if self.decode_gain != 0 {
            let gain = 10.0_f32.powf(f32::from(self.decode_gain) / (20.0 * 256.0));
            samples[..decoded * self.channels as usize]
                .iter_mut()
                .for_each(|s| *s *= gain);
        }

        Ok(decoded)
    }

    /// Decodes a CELT packet with a generic sample output.
    ///
    /// Returns the number of decoded samples per channel. See
    /// `decode_float()` for the arguments; the internal format is `f32`.
    pub fn decode<S: Sample>(
        &mut self,
        packet: Option<&[u8]>,
        samples: &mut [S],
        frame_size: usize,
    ) -> Result<usize, DecoderError> {
        let channels = self.channels as usize;
        if samples.len() < frame_size * channels {
            return Err(DecoderError::BufferTooSmall);
        }

        let mut buffer = vec![0_f32; frame_size * channels];
        let decoded = self.decode_float(packet, &mut buffer, frame_size)?;
        samples
            .iter_mut()
            .zip(buffer.iter())
            .for_each(|(out, &value)| {
                *out = S::from_f32(value);
            });

        Ok(decoded)
    }

    #[cfg(test)]
    pub(crate) fn celt(&self) -> &CeltDecoder {
        &self.celt
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;
    use crate::range_coder::{RangeDecoder, Tell};
    use crate::{Encoder, EncoderConfiguration};

    const FRAME: usize = 960;

    fn sine(frequency: f32, amplitude: f32, len: usize) -> Vec<f32> {
        (0..len)
            .into_iter()
            .map(|i| {
                amplitude
                    * (2.0 * std::f32::consts::PI * frequency * i as f32 / 48_000.0).sin()
            })
            .collect()
    }

    /// Encodes and decodes a whole signal frame by frame, asserting the
    /// encoder/decoder range states match after every packet.
    fn round_trip(
        signal: &[f32],
        channels: Channels,
        frame_size: usize,
        bitrate: u32,
    ) -> (Vec<f32>, Vec<usize>) {
        let ch = channels as usize;
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels,
            bitrate,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels,
            gain: 0,
        })
        .unwrap();

        let mut decoded = Vec::new();
        let mut sizes = Vec::new();
        let mut packet = [0_u8; 1500];
        let mut out = vec![0_f32; frame_size * ch];

        signal.chunks_exact(frame_size * ch).for_each(|frame| {
            let len = encoder.encode_float(frame, frame_size, &mut packet).unwrap();
            sizes.push(len);
            let n = decoder
                .decode_float(Some(&packet[..len]), &mut out, frame_size)
                .unwrap();
            assert_eq!(n, frame_size);
            assert_eq!(
                encoder.final_range(),
                decoder.final_range(),
                "range coder state diverged"
            );
            out.iter().for_each(|v| assert!(v.is_finite()));
            decoded.extend_from_slice(&out);
        });

        (decoded, sizes)
    }

    /// Best-alignment correlation, SNR and energy ratio for one channel of
    /// an interleaved signal.
    fn aligned_metrics(
        reference: &[f32],
        decoded: &[f32],
        channels: usize,
        channel: usize,
        skip: usize,
        max_delay: usize,
    ) -> (f64, f64, f64) {
        let frames = reference.len() / channels;
        let len = frames - skip - max_delay;

        let mut best_delay = 0;
        let mut best_corr = -1.0_f64;
        (0..max_delay).into_iter().for_each(|delay| {
            let mut rd = 0.0_f64;
            let mut rr = 0.0_f64;
            let mut dd = 0.0_f64;
            (skip..skip + len).into_iter().for_each(|i| {
                let r = f64::from(reference[i * channels + channel]);
                let d = f64::from(decoded[(i + delay) * channels + channel]);
                rd += r * d;
                rr += r * r;
                dd += d * d;
            });
            let corr = rd / (rr * dd).sqrt().max(1e-15);
            if corr > best_corr {
                best_corr = corr;
                best_delay = delay;
            }
        });

        let mut err = 0.0_f64;
        let mut rr = 0.0_f64;
        let mut dd = 0.0_f64;
        (skip..skip + len).into_iter().for_each(|i| {
            let r = f64::from(reference[i * channels + channel]);
            let d = f64::from(decoded[(i + best_delay) * channels + channel]);
            err += (r - d) * (r - d);
            rr += r * r;
            dd += d * d;
        });
        let snr = 10.0 * (rr / err.max(1e-15)).log10();
        (best_corr, snr, dd / rr.max(1e-15))
    }

    /// Reads the transient flag out of a packet's header fields.
    fn parse_transient(packet: &[u8]) -> bool {
        let total_bits = (packet.len() * 8) as u32;
        let mut dec = RangeDecoder::new(packet);
        if dec.decode_bit_logp(15) {
            return false;
        }
        if dec.tell() + 16 <= total_bits && dec.decode_bit_logp(1) {
            let octave = dec.decode_uint(6);
            dec.decode_bits(4 + octave);
            dec.decode_bits(3);
            if dec.tell() + 2 <= total_bits {
                dec.decode_icdf(&crate::celt::tables::TAPSET_ICDF, 2);
            }
        }
        dec.tell() + 3 <= total_bits && dec.decode_bit_logp(3)
    }

    #[test]
    fn test_sine_round_trip() {
        // 20 ms mono frames at 64 kb/s on a 440 Hz tone.
        let signal = sine(440.0, 0.5, 14 * FRAME);
        let (decoded, sizes) = round_trip(&signal, Channels::Mono, FRAME, 64_000);

        sizes.iter().for_each(|&len| assert!(len <= 160));
        let (corr, snr, ratio) =
            aligned_metrics(&signal, &decoded, 1, 0, 2 * FRAME, 2000);
        assert!(corr >= 0.995, "correlation {}", corr);
        assert!(snr >= 22.5, "snr {} dB", snr);
        assert!(ratio >= 0.20, "energy ratio {}", ratio);
    }

    #[test]
    fn test_tone_peak_level() {
        let signal = sine(1000.0, 0.5, 14 * FRAME);
        let (decoded, _) = round_trip(&signal, Channels::Mono, FRAME, 64_000);

        let peak = decoded[4 * FRAME..]
            .iter()
            .fold(0.0_f32, |acc, v| acc.max(v.abs()));
        // Within half a dB of the input peak.
        assert!(peak >= 0.5 * 0.944 && peak <= 0.5 * 1.06, "peak {}", peak);
    }

    #[test]
    fn test_dual_tone_stereo_round_trip() {
        // 440 Hz left, 880 Hz right at 128 kb/s.
        let left = sine(440.0, 0.5, 14 * FRAME);
        let right = sine(880.0, 0.5, 14 * FRAME);
        let mut signal = vec![0_f32; 2 * left.len()];
        (0..left.len()).into_iter().for_each(|i| {
            signal[2 * i] = left[i];
            signal[2 * i + 1] = right[i];
        });

        let (decoded, _) = round_trip(&signal, Channels::Stereo, FRAME, 128_000);

        (0..2).into_iter().for_each(|channel| {
            let (corr, snr, _) =
                aligned_metrics(&signal, &decoded, 2, channel, 2 * FRAME, 2000);
            assert!(corr >= 0.995, "channel {} correlation {}", channel, corr);
            assert!(snr >= 24.0, "channel {} snr {} dB", channel, snr);
        });
    }

    #[test]
    fn test_silence() {
        let signal = vec![0_f32; 4 * FRAME];
        let ch = Channels::Mono;
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: ch,
            bitrate: 64_000,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: ch,
            gain: 0,
        })
        .unwrap();

        let mut packet = [0_u8; 1500];
        let mut out = vec![0_f32; FRAME];
        let mut energy = 0.0_f32;
        signal.chunks_exact(FRAME).for_each(|frame| {
            let len = encoder.encode_float(frame, FRAME, &mut packet).unwrap();
            decoder
                .decode_float(Some(&packet[..len]), &mut out, FRAME)
                .unwrap();
            energy = out.iter().map(|v| v * v).sum();
        });

        assert!(energy < 1e-6, "silence energy {}", energy);
        decoder
            .celt()
            .energy_history()
            .iter()
            .for_each(|&e| assert_eq!(e, -28.0));
    }

    #[test]
    fn test_impulse_is_a_transient() {
        // One impulse in the middle of an otherwise near-silent stream.
        let mut rng = nanorand::WyRand::new_seed(3001);
        let mut signal = vec![0_f32; 6 * FRAME];
        signal.iter_mut().for_each(|v| {
            *v = (rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0) * 1e-4;
        });
        signal[2 * FRAME + 320] = 0.9;

        let ch = Channels::Mono;
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: ch,
            bitrate: 48_000,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: ch,
            gain: 0,
        })
        .unwrap();

        let mut packet = [0_u8; 1500];
        let mut out = vec![0_f32; FRAME];
        let mut decoded = Vec::new();
        let mut transient_flags = Vec::new();
        signal.chunks_exact(FRAME).for_each(|frame| {
            let len = encoder.encode_float(frame, FRAME, &mut packet).unwrap();
            transient_flags.push(parse_transient(&packet[..len]));
            decoder
                .decode_float(Some(&packet[..len]), &mut out, FRAME)
                .unwrap();
            decoded.extend_from_slice(&out);
        });

        assert!(transient_flags[2], "impulse frame not flagged transient");

        let (corr, snr, _) = aligned_metrics(&signal, &decoded, 1, 0, FRAME, 2000);
        assert!(corr >= 0.879, "correlation {}", corr);
        assert!(snr >= 6.0, "snr {} dB", snr);
    }

    #[test]
    fn test_noise_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(777);
        let signal: Vec<f32> = (0..12 * FRAME)
            .into_iter()
            .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 2000.0 - 0.5)
            .collect();

        let (decoded, _) = round_trip(&signal, Channels::Mono, FRAME, 32_000);
        let (corr, _, ratio) = aligned_metrics(&signal, &decoded, 1, 0, 2 * FRAME, 2000);
        assert!(corr >= 0.55, "correlation {}", corr);
        assert!(ratio >= 0.08, "energy ratio {}", ratio);
    }

    #[test]
    fn test_packet_loss_concealment() {
        let signal = sine(1000.0, 0.5, 5 * FRAME);
        let ch = Channels::Mono;
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: ch,
            bitrate: 64_000,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: ch,
            gain: 0,
        })
        .unwrap();

        let mut packet = [0_u8; 1500];
        let mut out = vec![0_f32; FRAME];
        let mut energies = Vec::new();
        signal
            .chunks_exact(FRAME)
            .enumerate()
            .for_each(|(index, frame)| {
                let len = encoder.encode_float(frame, FRAME, &mut packet).unwrap();
                let lost = index == 3;
                let payload = if lost { None } else { Some(&packet[..len]) };
                decoder.decode_float(payload, &mut out, FRAME).unwrap();
                out.iter().for_each(|v| {
                    assert!(v.is_finite());
                    assert!(v.abs() <= 1.0, "concealment overshot: {}", v);
                });
                energies.push(out.iter().map(|v| v * v).sum::<f32>());
            });

        // The concealed frame keeps at least half the energy of its
        // neighbours.
        let concealed = energies[3];
        let neighbours = 0.5 * (energies[2] + energies[4]);
        assert!(
            concealed >= 0.5 * neighbours,
            "concealed energy {} vs neighbours {}",
            concealed,
            neighbours
        );
    }

    #[test]
    fn test_every_frame_size_round_trips() {
        [120_usize, 240, 480, 960].iter().for_each(|&frame_size| {
            let signal = sine(440.0, 0.4, 20 * frame_size);
            let (decoded, _) = round_trip(&signal, Channels::Mono, frame_size, 64_000);
            decoded.iter().for_each(|v| assert!(v.is_finite()));
            let energy: f64 = decoded[4 * frame_size..]
                .iter()
                .map(|&v| f64::from(v) * f64::from(v))
                .sum();
            assert!(energy > 1.0, "frame size {} lost the signal", frame_size);
        });
    }

    #[test]
    fn test_narrowband_round_trip() {
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: Channels::Mono,
            bitrate: 48_000,
            bandwidth: crate::Bandwidth::Narrowband,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: Channels::Mono,
            gain: 0,
        })
        .unwrap();
        // The bandwidth is agreed out of band, like the outer layer's TOC
        // would.
        decoder.set_bandwidth(crate::Bandwidth::Narrowband);

        let signal = sine(1000.0, 0.5, 10 * FRAME);
        let mut packet = [0_u8; 1500];
        let mut out = vec![0_f32; FRAME];
        let mut decoded = Vec::new();
        signal.chunks_exact(FRAME).for_each(|frame| {
            let len = encoder.encode_float(frame, FRAME, &mut packet).unwrap();
            decoder
                .decode_float(Some(&packet[..len]), &mut out, FRAME)
                .unwrap();
            assert_eq!(encoder.final_range(), decoder.final_range());
            decoded.extend_from_slice(&out);
        });

        let (corr, _, _) = aligned_metrics(&signal, &decoded, 1, 0, 2 * FRAME, 2000);
        assert!(corr > 0.9, "narrowband correlation {}", corr);
    }

    #[test]
    fn test_hybrid_start_band_round_trip() {
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: Channels::Mono,
            bitrate: 48_000,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        encoder.set_hybrid(true);
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: Channels::Mono,
            gain: 0,
        })
        .unwrap();
        decoder.set_hybrid(true);

        // Wideband noise so the high bands have something to code.
        let mut rng = nanorand::WyRand::new_seed(555);
        let signal: Vec<f32> = (0..8 * FRAME)
            .into_iter()
            .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 2000.0 - 0.5)
            .collect();

        let mut packet = [0_u8; 1500];
        let mut out = vec![0_f32; FRAME];
        signal.chunks_exact(FRAME).for_each(|frame| {
            let len = encoder.encode_float(frame, FRAME, &mut packet).unwrap();
            decoder
                .decode_float(Some(&packet[..len]), &mut out, FRAME)
                .unwrap();
            assert_eq!(encoder.final_range(), decoder.final_range());
            out.iter().for_each(|v| assert!(v.is_finite()));
        });
    }

    #[test]
    fn test_long_loss_fades_to_noise() {
        let signal = sine(500.0, 0.5, 3 * FRAME);
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: Channels::Mono,
            bitrate: 64_000,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: Channels::Mono,
            gain: 0,
        })
        .unwrap();

        let mut packet = [0_u8; 1500];
        let mut out = vec![0_f32; FRAME];
        signal.chunks_exact(FRAME).for_each(|frame| {
            let len = encoder.encode_float(frame, FRAME, &mut packet).unwrap();
            decoder
                .decode_float(Some(&packet[..len]), &mut out, FRAME)
                .unwrap();
        });

        // Conceal a long burst of losses: the output must stay bounded and
        // its energy must decay towards nothing.
        let mut energies = Vec::new();
        (0..12).into_iter().for_each(|_| {
            decoder.decode_float(None, &mut out, FRAME).unwrap();
            out.iter().for_each(|v| {
                assert!(v.is_finite());
                assert!(v.abs() <= 1.5, "runaway concealment: {}", v);
            });
            energies.push(out.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>());
        });
        assert!(
            energies[11] < 0.05 * energies[0].max(1e-9),
            "concealment did not decay: {} vs {}",
            energies[11],
            energies[0]
        );
    }

    #[test]
    fn test_mono_packet_into_stereo_decoder() {
        let signal = sine(440.0, 0.5, 6 * FRAME);
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: Channels::Mono,
            bitrate: 64_000,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: Channels::Stereo,
            gain: 0,
        })
        .unwrap();
        decoder.set_stream_channels(Channels::Mono);

        let mut packet = [0_u8; 1500];
        let mut out = vec![0_f32; 2 * FRAME];
        signal.chunks_exact(FRAME).for_each(|frame| {
            let len = encoder.encode_float(frame, FRAME, &mut packet).unwrap();
            decoder
                .decode_float(Some(&packet[..len]), &mut out, FRAME)
                .unwrap();
            // Both channels carry the duplicated mono signal.
            (0..FRAME).into_iter().for_each(|i| {
                assert_eq!(out[2 * i], out[2 * i + 1]);
            });
        });
    }

    #[test]
    fn test_empty_packet_runs_concealment() {
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: Channels::Mono,
            gain: 0,
        })
        .unwrap();
        let mut out = vec![0_f32; FRAME];
        assert_eq!(decoder.decode_float(None, &mut out, FRAME).unwrap(), FRAME);
        out.iter().for_each(|v| assert!(v.is_finite()));
    }

    #[test]
    fn test_invalid_frame_size_is_rejected() {
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: Channels::Mono,
            gain: 0,
        })
        .unwrap();
        let mut out = vec![0_f32; 1024];
        assert!(matches!(
            decoder.decode_float(None, &mut out, 1000),
            Err(DecoderError::InvalidFrameSize)
        ));
    }

    #[test]
    fn test_decode_to_i16() {
        let signal = sine(440.0, 0.5, 4 * FRAME);
        let mut encoder = Encoder::new(&EncoderConfiguration {
            channels: Channels::Mono,
            bitrate: 64_000,
            ..EncoderConfiguration::default()
        })
        .unwrap();
        let mut decoder = Decoder::new(&DecoderConfiguration {
            channels: Channels::Mono,
            gain: 0,
        })
        .unwrap();

        let mut packet = [0_u8; 1500];
        let mut out = vec![0_i16; FRAME];
        signal.chunks_exact(FRAME).for_each(|frame| {
            let len = encoder.encode_float(frame, FRAME, &mut packet).unwrap();
            decoder
                .decode(Some(&packet[..len]), &mut out, FRAME)
                .unwrap();
        });
        let peak = out.iter().map(|v| v.unsigned_abs()).max().unwrap();
        assert!(peak > 8000, "i16 peak {}", peak);
    }
}
