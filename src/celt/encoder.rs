//! Implements the CELT encoder.

use log::debug;

use crate::celt::bands::{
    compute_band_energies, normalise_bands, quant_all_bands, tf_code,
};
use crate::celt::comb_filter::comb_filter;
use crate::celt::mode::{compute_caps, Mode};
use crate::celt::pitch::{pitch_downsample, pitch_search, remove_doubling, signal_energy};
use crate::celt::quant_energy::{
    amp2_log2, quant_coarse_energy, quant_energy_finalise, quant_fine_energy,
};
use crate::celt::rate::{code_dynalloc, compute_allocation};
use crate::celt::tables::{
    band_width, EBANDS, PREEMPHASIS, SPREAD_ICDF, TAPSET_ICDF, TRIM_ICDF,
};
use crate::celt::{
    frame_size_to_lm, Coder, COMB_MAX_PERIOD, COMB_MIN_PERIOD, NB_BANDS, OVERLAP,
    SHORT_MDCT_SIZE, SIG_SCALE, SPREAD_AGGRESSIVE, SPREAD_LIGHT, SPREAD_NONE, SPREAD_NORMAL,
};
use crate::encoder_error::EncoderError;
use crate::math::ilog;
use crate::range_coder::{RangeEncoder, Tell, BITRES};
use crate::{Bandwidth, Channels};

/// Hard ceiling on the packet size, in bytes.
const MAX_PACKET_BYTES: usize = 1275;

/// Bitrates (in kb/s) above which intensity stereo moves up one band.
const INTENSITY_THRESHOLDS: [f32; NB_BANDS] = [
    1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 16.0, 24.0, 36.0, 44.0, 50.0, 56.0, 62.0, 67.0,
    72.0, 79.0, 88.0, 106.0, 134.0,
];
const INTENSITY_HYSTERESIS: [f32; NB_BANDS] = [
    1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0, 2.0, 2.0, 3.0, 3.0, 4.0, 5.0,
    6.0, 8.0, 8.0,
];

/// The CELT encoder.
///
/// Mirrors the decoder's per-frame recipe; every flag written here is read
/// in the same order on the other side.
pub(crate) struct CeltEncoder {
    mode: Mode,
    channels: usize,
    stream_channels: usize,
    start_band: usize,
    end_band: usize,

    bitrate: u32,
    vbr: bool,
    complexity: u32,
    packet_loss: i32,
    lfe: bool,
    force_intra: bool,

    /// Trailing `OVERLAP` input samples per channel, the MDCT look-back.
    in_mem: Vec<f32>,
    /// Unfiltered pre-emphasized history the pitch search runs on.
    prefilter_mem: Vec<f32>,
    preemph_mem: [f32; 2],

    old_ebands: Vec<f32>,
    old_log_e: Vec<f32>,
    old_log_e2: Vec<f32>,
    delayed_intra: f32,

    prefilter_period: usize,
    prefilter_gain: f32,
    prefilter_tapset: usize,

    spread_average: i32,
    spread_decision: usize,
    hf_average: i32,
    tapset_decision: usize,
    intensity: usize,

    consec_transient: i32,
    last_coded_bands: usize,
    vbr_reservoir: i32,

    rng: u32,
    final_range: u32,
}

impl CeltEncoder {
    /// Creates a new CELT encoder for the given channel count.
    pub(crate) fn new(channels: Channels) -> Result<Self, EncoderError> {
        let channels = channels as usize;
        let mut encoder = Self {
            mode: Mode::new(),
            channels,
            stream_channels: channels,
            start_band: 0,
            end_band: NB_BANDS,
            bitrate: 64000,
            vbr: false,
            complexity: 5,
            packet_loss: 0,
            lfe: false,
            force_intra: false,
            in_mem: vec![0.0; channels * OVERLAP],
            prefilter_mem: vec![0.0; channels * COMB_MAX_PERIOD],
            preemph_mem: [0.0; 2],
            old_ebands: vec![0.0; 2 * NB_BANDS],
            old_log_e: vec![0.0; 2 * NB_BANDS],
            old_log_e2: vec![0.0; 2 * NB_BANDS],
            delayed_intra: 1.0,
            prefilter_period: 0,
            prefilter_gain: 0.0,
            prefilter_tapset: 0,
            spread_average: 256,
            spread_decision: SPREAD_NORMAL,
            hf_average: 0,
            tapset_decision: 0,
            intensity: 0,
            consec_transient: 0,
            last_coded_bands: 0,
            vbr_reservoir: 0,
            rng: 0,
            final_range: 0,
        };
        encoder.reset();
        Ok(encoder)
    }

    /// Resets the encoder to its deterministic initial state.
    pub(crate) fn reset(&mut self) {
        self.in_mem.iter_mut().for_each(|v| *v = 0.0);
        self.prefilter_mem.iter_mut().for_each(|v| *v = 0.0);
        self.preemph_mem = [0.0; 2];
        self.old_ebands.iter_mut().for_each(|v| *v = 0.0);
        self.old_log_e.iter_mut().for_each(|v| *v = -28.0);
        self.old_log_e2.iter_mut().for_each(|v| *v = -28.0);
        self.delayed_intra = 1.0;
        self.prefilter_period = 0;
        self.prefilter_gain = 0.0;
        self.prefilter_tapset = 0;
        self.spread_average = 256;
        self.spread_decision = SPREAD_NORMAL;
        self.hf_average = 0;
        self.tapset_decision = 0;
        self.intensity = 0;
        self.consec_transient = 0;
        self.last_coded_bands = 0;
        self.vbr_reservoir = 0;
        self.rng = 0;
    }

    /// Target rate in bits per second. Zero means "fill the buffer".
    pub(crate) fn set_bitrate(&mut self, bitrate: u32) {
        self.bitrate = bitrate;
    }

    /// Variable bitrate on or off.
    pub(crate) fn set_vbr(&mut self, vbr: bool) {
        self.vbr = vbr;
    }

    /// Search effort, 0..10. Only ever changes the encoder's choices.
    pub(crate) fn set_complexity(&mut self, complexity: u32) {
        self.complexity = u32::min(complexity, 10);
    }

    /// Expected packet loss in percent; shifts decisions towards robustness.
    pub(crate) fn set_packet_loss(&mut self, loss: i32) {
        self.packet_loss = i32::max(0, i32::min(loss, 100));
    }

    /// Low-frequency-effects mode.
    pub(crate) fn set_lfe(&mut self, lfe: bool) {
        self.lfe = lfe;
    }

    /// Forces energy coding without inter-frame prediction.
    pub(crate) fn set_force_intra(&mut self, force: bool) {
        self.force_intra = force;
    }

    /// Limits the coded bands to the signal bandwidth.
    pub(crate) fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.end_band = crate::celt::decoder::bandwidth_to_end_band(bandwidth);
    }

    /// First coded band; 17 when running above another codec.
    pub(crate) fn set_start_band(&mut self, start_band: usize) {
        self.start_band = usize::min(start_band, NB_BANDS - 1);
    }

    /// Channel count coded into the packets.
    pub(crate) fn set_stream_channels(&mut self, channels: Channels) {
        self.stream_channels = usize::min(channels as usize, self.channels);
    }

    /// The range coder state after the last encoded frame.
    pub(crate) fn final_range(&self) -> u32 {
        self.final_range
    }

    /// Encodes one frame of `frame_size * channels` interleaved samples.
    ///
    /// Returns the number of bytes written to `out`.
    #[allow(clippy::too_many_lines)]
    pub(crate) fn encode(
        &mut self,
        pcm: &[f32],
        frame_size: usize,
        out: &mut [u8],
    ) -> Result<usize, EncoderError> {
        let lm = frame_size_to_lm(frame_size).ok_or(EncoderError::InvalidFrameSize)?;
        let cc = self.channels;
        let channels = self.stream_channels;
        if pcm.len() < frame_size * cc {
            return Err(EncoderError::InvalidInputSize);
        }
        if out.len() < 2 {
            return Err(EncoderError::BufferTooSmall);
        }

        let n = frame_size;
        let m = 1 << lm;
        let start = self.start_band;
        let end = usize::max(self.end_band, start + 1);

        // Packet sizing: CBR derives it from the rate, VBR treats it as a
        // ceiling and shrinks after the fact.
        let mut nb_compressed_bytes = if self.bitrate == 0 {
            out.len()
        } else {
            let target = (self.bitrate as usize * n) / (48_000 * 8);
            usize::min(out.len(), usize::max(2, target))
        };
        nb_compressed_bytes = usize::min(nb_compressed_bytes, MAX_PACKET_BYTES);
        if self.vbr {
            // Leave headroom for the VBR boost up to the buffer limit.
            nb_compressed_bytes =
                usize::min(out.len().min(MAX_PACKET_BYTES), nb_compressed_bytes * 3 / 2 + 2);
        }
        let mut nb_available_bytes = nb_compressed_bytes as i32;

        // Pre-emphasis into the signal-scale working buffer.
        let frame_len = n + OVERLAP;
        let mut input = vec![0_f32; cc * frame_len];
        (0..cc).into_iter().for_each(|c| {
            let mut mem = self.preemph_mem[c];
            (0..n).into_iter().for_each(|i| {
                let x = pcm[cc * i + c] * SIG_SCALE;
                input[c * frame_len + OVERLAP + i] = x - mem;
                mem = PREEMPHASIS * x;
            });
            self.preemph_mem[c] = mem;
        });

        let silence = pcm[..n * cc].iter().all(|v| *v == 0.0);

        let buffer = &mut out[..nb_compressed_bytes];
        let mut enc = RangeEncoder::new(buffer);

        let tell = enc.tell();
        if tell == 1 {
            enc.encode_bit_logp(u32::from(silence), 15)?;
        }
        if silence {
            // There is no need to send more than the minimum in VBR mode;
            // either way both sides treat the rest of the frame as spent.
            if self.vbr {
                nb_compressed_bytes = usize::min(nb_compressed_bytes, 2);
                enc.shrink(nb_compressed_bytes);
            }
            nb_available_bytes = 2;
            enc.skip_to_end((nb_compressed_bytes * 8) as u32);
        }
        let total_bits = (nb_compressed_bytes * 8) as u32;

        // Pitch prefilter: search, quantize, filter, and code the block.
        let enabled = start == 0
            && !self.lfe
            && !silence
            && nb_available_bytes > 12 * channels as i32
            && self.complexity >= 5;
        let (pf_on, pitch_index, gain, qg) =
            self.run_prefilter(&mut input, n, enabled, nb_available_bytes)?;
        let _ = gain;
        if start == 0 && enc.tell() + 16 <= total_bits && !silence {
            enc.encode_bit_logp(u32::from(pf_on), 1)?;
            if pf_on {
                let octave = (ilog(pitch_index as u32 + 1) as i32 - 5).max(0) as u32;
                enc.encode_uint(octave, 6)?;
                enc.encode_bits(
                    (pitch_index - (16 << octave) + 1) as u32,
                    4 + octave,
                )?;
                enc.encode_bits(qg as u32, 3)?;
                enc.encode_icdf(self.prefilter_tapset, &TAPSET_ICDF, 2)?;
            }
        }

        // Transient decision.
        let mut is_transient = false;
        let mut tf_estimate = 0.0_f32;
        if self.complexity >= 1 && lm > 0 && !silence && !self.lfe {
            let analysis = transient_analysis(&input, frame_len, cc);
            is_transient = analysis.0;
            tf_estimate = analysis.1;
        }
        if lm > 0 && enc.tell() + 3 <= total_bits {
            enc.encode_bit_logp(u32::from(is_transient), 3)?;
        } else {
            is_transient = false;
        }
        let short_blocks = is_transient;

        // MDCT analysis and band energies. The per-channel spectrum covers
        // the full frame; the bins above the last band stay zero.
        let bins = n;
        let mut freq = vec![0_f32; cc * bins];
        self.compute_mdcts(&input, &mut freq, n, lm, short_blocks, cc);
        if cc == 2 && channels == 1 {
            let (left, right) = freq.split_at_mut(bins);
            left.iter_mut().zip(right.iter()).for_each(|(l, &r)| {
                *l = 0.5 * *l + 0.5 * r;
            });
        }

        let mut band_e = vec![0_f32; 2 * NB_BANDS];
        compute_band_energies(&freq, &mut band_e, end, lm, channels, bins);
        let mut band_log_e = vec![0_f32; 2 * NB_BANDS];
        amp2_log2(end, end, &band_e, &mut band_log_e, channels);
        if self.lfe {
            // Everything above the first bands is noise floor for LFE.
            (2..end).into_iter().for_each(|i| {
                (0..channels).into_iter().for_each(|c| {
                    band_log_e[i + c * NB_BANDS] =
                        f32::min(band_log_e[i + c * NB_BANDS], -10.0);
                });
            });
        }

        let mut x = vec![0_f32; channels * bins];
        normalise_bands(&freq, &mut x, &band_e, end, lm, channels, bins);

        // Time-frequency resolution per band; below complexity 2 every band
        // simply follows the transient flag.
        let mut tf_res = [0_i32; NB_BANDS];
        if self.complexity >= 2 && !self.lfe && !silence {
            tf_analysis(&x, start, end, lm, is_transient, &mut tf_res);
        } else {
            (start..end).into_iter().for_each(|i| {
                tf_res[i] = i32::from(is_transient);
            });
        }
        let tf_select = 0;

        // Coarse energy with the two-pass intra trial.
        let two_pass = self.complexity >= 1;
        let mut error = vec![0_f32; 2 * NB_BANDS];
        let intra = quant_coarse_energy(
            start,
            end,
            end,
            &band_log_e,
            &mut self.old_ebands,
            total_bits,
            &mut error,
            &mut enc,
            channels,
            lm,
            nb_available_bytes,
            self.force_intra,
            &mut self.delayed_intra,
            two_pass,
            self.packet_loss,
            self.lfe,
        )?;

        {
            let mut coder = Coder::Encode(&mut enc);
            tf_code(
                &mut coder,
                start,
                end,
                is_transient,
                &mut tf_res,
                lm,
                tf_select,
                total_bits,
            )?;
        }

        // Spread decision, with hysteresis carried across frames.
        if enc.tell() + 4 <= total_bits {
            if self.lfe {
                self.spread_decision = SPREAD_NONE;
            } else if !silence && self.complexity >= 3 && m * band_width(end - 1) > 8 {
                self.spread_decision = spreading_decision(
                    &x,
                    channels,
                    bins,
                    end,
                    lm,
                    &mut self.spread_average,
                    self.spread_decision,
                    &mut self.hf_average,
                    &mut self.tapset_decision,
                );
            }
            enc.encode_icdf(self.spread_decision, &SPREAD_ICDF, 5)?;
        }

        let caps = compute_caps(lm, channels);
        let total_bits_q3 = (total_bits as i32) << BITRES;

        // Dynalloc boosts for bands that stick out of the spectral envelope.
        let mut offsets = if self.complexity >= 2 && !self.lfe && !silence {
            dynalloc_analysis(&band_log_e, channels, start, end)
        } else {
            [0_i32; NB_BANDS]
        };
        let total_boost;
        {
            let mut coder = Coder::Encode(&mut enc);
            total_boost = code_dynalloc(
                &mut coder,
                start,
                end,
                lm,
                channels,
                &caps,
                total_bits_q3,
                &mut offsets,
            )?;
        }

        // Allocation trim.
        let mut alloc_trim = 5_i32;
        if enc.tell_frac() as i32 + (6 << BITRES) <= total_bits_q3 - total_boost {
            alloc_trim = if self.lfe {
                5
            } else {
                alloc_trim_analysis(&band_log_e, channels, end, tf_estimate)
            };
            enc.encode_icdf(alloc_trim as usize, &TRIM_ICDF, 7)?;
        }

        // Stereo decisions.
        let mut dual_stereo = false;
        if channels == 2 {
            let equiv_kbps = (nb_compressed_bytes * 8 * 48_000 / n) as f32 / 1000.0;
            self.intensity = hysteresis_decision(
                equiv_kbps,
                &INTENSITY_THRESHOLDS,
                &INTENSITY_HYSTERESIS,
                self.intensity,
            );
            self.intensity = usize::min(end, usize::max(start, self.intensity));
            dual_stereo = stereo_analysis(&x, &x[bins..], lm);
        }

        // VBR: spend more bytes on transients and busy frames, fewer on
        // easy ones, bounded by a small reservoir.
        if self.vbr && self.bitrate > 0 && !silence {
            let base_bits = (self.bitrate as i32 * n as i32) / 48_000;
            let mut target = base_bits as f32;
            target *= 1.0 + 0.35 * tf_estimate;
            if is_transient {
                target *= 1.1;
            }
            let mut target_bytes = (target as i32 + self.vbr_reservoir / 8) / 8;
            // Never shrink below the bits already spent plus the boosts and
            // a margin, or the decoder's budget checks would come out
            // differently from the encoder's.
            target_bytes = target_bytes
                .max((enc.tell() as i32 + (total_boost >> 3) + 40 + 7) / 8)
                .max(2)
                .min(nb_compressed_bytes as i32);
            self.vbr_reservoir += base_bits - 8 * target_bytes;
            self.vbr_reservoir = self.vbr_reservoir.clamp(-8 * base_bits, 8 * base_bits);
            if (target_bytes as usize) < nb_compressed_bytes {
                nb_compressed_bytes = target_bytes as usize;
                enc.shrink(nb_compressed_bytes);
            }
        }
        let total_bits = (nb_compressed_bytes * 8) as u32;
        let total_bits_q3 = (total_bits as i32) << BITRES;

        // Anti-collapse reservation and the allocation proper.
        let mut bits = total_bits_q3 - enc.tell_frac() as i32 - 1;
        let anti_collapse_rsv =
            if is_transient && lm >= 2 && bits >= ((lm as i32) + 2) << BITRES {
                1 << BITRES
            } else {
                0
            };
        bits -= anti_collapse_rsv;

        let signal_bandwidth = if self.lfe { 1 } else { end - 1 };
        let alloc;
        {
            let mut coder = Coder::Encode(&mut enc);
            alloc = compute_allocation(
                start,
                end,
                &offsets,
                &caps,
                alloc_trim,
                self.intensity,
                dual_stereo,
                bits,
                channels,
                lm,
                &mut coder,
                self.last_coded_bands,
                signal_bandwidth,
            )?;
        }
        if self.last_coded_bands != 0 {
            self.last_coded_bands =
                usize::min(self.last_coded_bands + 1, usize::max(self.last_coded_bands - 1, alloc.coded_bands));
        } else {
            self.last_coded_bands = alloc.coded_bands;
        }

        quant_fine_energy(
            start,
            end,
            &mut self.old_ebands,
            &mut error,
            &alloc.fine_bits,
            &mut enc,
            channels,
        )?;

        // Shape quantization over the shared coder.
        let mut collapse_masks = vec![0_u8; channels * NB_BANDS];
        {
            let (x0, rest) = x.split_at_mut(bins);
            let mut coder = Coder::Encode(&mut enc);
            self.rng = quant_all_bands(
                &mut coder,
                &self.mode,
                start,
                end,
                x0,
                if channels == 2 { Some(rest) } else { None },
                &mut collapse_masks,
                &band_e,
                &alloc.pulses,
                short_blocks,
                self.spread_decision,
                alloc.dual_stereo,
                alloc.intensity,
                &tf_res,
                total_bits_q3 - anti_collapse_rsv,
                alloc.balance,
                lm,
                alloc.coded_bands,
                self.rng,
                false,
            )?;
        }

        if anti_collapse_rsv > 0 {
            let anti_collapse_on = self.consec_transient < 2;
            enc.encode_bits(u32::from(anti_collapse_on), 1)?;
        }

        let bits_left = total_bits as i32 - enc.tell() as i32;
        quant_energy_finalise(
            start,
            end,
            &mut self.old_ebands,
            &mut error,
            &alloc.fine_bits,
            &alloc.fine_priority,
            bits_left,
            &mut enc,
            channels,
        )?;

        if silence {
            self.old_ebands.iter_mut().for_each(|v| *v = -28.0);
        }

        // Roll the energy history exactly like the decoder.
        if channels == 1 {
            let (left, right) = self.old_ebands.split_at_mut(NB_BANDS);
            right.copy_from_slice(left);
        }
        if !is_transient {
            self.old_log_e2.copy_from_slice(&self.old_log_e);
            self.old_log_e.copy_from_slice(&self.old_ebands);
        } else {
            (0..2 * NB_BANDS).into_iter().for_each(|i| {
                self.old_log_e[i] = f32::min(self.old_log_e[i], self.old_ebands[i]);
            });
        }
        (0..2_usize).into_iter().for_each(|c| {
            (0..start).chain(end..NB_BANDS).for_each(|i| {
                self.old_ebands[c * NB_BANDS + i] = 0.0;
                self.old_log_e[c * NB_BANDS + i] = -28.0;
                self.old_log_e2[c * NB_BANDS + i] = -28.0;
            });
        });

        if is_transient {
            self.consec_transient += 1;
        } else {
            self.consec_transient = 0;
        }

        enc.done()?;
        self.rng = enc.range();
        self.final_range = enc.range();
        if enc.tell() > total_bits {
            debug!("celt: frame busted its budget by {} bits", enc.tell() - total_bits);
        }

        Ok(nb_compressed_bytes)
    }

    /// Windowed forward MDCTs for all channels and short blocks.
    fn compute_mdcts(
        &self,
        input: &[f32],
        freq: &mut [f32],
        n: usize,
        lm: usize,
        short_blocks: bool,
        cc: usize,
    ) {
        let frame_len = n + OVERLAP;
        let bins = n;
        let (blocks, nb, shift) = if short_blocks {
            (1 << lm, SHORT_MDCT_SIZE, 3)
        } else {
            (1, SHORT_MDCT_SIZE << lm, 3 - lm)
        };

        (0..cc).into_iter().for_each(|c| {
            let channel = &input[c * frame_len..(c + 1) * frame_len];
            (0..blocks).into_iter().for_each(|b| {
                self.mode.mdct().forward(
                    shift,
                    &channel[b * nb..],
                    freq,
                    c * bins + b,
                    blocks,
                    self.mode.window(),
                );
            });
        });
    }

    /// Pitch search and prefilter application.
    ///
    /// On return the working buffer holds `[carried overlap][filtered
    /// frame]` per channel and the raw history has been rolled forward.
    fn run_prefilter(
        &mut self,
        input: &mut [f32],
        n: usize,
        enabled: bool,
        nb_available_bytes: i32,
    ) -> Result<(bool, usize, f32, i32), EncoderError> {
        let cc = self.channels;
        let frame_len = n + OVERLAP;

        // Assemble history + current frame at signal scale.
        let pre_len = COMB_MAX_PERIOD + n;
        let mut pre = vec![0_f32; cc * pre_len];
        (0..cc).into_iter().for_each(|c| {
            pre[c * pre_len..c * pre_len + COMB_MAX_PERIOD]
                .copy_from_slice(&self.prefilter_mem[c * COMB_MAX_PERIOD..(c + 1) * COMB_MAX_PERIOD]);
            (0..n).into_iter().for_each(|i| {
                pre[c * pre_len + COMB_MAX_PERIOD + i] = input[c * frame_len + OVERLAP + i];
            });
        });

        let mut gain = 0.0_f32;
        let mut pitch_index = COMB_MIN_PERIOD;
        if enabled {
            let channels: Vec<&[f32]> = (0..cc)
                .into_iter()
                .map(|c| &pre[c * pre_len..(c + 1) * pre_len])
                .collect();
            let mut pitch_buf = vec![0_f32; pre_len >> 1];
            pitch_downsample(&channels, &mut pitch_buf);
            let found = pitch_search(
                &pitch_buf[COMB_MAX_PERIOD >> 1..],
                &pitch_buf,
                n,
                COMB_MAX_PERIOD - 3 * COMB_MIN_PERIOD,
            );
            pitch_index = COMB_MAX_PERIOD - found;

            let mut t0 = pitch_index;
            let g = remove_doubling(
                &pitch_buf,
                COMB_MAX_PERIOD,
                COMB_MIN_PERIOD,
                n,
                &mut t0,
                self.prefilter_period,
                self.prefilter_gain,
            );
            pitch_index = t0.min(COMB_MAX_PERIOD - 2);
            gain = 0.7 * g;
            if self.packet_loss > 2 {
                gain *= 0.5;
            }
            if self.packet_loss > 4 {
                gain *= 0.5;
            }
            if self.packet_loss > 8 {
                gain = 0.0;
            }
        }

        // Threshold with rate and continuity adjustments.
        let mut pf_threshold = 0.2_f32;
        if (pitch_index as i32 - self.prefilter_period as i32).abs() * 10 > pitch_index as i32 {
            pf_threshold += 0.2;
        }
        if nb_available_bytes < 25 {
            pf_threshold += 0.1;
        }
        if nb_available_bytes < 35 {
            pf_threshold += 0.1;
        }
        if self.prefilter_gain > 0.4 {
            pf_threshold -= 0.1;
        }
        if self.prefilter_gain > 0.55 {
            pf_threshold -= 0.1;
        }
        pf_threshold = f32::max(pf_threshold, 0.2);

        let (pf_on, qg) = if gain < pf_threshold {
            gain = 0.0;
            (false, 0)
        } else {
            if (gain - self.prefilter_gain).abs() < 0.1 {
                gain = self.prefilter_gain;
            }
            let mut qg = ((0.5 + gain * 32.0 / 3.0).floor() as i32) - 1;
            qg = qg.clamp(0, 7);
            gain = 0.09375 * (qg + 1) as f32;
            (true, qg)
        };

        // Filter the frame, cross-fading from last frame's parameters, and
        // cancel the pitch if filtering raised the energy.
        let period_old = usize::max(self.prefilter_period, COMB_MIN_PERIOD);
        (0..cc).into_iter().for_each(|c| {
            input[c * frame_len..c * frame_len + OVERLAP]
                .copy_from_slice(&self.in_mem[c * OVERLAP..(c + 1) * OVERLAP]);
            comb_filter(
                input,
                c * frame_len + OVERLAP,
                &pre,
                c * pre_len + COMB_MAX_PERIOD,
                period_old,
                pitch_index,
                n,
                -self.prefilter_gain,
                -gain,
                self.prefilter_tapset,
                self.tapset_decision,
                self.mode.window(),
                OVERLAP,
            );
        });
        let (pf_on, gain, qg) = if pf_on {
            let before: f32 = (0..cc)
                .into_iter()
                .map(|c| signal_energy(&pre[c * pre_len + COMB_MAX_PERIOD..(c + 1) * pre_len]))
                .sum();
            let after: f32 = (0..cc)
                .into_iter()
                .map(|c| {
                    signal_energy(&input[c * frame_len + OVERLAP..(c + 1) * frame_len])
                })
                .sum();
            if after > 2.0 * before {
                // The filter fought the signal; run again with zero gain.
                (0..self.channels).into_iter().for_each(|c| {
                    comb_filter(
                        input,
                        c * frame_len + OVERLAP,
                        &pre,
                        c * pre_len + COMB_MAX_PERIOD,
                        period_old,
                        pitch_index,
                        n,
                        -self.prefilter_gain,
                        0.0,
                        self.prefilter_tapset,
                        self.tapset_decision,
                        self.mode.window(),
                        OVERLAP,
                    );
                });
                (false, 0.0, 0)
            } else {
                (pf_on, gain, qg)
            }
        } else {
            (pf_on, gain, qg)
        };

        // Carry the raw history and the overlap tail forward.
        (0..cc).into_iter().for_each(|c| {
            let src = c * frame_len + n;
            self.in_mem[c * OVERLAP..(c + 1) * OVERLAP]
                .copy_from_slice(&input[src..src + OVERLAP]);

            let mem = &mut self.prefilter_mem[c * COMB_MAX_PERIOD..(c + 1) * COMB_MAX_PERIOD];
            if n >= COMB_MAX_PERIOD {
                mem.copy_from_slice(&pre[c * pre_len + n..c * pre_len + n + COMB_MAX_PERIOD]);
            } else {
                mem.copy_within(n.., 0);
                mem[COMB_MAX_PERIOD - n..].copy_from_slice(
                    &pre[c * pre_len + COMB_MAX_PERIOD..c * pre_len + COMB_MAX_PERIOD + n],
                );
            }
        });

        self.prefilter_period = pitch_index;
        self.prefilter_gain = gain;
        self.prefilter_tapset = self.tapset_decision;
        Ok((pf_on, pitch_index, gain, qg))
    }
}

/// A forward-masked envelope ratio: how much a late burst of energy sticks
/// out of what the ear would already mask.
///
/// Returns the transient flag and a 0..1 estimate used by the trim and VBR.
fn transient_analysis(input: &[f32], frame_len: usize, cc: usize) -> (bool, f32) {
    let block = SHORT_MDCT_SIZE >> 1;
    let mut worst_ratio = 0.0_f32;

    (0..cc).into_iter().for_each(|c| {
        let x = &input[c * frame_len..(c + 1) * frame_len];

        // Short-block envelope against a slowly decaying masking level.
        let mut mask = 0.0_f32;
        let mut prev1 = 0.0_f32;
        let mut prev2 = 0.0_f32;
        let blocks = frame_len / block;
        (0..blocks).into_iter().for_each(|b| {
            let mut energy = 1e-15_f32;
            x[b * block..(b + 1) * block].iter().for_each(|&v| {
                // A crude high-pass removes the bias from low tones.
                let hp = v - 2.0 * prev1 + prev2;
                prev2 = prev1;
                prev1 = v;
                energy += hp * hp;
            });
            if b > 0 {
                let ratio = energy / (mask + 1e-15);
                worst_ratio = f32::max(worst_ratio, ratio);
            }
            mask = f32::max(energy, 0.5 * mask);
        });
    });

    let is_transient = worst_ratio > 100.0;
    let tf_estimate = f32::min(1.0, (worst_ratio.max(1.0).ln() / 12.0).max(0.0));
    (is_transient, tf_estimate)
}

/// Decides how strongly shapes should be rotated, from how noise-like the
/// normalized spectrum looks, with recursive averaging and hysteresis.
#[allow(clippy::too_many_arguments)]
fn spreading_decision(
    x: &[f32],
    channels: usize,
    bins_per_channel: usize,
    end: usize,
    lm: usize,
    average: &mut i32,
    last_decision: usize,
    hf_average: &mut i32,
    tapset_decision: &mut usize,
) -> usize {
    let m = 1 << lm;
    let mut sum = 0_i32;
    let mut nb_bands = 0_i32;
    let mut hf_sum = 0_i32;

    (0..channels).into_iter().for_each(|c| {
        (0..end).into_iter().for_each(|i| {
            let n = m * band_width(i);
            if n <= 8 {
                return;
            }
            let base = c * bins_per_channel + m * EBANDS[i];
            let mut tcount = [0_i32; 3];
            x[base..base + n].iter().for_each(|&v| {
                // Rough CDF of the squared magnitudes against the uniform
                // energy level.
                let x2n = v * v * n as f32;
                if x2n < 0.25 {
                    tcount[0] += 1;
                }
                if x2n < 0.0625 {
                    tcount[1] += 1;
                }
                if x2n < 0.015625 {
                    tcount[2] += 1;
                }
            });

            // Only the last four bands (8 kHz and up) drive the tapset.
            if i > NB_BANDS - 4 {
                hf_sum += 32 * (tcount[1] + tcount[0]) / n as i32;
            }
            let tmp = i32::from(2 * tcount[2] >= n as i32)
                + i32::from(2 * tcount[1] >= n as i32)
                + i32::from(2 * tcount[0] >= n as i32);
            sum += tmp;
            nb_bands += 1;
        });
    });

    if hf_sum != 0 {
        hf_sum /= (channels * (4 - (NB_BANDS - end).min(4))) as i32;
    }
    *hf_average = (*hf_average + hf_sum) >> 1;
    let mut hf = *hf_average;
    if *tapset_decision == 2 {
        hf += 4;
    } else if *tapset_decision == 0 {
        hf -= 4;
    }
    *tapset_decision = if hf > 22 {
        2
    } else if hf > 18 {
        1
    } else {
        0
    };

    if nb_bands == 0 {
        return last_decision;
    }
    sum = (sum << 8) / nb_bands;
    // Recursive averaging.
    sum = (sum + *average) >> 1;
    *average = sum;
    // Hysteresis towards the previous decision.
    sum = (3 * sum + (((3 - last_decision as i32) << 7) + 64) + 2) >> 2;

    if sum < 51 {
        SPREAD_NONE
    } else if sum < 102 {
        SPREAD_LIGHT
    } else if sum < 128 {
        SPREAD_NORMAL
    } else {
        SPREAD_AGGRESSIVE
    }
}

/// Spectral tilt of the frame, mapped onto the trim alphabet.
fn alloc_trim_analysis(
    band_log_e: &[f32],
    channels: usize,
    end: usize,
    tf_estimate: f32,
) -> i32 {
    let mut diff = 0.0_f32;
    (0..channels).into_iter().for_each(|c| {
        (0..end - 1).into_iter().for_each(|i| {
            diff += band_log_e[i + c * NB_BANDS] * (2 + 2 * i as i32 - end as i32) as f32;
        });
    });
    diff /= (channels * (end - 1)) as f32;

    let mut trim = 5.0_f32;
    trim -= f32::max(-2.0, f32::min(2.0, (diff + 1.0) / 6.0));
    trim -= 2.0 * tf_estimate;
    (0.5 + trim).floor().clamp(0.0, 10.0) as i32
}

/// Quantized threshold walk with per-step hysteresis.
fn hysteresis_decision(
    value: f32,
    thresholds: &[f32; NB_BANDS],
    hysteresis: &[f32; NB_BANDS],
    prev: usize,
) -> usize {
    let mut i = 0;
    while i < NB_BANDS {
        if value < thresholds[i] {
            break;
        }
        i += 1;
    }
    if i > prev && prev < NB_BANDS && value < thresholds[prev] + hysteresis[prev] {
        i = prev;
    }
    if i < prev && prev > 0 && value > thresholds[prev - 1] - hysteresis[prev - 1] {
        i = prev;
    }
    i
}

/// Measures whether a band's energy is better concentrated with more time
/// resolution or more frequency resolution: whichever direction gives the
/// sparser (smaller L1 norm) shape wins.
fn tf_analysis(
    x: &[f32],
    start: usize,
    end: usize,
    lm: usize,
    is_transient: bool,
    tf_res: &mut [i32; NB_BANDS],
) {
    use crate::celt::bands::haar1;

    let m = 1 << lm;
    let blocks = if is_transient { m } else { 1 };

    for i in start..end {
        let n = m * band_width(i);
        let lo = m * EBANDS[i];
        let mut tmp = x[lo..lo + n].to_vec();

        let l1_base = l1_metric(&tmp, lm as i32);
        let changed = if is_transient {
            // Short blocks: try recombining towards frequency resolution.
            if n >= 2 * blocks {
                haar1(&mut tmp, n, 1);
                l1_metric(&tmp, lm as i32 - 1) < 0.97 * l1_base
            } else {
                false
            }
        } else {
            // Long blocks: try splitting towards time resolution.
            if n & 1 == 0 && n >= 2 {
                haar1(&mut tmp, n, 1);
                l1_metric(&tmp, lm as i32 + 1) < 0.97 * l1_base
            } else {
                false
            }
        };
        tf_res[i] = i32::from(changed);
    }
}

/// L1 norm with a small bias favouring the current resolution, so the
/// decision only flips when the transform clearly concentrates energy.
fn l1_metric(x: &[f32], bias_lm: i32) -> f32 {
    let l1: f32 = x.iter().map(|v| v.abs()).sum();
    l1 * (1.0 + 0.015 * bias_lm.max(0) as f32)
}

/// Requests boost quanta for bands that rise sharply above the spectral
/// envelope, so tonal peaks keep enough bits to stay clean.
fn dynalloc_analysis(
    band_log_e: &[f32],
    channels: usize,
    start: usize,
    end: usize,
) -> [i32; NB_BANDS] {
    let mut offsets = [0_i32; NB_BANDS];
    if end <= start + 1 {
        return offsets;
    }

    (0..channels).into_iter().for_each(|c| {
        let x = &band_log_e[c * NB_BANDS..c * NB_BANDS + NB_BANDS];

        // The envelope floor is the slower of two sloped followers, one in
        // each direction, so an isolated peak cannot raise its own floor.
        let mut follower = [0_f32; NB_BANDS];
        let mut f = x[start];
        (start..end).into_iter().for_each(|i| {
            f = f32::min(x[i], f + 1.5);
            follower[i] = f;
        });
        let mut b = x[end - 1];
        (start..end).into_iter().rev().for_each(|i| {
            b = f32::min(x[i], b + 2.0);
            follower[i] = f32::min(follower[i], b);
        });

        (start..end).into_iter().for_each(|i| {
            // One quantum for each 6 dB step above the floor, past a one
            // step allowance, and never more than two per channel.
            let excess = x[i] - follower[i] - 1.0;
            if excess > 0.0 {
                offsets[i] += i32::min(2, excess as i32 + 1);
            }
        });
    });
    offsets
}

/// Compares the L1 cost of coding left/right against mid/side over the low
/// bands.
fn stereo_analysis(x: &[f32], y: &[f32], lm: usize) -> bool {
    let mut sum_lr = crate::celt::EPSILON;
    let mut sum_ms = crate::celt::EPSILON;

    (0..13).into_iter().for_each(|i| {
        ((EBANDS[i] << lm)..(EBANDS[i + 1] << lm))
            .into_iter()
            .for_each(|j| {
                let l = x[j];
                let r = y[j];
                sum_lr += l.abs() + r.abs();
                sum_ms += (l + r).abs() + (l - r).abs();
            });
    });
    sum_ms *= std::f32::consts::FRAC_1_SQRT_2;

    let mut thetas = 13;
    // The lower bands don't need thetas for short frames.
    if lm <= 1 {
        thetas -= 8;
    }
    let width = (EBANDS[13] << (lm + 1)) as f32;
    (width + thetas as f32) * sum_ms > width * sum_lr
}
