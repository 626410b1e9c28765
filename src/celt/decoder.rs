//! Implements the CELT decoder.

use log::{debug, warn};

use crate::celt::bands::{
    anti_collapse, denormalise_bands, quant_all_bands, tf_code,
};
use crate::celt::comb_filter::comb_filter_inplace;
use crate::celt::mode::{compute_caps, Mode};
use crate::celt::pitch::{pitch_downsample, pitch_search};
use crate::celt::quant_energy::{
    unquant_coarse_energy, unquant_energy_finalise, unquant_fine_energy,
};
use crate::celt::rate::{code_dynalloc, compute_allocation};
use crate::celt::tables::{PREEMPHASIS, SPREAD_ICDF, TAPSET_ICDF, TRIM_ICDF};
use crate::celt::{
    frame_size_to_lm, Coder, COMB_MAX_PERIOD, COMB_MIN_PERIOD, DECODE_BUFFER_SIZE, NB_BANDS,
    OVERLAP, SHORT_MDCT_SIZE, SIG_SCALE, SPREAD_NORMAL,
};
use crate::decoder_error::DecoderError;
use crate::range_coder::{RangeDecoder, Tell, BITRES};
use crate::{Bandwidth, Channels};

/// Longest pitch lag the concealment searches for.
const PLC_PITCH_LAG_MAX: usize = 720;
/// Shortest pitch lag the concealment searches for.
const PLC_PITCH_LAG_MIN: usize = 100;
/// Consecutive losses after which concealment fades into noise.
const PLC_NOISE_THRESHOLD: i32 = 5;
/// Per-loss attenuation of the concealed signal.
const PLC_ATTENUATION: f32 = 0.8;

/// The CELT decoder.
///
/// Holds everything that must survive between frames: the synthesis
/// history for the overlap-add and the postfilter, the energy predictor
/// state, and the concealment bookkeeping.
pub(crate) struct CeltDecoder {
    mode: Mode,
    channels: usize,
    stream_channels: usize,
    start_band: usize,
    end_band: usize,

    /// Synthesis history per output channel, `DECODE_BUFFER_SIZE + OVERLAP`
    /// samples each. Doubles as the postfilter and concealment history.
    decode_mem: Vec<f32>,
    preemph_mem: [f32; 2],

    /// Quantized log2 energies of the previous frame.
    old_ebands: Vec<f32>,
    /// Log energies of the previous and the next-to-previous frame, the
    /// anti-collapse bound.
    old_log_e: Vec<f32>,
    old_log_e2: Vec<f32>,

    postfilter_period: usize,
    postfilter_gain: f32,
    postfilter_tapset: usize,
    postfilter_period_old: usize,
    postfilter_gain_old: f32,
    postfilter_tapset_old: usize,

    rng: u32,
    final_range: u32,
    loss_count: i32,
    plc_pitch: usize,
    plc_noise_seed: u32,
    last_pitch_index: usize,
}

impl CeltDecoder {
    /// Creates a new CELT decoder producing the given channel count.
    pub(crate) fn new(channels: Channels) -> Result<Self, DecoderError> {
        let channels = channels as usize;
        let mut decoder = Self {
            mode: Mode::new(),
            channels,
            stream_channels: channels,
            start_band: 0,
            end_band: NB_BANDS,
            decode_mem: vec![0.0; channels * (DECODE_BUFFER_SIZE + OVERLAP)],
            preemph_mem: [0.0; 2],
            old_ebands: vec![0.0; 2 * NB_BANDS],
            old_log_e: vec![0.0; 2 * NB_BANDS],
            old_log_e2: vec![0.0; 2 * NB_BANDS],
            postfilter_period: 0,
            postfilter_gain: 0.0,
            postfilter_tapset: 0,
            postfilter_period_old: 0,
            postfilter_gain_old: 0.0,
            postfilter_tapset_old: 0,
            rng: 0,
            final_range: 0,
            loss_count: 0,
            plc_pitch: PLC_PITCH_LAG_MIN,
            plc_noise_seed: 0,
            last_pitch_index: 0,
        };
        decoder.reset();
        Ok(decoder)
    }

    /// Resets the decoder to its deterministic initial state.
    pub(crate) fn reset(&mut self) {
        self.decode_mem.iter_mut().for_each(|v| *v = 0.0);
        self.preemph_mem = [0.0; 2];
        self.old_ebands.iter_mut().for_each(|v| *v = 0.0);
        self.old_log_e.iter_mut().for_each(|v| *v = -28.0);
        self.old_log_e2.iter_mut().for_each(|v| *v = -28.0);
        self.postfilter_period = 0;
        self.postfilter_gain = 0.0;
        self.postfilter_tapset = 0;
        self.postfilter_period_old = 0;
        self.postfilter_gain_old = 0.0;
        self.postfilter_tapset_old = 0;
        self.rng = 0;
        self.loss_count = 0;
        self.plc_pitch = PLC_PITCH_LAG_MIN;
        self.plc_noise_seed = 0;
        self.last_pitch_index = 0;
    }

    /// Limits the coded bands to the signal bandwidth.
    pub(crate) fn set_bandwidth(&mut self, bandwidth: Bandwidth) {
        self.end_band = bandwidth_to_end_band(bandwidth);
    }

    /// First coded band; 17 when running above another codec.
    pub(crate) fn set_start_band(&mut self, start_band: usize) {
        self.start_band = usize::min(start_band, NB_BANDS - 1);
    }

    /// Channel count of the incoming packets, independent of the output.
    pub(crate) fn set_stream_channels(&mut self, channels: Channels) {
        self.stream_channels = channels as usize;
    }

    /// The range coder state after the last decoded frame.
    pub(crate) fn final_range(&self) -> u32 {
        self.final_range
    }

    /// The comb filter period of the last frame, in samples.
    pub(crate) fn pitch(&self) -> usize {
        self.last_pitch_index
    }

    /// The energy predictor history, for tests.
    #[cfg(test)]
    pub(crate) fn energy_history(&self) -> &[f32] {
        &self.old_log_e
    }

    /// Decodes one frame into `frame_size * channels` interleaved samples.
    ///
    /// `packet` of `None` (or an empty slice) runs the loss concealment.
    pub(crate) fn decode(
        &mut self,
        packet: Option<&[u8]>,
        pcm: &mut [f32],
        frame_size: usize,
    ) -> Result<usize, DecoderError> {
        let lm = frame_size_to_lm(frame_size).ok_or(DecoderError::InvalidFrameSize)?;
        if pcm.len() < frame_size * self.channels {
            return Err(DecoderError::BufferTooSmall);
        }

        match packet {
            Some(data) if data.len() > 1 => self.decode_frame(data, pcm, frame_size, lm),
            Some(_) | None => {
                self.conceal_frame(pcm, frame_size, lm);
                Ok(frame_size)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    fn decode_frame(
        &mut self,
        data: &[u8],
        pcm: &mut [f32],
        frame_size: usize,
        lm: usize,
    ) -> Result<usize, DecoderError> {
        let n = frame_size;
        let channels = self.stream_channels;
        let cc = self.channels;
        let start = self.start_band;
        let end = usize::max(self.end_band, start + 1);
        let mut dec = RangeDecoder::new(data);
        let total_bits = (data.len() * 8) as u32;

        // A mono stream decoded into a stereo instance predicts both
        // channels from the louder one.
        if channels == 1 {
            (0..NB_BANDS).into_iter().for_each(|i| {
                self.old_ebands[i] =
                    f32::max(self.old_ebands[i], self.old_ebands[NB_BANDS + i]);
            });
        }

        let mut tell = dec.tell();
        let silence = if tell >= total_bits {
            true
        } else if tell == 1 {
            dec.decode_bit_logp(15)
        } else {
            false
        };
        if silence {
            // Pretend we read all the bits.
            dec.skip_to_end(total_bits);
            tell = dec.tell();
        }

        // Postfilter parameters.
        let mut postfilter_pitch = 0_usize;
        let mut postfilter_gain = 0_f32;
        let mut postfilter_tapset = 0_usize;
        if start == 0 && tell + 16 <= total_bits {
            if dec.decode_bit_logp(1) {
                let octave = dec.decode_uint(6) as usize;
                let pitch = (16 << octave) + dec.decode_bits(4 + octave as u32) as usize - 1;
                let qg = dec.decode_bits(3);
                if dec.tell() + 2 <= total_bits {
                    postfilter_tapset = dec.decode_icdf(&TAPSET_ICDF, 2) as usize;
                }
                // Sanitize what the stream gave us.
                postfilter_pitch = pitch.min(COMB_MAX_PERIOD);
                postfilter_gain = 0.09375 * (qg + 1) as f32;
            }
            tell = dec.tell();
        }

        let is_transient = if lm > 0 && tell + 3 <= total_bits {
            let t = dec.decode_bit_logp(3);
            tell = dec.tell();
            t
        } else {
            false
        };
        let short_blocks = is_transient;

        let intra = if tell + 3 <= total_bits {
            dec.decode_bit_logp(3)
        } else {
            false
        };

        unquant_coarse_energy(
            start,
            end,
            &mut self.old_ebands,
            intra,
            &mut dec,
            channels,
            lm,
            total_bits as i32,
        );

        let mut tf_res = [0_i32; NB_BANDS];
        {
            let mut coder = Coder::Decode(&mut dec);
            tf_code(
                &mut coder, start, end, is_transient, &mut tf_res, lm, 0, total_bits,
            )
            .map_err(|_| DecoderError::InternalError("tf decode failed"))?;
        }

        tell = dec.tell();
        let mut spread = SPREAD_NORMAL;
        if tell + 4 <= total_bits {
            spread = dec.decode_icdf(&SPREAD_ICDF, 5) as usize;
        }

        let caps = compute_caps(lm, channels);
        let total_bits_q3 = (total_bits as i32) << BITRES;

        let mut offsets = [0_i32; NB_BANDS];
        let total_boost;
        {
            let mut coder = Coder::Decode(&mut dec);
            total_boost = code_dynalloc(
                &mut coder,
                start,
                end,
                lm,
                channels,
                &caps,
                total_bits_q3,
                &mut offsets,
            )
            .map_err(|_| DecoderError::InternalError("dynalloc decode failed"))?;
        }

        let alloc_trim = if dec.tell_frac() as i32 + (6 << BITRES) <= total_bits_q3 - total_boost
        {
            dec.decode_icdf(&TRIM_ICDF, 7) as i32
        } else {
            5
        };

        let mut bits = total_bits_q3 - dec.tell_frac() as i32 - 1;
        let anti_collapse_rsv =
            if is_transient && lm >= 2 && bits >= ((lm as i32) + 2) << BITRES {
                1 << BITRES
            } else {
                0
            };
        bits -= anti_collapse_rsv;

        let alloc;
        {
            let mut coder = Coder::Decode(&mut dec);
            alloc = compute_allocation(
                start,
                end,
                &offsets,
                &caps,
                alloc_trim,
                0,
                false,
                bits,
                channels,
                lm,
                &mut coder,
                0,
                0,
            )
            .map_err(|_| DecoderError::InternalError("allocation decode failed"))?;
        }

        unquant_fine_energy(
            start,
            end,
            &mut self.old_ebands,
            &alloc.fine_bits,
            &mut dec,
            channels,
        );

        // Make room in the synthesis history for the new frame.
        let mem_len = DECODE_BUFFER_SIZE + OVERLAP;
        (0..cc).into_iter().for_each(|c| {
            let base = c * mem_len;
            self.decode_mem
                .copy_within(base + n..base + DECODE_BUFFER_SIZE + (OVERLAP >> 1), base);
        });

        // Decode the shapes. The per-channel spectrum covers the full
        // frame; the bins above the last band stay zero.
        let bins = n;
        let mut x = vec![0_f32; channels * bins];
        let mut collapse_masks = vec![0_u8; channels * NB_BANDS];
        {
            let (x0, x1) = x.split_at_mut(bins);
            let mut coder = Coder::Decode(&mut dec);
            self.rng = quant_all_bands(
                &mut coder,
                &self.mode,
                start,
                end,
                x0,
                if channels == 2 { Some(x1) } else { None },
                &mut collapse_masks,
                &[],
                &alloc.pulses,
                short_blocks,
                spread,
                alloc.dual_stereo,
                alloc.intensity,
                &tf_res,
                total_bits_q3 - anti_collapse_rsv,
                alloc.balance,
                lm,
                alloc.coded_bands,
                self.rng,
                false,
            )
            .map_err(|_| DecoderError::InternalError("band decode failed"))?;
        }

        let mut anti_collapse_on = false;
        if anti_collapse_rsv > 0 {
            anti_collapse_on = dec.decode_bits(1) != 0;
        }

        unquant_energy_finalise(
            start,
            end,
            &mut self.old_ebands,
            &alloc.fine_bits,
            &alloc.fine_priority,
            total_bits as i32 - dec.tell() as i32,
            &mut dec,
            channels,
        );

        if anti_collapse_on {
            anti_collapse(
                &mut x,
                &collapse_masks,
                lm,
                channels,
                bins,
                start,
                end,
                &self.old_ebands,
                &self.old_log_e,
                &self.old_log_e2,
                &alloc.pulses,
                self.rng,
                false,
            );
        }

        if dec.error() {
            debug!("celt: range decoder consumed an impossible symbol");
        }

        if silence {
            self.old_ebands.iter_mut().for_each(|v| *v = -28.0);
        }

        self.synthesise(&x, bins, start, end, channels, is_transient, lm, silence, n);
        self.apply_postfilter(
            n,
            lm,
            postfilter_pitch,
            postfilter_gain,
            postfilter_tapset,
        );

        if channels == 1 {
            let (left, right) = self.old_ebands.split_at_mut(NB_BANDS);
            right.copy_from_slice(left);
        }

        // Roll the energy history for the anti-collapse bound.
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

        self.rng = dec.range();
        self.final_range = dec.range();
        self.loss_count = 0;

        self.deemphasis(pcm, n);
        Ok(n)
    }

    /// Denormalizes the decoded shapes and runs the inverse transforms into
    /// the synthesis history.
    #[allow(clippy::too_many_arguments)]
    fn synthesise(
        &mut self,
        x: &[f32],
        bins: usize,
        start: usize,
        end: usize,
        channels: usize,
        is_transient: bool,
        lm: usize,
        silence: bool,
        n: usize,
    ) {
        let cc = self.channels;
        let mem_len = DECODE_BUFFER_SIZE + OVERLAP;
        let out_base = DECODE_BUFFER_SIZE - n;
        let (blocks, nb, shift) = if is_transient {
            (1 << lm, SHORT_MDCT_SIZE, 3)
        } else {
            (1, SHORT_MDCT_SIZE << lm, 3 - lm)
        };

        let mut freq = vec![0_f32; bins];
        if channels == 2 && cc == 1 {
            // Downmix the stereo stream to mono.
            let mut freq2 = vec![0_f32; bins];
            denormalise_bands(
                &x[..bins], &mut freq, &self.old_ebands, start, end, lm, 0, silence,
            );
            denormalise_bands(
                &x[bins..], &mut freq2, &self.old_ebands, start, end, lm, 1, silence,
            );
            for (f, &g) in freq.iter_mut().zip(freq2.iter()) {
                *f = 0.5 * *f + 0.5 * g;
            }
            let mdct = self.mode.mdct();
            let window = self.mode.window();
            let mem = &mut self.decode_mem[..mem_len];
            for b in 0..blocks {
                mdct.backward(shift, &freq, b, blocks, mem, out_base + nb * b, window);
            }
        } else {
            // Mono into stereo duplicates; matched channels map one to one.
            for c in 0..cc {
                let src = usize::min(c, channels - 1);
                denormalise_bands(
                    &x[src * bins..(src + 1) * bins],
                    &mut freq,
                    &self.old_ebands,
                    start,
                    end,
                    lm,
                    src,
                    silence,
                );
                let mdct = self.mode.mdct();
                let window = self.mode.window();
                let mem = &mut self.decode_mem[c * mem_len..(c + 1) * mem_len];
                for b in 0..blocks {
                    mdct.backward(shift, &freq, b, blocks, mem, out_base + nb * b, window);
                }
            }
        }
    }

    /// Runs the comb postfilter over the new output region, cross-fading
    /// from the previous frame's parameters.
    fn apply_postfilter(
        &mut self,
        n: usize,
        lm: usize,
        pitch: usize,
        gain: f32,
        tapset: usize,
    ) {
        let cc = self.channels;
        let mem_len = DECODE_BUFFER_SIZE + OVERLAP;
        let out_base = DECODE_BUFFER_SIZE - n;

        self.postfilter_period = usize::max(self.postfilter_period, COMB_MIN_PERIOD);
        self.postfilter_period_old = usize::max(self.postfilter_period_old, COMB_MIN_PERIOD);
        // A zero gain carries the other side's period forward.
        let pitch = if gain == 0.0 {
            self.postfilter_period
        } else {
            usize::max(COMB_MIN_PERIOD, pitch)
        };

        (0..cc).into_iter().for_each(|c| {
            let mem = &mut self.decode_mem[c * mem_len..(c + 1) * mem_len];
            comb_filter_inplace(
                mem,
                out_base,
                self.postfilter_period_old,
                self.postfilter_period,
                SHORT_MDCT_SIZE,
                self.postfilter_gain_old,
                self.postfilter_gain,
                self.postfilter_tapset_old,
                self.postfilter_tapset,
                self.mode.window(),
                OVERLAP,
            );
            if lm != 0 {
                comb_filter_inplace(
                    mem,
                    out_base + SHORT_MDCT_SIZE,
                    self.postfilter_period,
                    pitch,
                    n - SHORT_MDCT_SIZE,
                    self.postfilter_gain,
                    gain,
                    self.postfilter_tapset,
                    tapset,
                    self.mode.window(),
                    OVERLAP,
                );
            }
        });

        self.postfilter_period_old = self.postfilter_period;
        self.postfilter_gain_old = self.postfilter_gain;
        self.postfilter_tapset_old = self.postfilter_tapset;
        self.postfilter_period = pitch;
        self.postfilter_gain = gain;
        self.postfilter_tapset = tapset;
        if lm != 0 {
            self.postfilter_period_old = self.postfilter_period;
            self.postfilter_gain_old = self.postfilter_gain;
            self.postfilter_tapset_old = self.postfilter_tapset;
        }
        if gain > 0.0 {
            self.last_pitch_index = pitch;
        }
    }

    /// De-emphasizes the freshly synthesized region into the caller's
    /// buffer, interleaving the channels.
    fn deemphasis(&mut self, pcm: &mut [f32], n: usize) {
        let cc = self.channels;
        let mem_len = DECODE_BUFFER_SIZE + OVERLAP;
        let out_base = DECODE_BUFFER_SIZE - n;

        (0..cc).into_iter().for_each(|c| {
            let mut m = self.preemph_mem[c];
            let mem = &self.decode_mem[c * mem_len..(c + 1) * mem_len];
            (0..n).into_iter().for_each(|j| {
                let tmp = mem[out_base + j] + m;
                m = PREEMPHASIS * tmp;
                pcm[j * cc + c] = tmp * (1.0 / SIG_SCALE);
            });
            self.preemph_mem[c] = m;
        });
    }

    /// Packet-loss concealment: periodic repetition of the recent history,
    /// fading to noise after several consecutive losses.
    fn conceal_frame(&mut self, pcm: &mut [f32], n: usize, lm: usize) {
        let cc = self.channels;
        let mem_len = DECODE_BUFFER_SIZE + OVERLAP;
        let out_base = DECODE_BUFFER_SIZE - n;

        if self.loss_count == 0 {
            self.plc_pitch = self.plc_pitch_search();
        }
        let pitch = self.plc_pitch.max(COMB_MIN_PERIOD).min(PLC_PITCH_LAG_MAX);
        let attenuation = PLC_ATTENUATION.powi(self.loss_count + 1);
        debug!(
            "celt: concealing lost frame {} (pitch {}, attenuation {:.3})",
            self.loss_count, pitch, attenuation
        );

        (0..cc).into_iter().for_each(|c| {
            let base = c * mem_len;
            self.decode_mem
                .copy_within(base + n..base + DECODE_BUFFER_SIZE + (OVERLAP >> 1), base);

            if self.loss_count < PLC_NOISE_THRESHOLD {
                // Periodic extension of the last good signal.
                (0..n + (OVERLAP >> 1)).into_iter().for_each(|i| {
                    let idx = base + out_base + i;
                    self.decode_mem[idx] = attenuation * self.decode_mem[idx - pitch];
                });
            } else {
                // Keep only a decaying noise floor.
                let mut energy = 0_f32;
                (0..n).into_iter().for_each(|i| {
                    let v = self.decode_mem[base + out_base + i - n];
                    energy += v * v;
                });
                let rms = (energy / n as f32).sqrt() * attenuation;
                (0..n + (OVERLAP >> 1)).into_iter().for_each(|i| {
                    self.plc_noise_seed = crate::math::lcg_rand(self.plc_noise_seed);
                    let noise = (self.plc_noise_seed as i32 >> 20) as f32 / 2048.0;
                    self.decode_mem[base + out_base + i] = rms * noise;
                });
            }
        });

        // The postfilter keeps running with its remembered parameters.
        self.apply_postfilter(
            n,
            lm,
            self.postfilter_period,
            self.postfilter_gain,
            self.postfilter_tapset,
        );
        self.deemphasis(pcm, n);

        if self.loss_count < i32::MAX {
            self.loss_count += 1;
        }
        if self.loss_count == 1 {
            warn!("celt: packet lost, concealment engaged");
        }
    }

    /// Pitch of the concealment, from the synthesis history at 2:1.
    fn plc_pitch_search(&mut self) -> usize {
        let mem_len = DECODE_BUFFER_SIZE + OVERLAP;
        let channels: Vec<&[f32]> = (0..self.channels)
            .into_iter()
            .map(|c| &self.decode_mem[c * mem_len..c * mem_len + DECODE_BUFFER_SIZE])
            .collect();

        let mut lp_buf = vec![0_f32; DECODE_BUFFER_SIZE >> 1];
        pitch_downsample(&channels, &mut lp_buf);
        let found = pitch_search(
            &lp_buf[PLC_PITCH_LAG_MAX >> 1..],
            &lp_buf,
            DECODE_BUFFER_SIZE - PLC_PITCH_LAG_MAX,
            PLC_PITCH_LAG_MAX - PLC_PITCH_LAG_MIN,
        );
        PLC_PITCH_LAG_MAX - found
    }
}

/// Maps the signal bandwidth to the last coded band.
pub(crate) fn bandwidth_to_end_band(bandwidth: Bandwidth) -> usize {
    match bandwidth {
        Bandwidth::Narrowband => 13,
        Bandwidth::Mediumband | Bandwidth::Wideband => 17,
        Bandwidth::Superwideband => 19,
        Bandwidth::Auto | Bandwidth::Fullband => NB_BANDS,
    }
}
