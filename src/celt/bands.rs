//! Implements the band quantizer.
//!
//! Each band's unit-norm shape is coded by recursive splitting: stereo pairs
//! and oversized partitions are cut in two with a quantized angle deciding
//! the bit split, the leaves go through the pyramid quantizer, and bands
//! without any pulses are folded from lower spectrum or filled with noise.
//! The decoder walks the exact same state machine, so everything here runs
//! over the shared `Coder`.

use crate::celt::mode::{get_pulses, Mode};
use crate::celt::tables::{
    band_width, BIT_DEINTERLEAVE_TABLE, BIT_INTERLEAVE_TABLE, EBANDS, EXP2_TABLE8, E_MEANS,
    LOG_N, ORDERY_TABLE,
};
use crate::celt::vq::{alg_quant, alg_unquant, renormalise_vector, stereo_itheta};
use crate::celt::{
    Coder, ENERGY_FLOOR, EPSILON, NB_BANDS, QTHETA_OFFSET, QTHETA_OFFSET_TWOPHASE,
    SPREAD_AGGRESSIVE,
};
use crate::encoder_error::EncoderError;
use crate::math::{bitexact_cos, bitexact_log2tan, fast_exp2, frac_mul16, isqrt, lcg_rand};
use crate::range_coder::BITRES;

/// Linear amplitude of every band: `sqrt(sum of squares)` over its bins.
pub(crate) fn compute_band_energies(
    x: &[f32],
    band_e: &mut [f32],
    end: usize,
    lm: usize,
    channels: usize,
    bins_per_channel: usize,
) {
    (0..channels).into_iter().for_each(|c| {
        (0..end).into_iter().for_each(|i| {
            let lo = c * bins_per_channel + (EBANDS[i] << lm);
            let hi = c * bins_per_channel + (EBANDS[i + 1] << lm);
            let mut sum = ENERGY_FLOOR;
            x[lo..hi].iter().for_each(|v| sum += v * v);
            band_e[i + c * NB_BANDS] = sum.sqrt();
        });
    });
}

/// Scales each band to a unit-norm shape.
pub(crate) fn normalise_bands(
    freq: &[f32],
    x: &mut [f32],
    band_e: &[f32],
    end: usize,
    lm: usize,
    channels: usize,
    bins_per_channel: usize,
) {
    (0..channels).into_iter().for_each(|c| {
        (0..end).into_iter().for_each(|i| {
            let g = 1.0 / (ENERGY_FLOOR + band_e[i + c * NB_BANDS]);
            let lo = c * bins_per_channel + (EBANDS[i] << lm);
            let hi = c * bins_per_channel + (EBANDS[i + 1] << lm);
            (lo..hi).into_iter().for_each(|j| {
                x[j] = freq[j] * g;
            });
        });
    });
}

/// Scales one channel's shapes back up by the decoded log energies.
pub(crate) fn denormalise_bands(
    x: &[f32],
    freq: &mut [f32],
    band_log_e: &[f32],
    start: usize,
    end: usize,
    lm: usize,
    channel: usize,
    silence: bool,
) {
    if silence {
        freq.iter_mut().for_each(|v| *v = 0.0);
        return;
    }

    freq[..EBANDS[start] << lm]
        .iter_mut()
        .for_each(|v| *v = 0.0);
    (start..end).into_iter().for_each(|i| {
        let lg = band_log_e[i + channel * NB_BANDS] + E_MEANS[i];
        let g = fast_exp2(f32::min(32.0, lg));
        let lo = EBANDS[i] << lm;
        let hi = EBANDS[i + 1] << lm;
        (lo..hi).into_iter().for_each(|j| {
            freq[j] = x[j] * g;
        });
    });
    freq[(EBANDS[end] << lm)..]
        .iter_mut()
        .for_each(|v| *v = 0.0);
}

/// One Haar butterfly level over interleaved sub-blocks.
pub(crate) fn haar1(x: &mut [f32], n0: usize, stride: usize) {
    let n0 = n0 >> 1;
    (0..stride).into_iter().for_each(|i| {
        (0..n0).into_iter().for_each(|j| {
            let tmp1 = std::f32::consts::FRAC_1_SQRT_2 * x[stride * 2 * j + i];
            let tmp2 = std::f32::consts::FRAC_1_SQRT_2 * x[stride * (2 * j + 1) + i];
            x[stride * 2 * j + i] = tmp1 + tmp2;
            x[stride * (2 * j + 1) + i] = tmp1 - tmp2;
        });
    });
}

fn interleave_hadamard(x: &mut [f32], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    let mut tmp = vec![0_f32; n];
    if hadamard {
        let ordery = &ORDERY_TABLE[stride - 2..];
        (0..stride).into_iter().for_each(|i| {
            (0..n0).into_iter().for_each(|j| {
                tmp[j * stride + i] = x[ordery[i] * n0 + j];
            });
        });
    } else {
        (0..stride).into_iter().for_each(|i| {
            (0..n0).into_iter().for_each(|j| {
                tmp[j * stride + i] = x[i * n0 + j];
            });
        });
    }
    x[..n].copy_from_slice(&tmp);
}

fn deinterleave_hadamard(x: &mut [f32], n0: usize, stride: usize, hadamard: bool) {
    let n = n0 * stride;
    let mut tmp = vec![0_f32; n];
    if hadamard {
        let ordery = &ORDERY_TABLE[stride - 2..];
        (0..stride).into_iter().for_each(|i| {
            (0..n0).into_iter().for_each(|j| {
                tmp[ordery[i] * n0 + j] = x[j * stride + i];
            });
        });
    } else {
        (0..stride).into_iter().for_each(|i| {
            (0..n0).into_iter().for_each(|j| {
                tmp[i * n0 + j] = x[j * stride + i];
            });
        });
    }
    x[..n].copy_from_slice(&tmp);
}

/// Resolution of the angle quantizer as a function of the bits available.
fn compute_qn(n: usize, b: i32, offset: i32, pulse_cap: i32, stereo: bool) -> i32 {
    let mut n2 = 2 * n as i32 - 1;
    // The upper limit ensures that in a stereo split with itheta==16384 we
    // will always have enough bits left over to code at least one pulse in
    // the side; otherwise it would collapse, since it does not get folded.
    if stereo && n == 2 {
        n2 -= 1;
    }
    let mut qb = (b + n2 * offset) / n2;
    qb = i32::min(b - pulse_cap - (4 << BITRES), qb);
    qb = i32::min(8 << BITRES, qb);

    if qb < (1 << BITRES >> 1) {
        1
    } else {
        let qn = EXP2_TABLE8[(qb & 0x7) as usize] >> (14 - (qb >> BITRES));
        ((qn + 1) >> 1) << 1
    }
}

/// Mixes the side into the mid with the energy-derived panning gains.
fn intensity_stereo(x: &mut [f32], y: &[f32], band_e: &[f32], band: usize) {
    let left = band_e[band];
    let right = band_e[band + NB_BANDS];
    let norm = EPSILON + (EPSILON + left * left + right * right).sqrt();
    let a1 = left / norm;
    let a2 = right / norm;
    x.iter_mut().zip(y.iter()).for_each(|(xj, &yj)| {
        *xj = a1 * *xj + a2 * yj;
    });
}

fn stereo_split(x: &mut [f32], y: &mut [f32]) {
    x.iter_mut().zip(y.iter_mut()).for_each(|(xj, yj)| {
        let l = std::f32::consts::FRAC_1_SQRT_2 * *xj;
        let r = std::f32::consts::FRAC_1_SQRT_2 * *yj;
        *xj = l + r;
        *yj = r - l;
    });
}

fn stereo_merge(x: &mut [f32], y: &mut [f32], mid: f32) {
    let mut xp = 0_f32;
    let mut side = 0_f32;
    x.iter().zip(y.iter()).for_each(|(&xj, &yj)| {
        xp += xj * yj;
        side += yj * yj;
    });
    // Compensating for the mid normalization.
    xp *= mid;
    let el = mid * mid + side - 2.0 * xp;
    let er = mid * mid + side + 2.0 * xp;
    if er < 6e-4 || el < 6e-4 {
        y.copy_from_slice(x);
        return;
    }

    let lgain = 1.0 / el.sqrt();
    let rgain = 1.0 / er.sqrt();
    x.iter_mut().zip(y.iter_mut()).for_each(|(xj, yj)| {
        // The mid scaling is applied here, the side is already scaled.
        let l = mid * *xj;
        let r = *yj;
        *xj = lgain * (l - r);
        *yj = rgain * (l + r);
    });
}

/// Per-frame state shared down the band recursion.
pub(crate) struct BandCtx<'m> {
    mode: &'m Mode,
    resynth: bool,
    band: usize,
    intensity: usize,
    spread: usize,
    tf_change: i32,
    remaining_bits: i32,
    band_e: &'m [f32],
    seed: u32,
    avoid_split_noise: bool,
    disable_inv: bool,
}

struct SplitCtx {
    inv: bool,
    imid: i32,
    iside: i32,
    delta: i32,
    itheta: i32,
    qalloc: i32,
}

/// Quantizes (or decodes) the angle that splits a partition in two and
/// derives the mid/side gains and the bit-split bias from it.
#[allow(clippy::too_many_arguments)]
fn compute_theta(
    ctx: &mut BandCtx<'_>,
    coder: &mut Coder<'_, '_>,
    x: &mut [f32],
    y: &mut [f32],
    b: &mut i32,
    bblocks: usize,
    b0: usize,
    lm: i32,
    stereo: bool,
    fill: &mut u32,
) -> Result<SplitCtx, EncoderError> {
    let n = x.len();
    let encode = coder.is_encoder();

    // Decide on the resolution to give to the split parameter theta.
    let pulse_cap = LOG_N[ctx.band] + (lm << BITRES);
    let offset = (pulse_cap >> 1)
        - if stereo && n == 2 {
            QTHETA_OFFSET_TWOPHASE
        } else {
            QTHETA_OFFSET
        };
    let mut qn = compute_qn(n, *b, offset, pulse_cap, stereo);
    if stereo && ctx.band >= ctx.intensity {
        qn = 1;
    }

    let mut itheta = if encode {
        // theta is the atan() of the ratio between the (normalized) side
        // and mid. With just that parameter we can rescale both because
        // they have unit norm and are orthogonal.
        stereo_itheta(x, y, stereo, n)
    } else {
        0
    };

    let tell = coder.tell_frac() as i32;
    let mut inv = false;

    if qn != 1 {
        if encode {
            itheta = (itheta * qn + 8192) >> 14;
            // Check whether the rounded angle would make the allocation
            // inject noise on one side; if so, collapse the angle there.
            if !stereo && ctx.avoid_split_noise && itheta > 0 && itheta < qn {
                let unquantized = itheta * 16384 / qn;
                let imid = i32::from(bitexact_cos(unquantized as i16));
                let iside = i32::from(bitexact_cos((16384 - unquantized) as i16));
                let delta = i32::from(frac_mul16(
                    (((n as i32) - 1) << 7) as i16,
                    bitexact_log2tan(iside, imid) as i16,
                ));
                if delta > *b {
                    itheta = qn;
                } else if delta < -*b {
                    itheta = 0;
                }
            }
        }

        // Entropy coding of the angle: a step model for wide stereo, a
        // uniform one for the time split and a triangular one otherwise.
        if stereo && n > 2 {
            let p0: u32 = 3;
            let x0 = (qn / 2) as u32;
            let ft = p0 * (x0 + 1) + x0;
            // A probability of p0 up to the mid angle and 1 after it.
            itheta = match coder {
                Coder::Encode(enc) => {
                    let xv = itheta as u32;
                    let (fl, fh) = if xv <= x0 {
                        (p0 * xv, p0 * (xv + 1))
                    } else {
                        ((xv - 1 - x0) + (x0 + 1) * p0, (xv - x0) + (x0 + 1) * p0)
                    };
                    enc.encode(fl, fh, ft)?;
                    itheta
                }
                Coder::Decode(dec) => {
                    let fs = dec.decode(ft);
                    let xv = if fs < (x0 + 1) * p0 {
                        fs / p0
                    } else {
                        x0 + 1 + (fs - (x0 + 1) * p0)
                    };
                    let (fl, fh) = if xv <= x0 {
                        (p0 * xv, p0 * (xv + 1))
                    } else {
                        ((xv - 1 - x0) + (x0 + 1) * p0, (xv - x0) + (x0 + 1) * p0)
                    };
                    dec.update(fl, fh, ft);
                    xv as i32
                }
            };
        } else if b0 > 1 || stereo {
            // Uniform pdf.
            itheta = coder.uint(itheta as u32, qn as u32 + 1)? as i32;
        } else {
            // Triangular pdf.
            let half = qn >> 1;
            let ft = ((half + 1) * (half + 1)) as u32;
            itheta = match coder {
                Coder::Encode(enc) => {
                    let (fs, fl) = if itheta <= half {
                        (itheta + 1, itheta * (itheta + 1) >> 1)
                    } else {
                        (
                            qn + 1 - itheta,
                            ft as i32 - ((qn + 1 - itheta) * (qn + 2 - itheta) >> 1),
                        )
                    };
                    enc.encode(fl as u32, (fl + fs) as u32, ft)?;
                    itheta
                }
                Coder::Decode(dec) => {
                    let fm = dec.decode(ft) as i32;
                    let (v, fs, fl) = if fm < (half * (half + 1) >> 1) {
                        let v = (isqrt(8 * fm as u32 + 1) as i32 - 1) >> 1;
                        (v, v + 1, v * (v + 1) >> 1)
                    } else {
                        let v = (2 * (qn + 1)
                            - isqrt(8 * (ft as i32 - fm - 1) as u32 + 1) as i32)
                            >> 1;
                        (
                            v,
                            qn + 1 - v,
                            ft as i32 - ((qn + 1 - v) * (qn + 2 - v) >> 1),
                        )
                    };
                    dec.update(fl as u32, (fl + fs) as u32, ft);
                    v
                }
            };
        }
        debug_assert!(itheta >= 0);
        itheta = itheta * 16384 / qn;

        if encode && stereo {
            if itheta == 0 {
                intensity_stereo(x, y, ctx.band_e, ctx.band);
            } else {
                stereo_split(x, y);
            }
        }
    } else if stereo {
        // qn == 1: the side is either zero or a flipped copy of the mid.
        if encode {
            inv = itheta > 8192 && !ctx.disable_inv;
            if inv {
                y.iter_mut().for_each(|v| *v = -*v);
            }
            intensity_stereo(x, y, ctx.band_e, ctx.band);
        }
        if *b > 2 << BITRES && ctx.remaining_bits > 2 << BITRES {
            inv = coder.bit_logp(inv, 2)?;
        } else {
            inv = false;
        }
        if ctx.disable_inv {
            // Override to avoid problems with downmixing.
            inv = false;
        }
        itheta = 0;
    }

    let qalloc = coder.tell_frac() as i32 - tell;
    *b -= qalloc;

    let (imid, iside, delta) = if itheta == 0 {
        *fill &= (1 << bblocks) - 1;
        (32767, 0, -16384)
    } else if itheta == 16384 {
        *fill &= ((1 << bblocks) - 1) << bblocks;
        (0, 32767, 16384)
    } else {
        let imid = i32::from(bitexact_cos(itheta as i16));
        let iside = i32::from(bitexact_cos((16384 - itheta) as i16));
        // The mid vs side allocation that minimizes the squared error.
        let delta = i32::from(frac_mul16(
            (((n as i32) - 1) << 7) as i16,
            bitexact_log2tan(iside, imid) as i16,
        ));
        (imid, iside, delta)
    };

    Ok(SplitCtx {
        inv,
        imid,
        iside,
        delta,
        itheta,
        qalloc,
    })
}

fn quant_one_sample(
    ctx: &mut BandCtx<'_>,
    coder: &mut Coder<'_, '_>,
    x: &mut [f32],
) -> Result<(), EncoderError> {
    let mut sign = false;
    if ctx.remaining_bits >= 1 << BITRES {
        sign = coder.bits(u32::from(x[0] < 0.0), 1)? != 0;
        ctx.remaining_bits -= 1 << BITRES;
    }
    if ctx.resynth {
        x[0] = if sign { -1.0 } else { 1.0 };
    }
    Ok(())
}

/// Codes one sample with a sign bit; stereo codes both channels.
fn quant_band_n1(
    ctx: &mut BandCtx<'_>,
    coder: &mut Coder<'_, '_>,
    x: &mut [f32],
    y: Option<&mut [f32]>,
    lowband_out: Option<&mut [f32]>,
) -> Result<u32, EncoderError> {
    quant_one_sample(ctx, coder, x)?;
    if let Some(y) = y {
        quant_one_sample(ctx, coder, y)?;
    }
    if let Some(out) = lowband_out {
        out[0] = x[0];
    }
    Ok(1)
}

/// Recursive partition coder: splits while the codebook would overflow,
/// quantizes at the leaves, folds when no pulses remain.
#[allow(clippy::too_many_arguments)]
fn quant_partition(
    ctx: &mut BandCtx<'_>,
    coder: &mut Coder<'_, '_>,
    x: &mut [f32],
    mut b: i32,
    mut bblocks: usize,
    lowband: Option<&[f32]>,
    lm: i32,
    gain: f32,
    mut fill: u32,
) -> Result<u32, EncoderError> {
    let n = x.len();
    let b0 = bblocks;

    // If we need 1.5 more bits than we can produce, split the band in two.
    if lm != -1 && b > ctx.mode.max_pulse_bits(n) + 11 && n > 2 {
        let half = n >> 1;
        let (xs, ys) = x.split_at_mut(half);
        let lm = lm - 1;
        if bblocks == 1 {
            fill = (fill & 1) | (fill << 1);
        }
        bblocks = (bblocks + 1) >> 1;

        let sctx =
            compute_theta(ctx, coder, xs, ys, &mut b, bblocks, b0, lm, false, &mut fill)?;
        let itheta = sctx.itheta;
        let mut delta = sctx.delta;
        let mid = (1.0 / 32768.0) * sctx.imid as f32;
        let side = (1.0 / 32768.0) * sctx.iside as f32;

        // Give more bits to low-energy MDCTs than they would otherwise
        // deserve.
        if b0 > 1 && (itheta & 0x3FFF) != 0 {
            if itheta > 8192 {
                // Rough approximation for pre-echo masking.
                delta -= delta >> (4 - lm);
            } else {
                // Corresponds to a forward-masking slope of 1.5 dB per 10 ms.
                delta = i32::min(0, delta + ((half as i32) << BITRES >> (5 - lm)));
            }
        }
        let mut mbits = i32::max(0, i32::min(b, (b - delta) / 2));
        let mut sbits = b - mbits;
        ctx.remaining_bits -= sctx.qalloc;

        let lowband1 = lowband.map(|lb| &lb[..half]);
        let lowband2 = lowband.map(|lb| &lb[half..]);

        let rebalance = ctx.remaining_bits;
        let mut cm;
        if mbits >= sbits {
            cm = quant_partition(ctx, coder, xs, mbits, bblocks, lowband1, lm, gain * mid, fill)?;
            let rebalance = mbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 0 {
                sbits += rebalance - (3 << BITRES);
            }
            cm |= quant_partition(
                ctx,
                coder,
                ys,
                sbits,
                bblocks,
                lowband2,
                lm,
                gain * side,
                fill >> bblocks,
            )? << (b0 >> 1);
        } else {
            cm = quant_partition(
                ctx,
                coder,
                ys,
                sbits,
                bblocks,
                lowband2,
                lm,
                gain * side,
                fill >> bblocks,
            )? << (b0 >> 1);
            let rebalance = sbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 16384 {
                mbits += rebalance - (3 << BITRES);
            }
            cm |= quant_partition(ctx, coder, xs, mbits, bblocks, lowband1, lm, gain * mid, fill)?;
        }
        Ok(cm)
    } else {
        // The basic no-split case.
        let mut q = ctx.mode.bits2pulses(n, b);
        let mut curr_bits = ctx.mode.pulses2bits(n, q);
        ctx.remaining_bits -= curr_bits;

        // Ensures we can never bust the budget.
        while ctx.remaining_bits < 0 && q > 0 {
            ctx.remaining_bits += curr_bits;
            q -= 1;
            curr_bits = ctx.mode.pulses2bits(n, q);
            ctx.remaining_bits -= curr_bits;
        }

        if q != 0 {
            let k = get_pulses(q) as usize;
            match coder {
                Coder::Encode(enc) => alg_quant(x, k, ctx.spread, bblocks, enc, gain, ctx.resynth),
                Coder::Decode(dec) => Ok(alg_unquant(x, k, ctx.spread, bblocks, dec, gain)),
            }
        } else {
            // No pulses: fill the band anyway.
            let mut cm = 0;
            if ctx.resynth {
                let cm_mask = (1_u32 << bblocks) - 1;
                fill &= cm_mask;
                if fill == 0 {
                    x.iter_mut().for_each(|v| *v = 0.0);
                } else {
                    match lowband {
                        None => {
                            // Noise.
                            x.iter_mut().for_each(|v| {
                                ctx.seed = lcg_rand(ctx.seed);
                                *v = (ctx.seed as i32 >> 20) as f32;
                            });
                            cm = cm_mask;
                        }
                        Some(lb) => {
                            // Folded spectrum, with a dither about 48 dB
                            // below the folding level.
                            x.iter_mut().zip(lb.iter()).for_each(|(v, &l)| {
                                ctx.seed = lcg_rand(ctx.seed);
                                let tmp = if ctx.seed & 0x8000 != 0 {
                                    1.0 / 256.0
                                } else {
                                    -1.0 / 256.0
                                };
                                *v = l + tmp;
                            });
                            cm = fill;
                        }
                    }
                    renormalise_vector(x, gain);
                }
            }
            Ok(cm)
        }
    }
}

/// Codes one band: applies the time-frequency transforms, runs the
/// partition coder and undoes the transforms on the synthesized shape.
#[allow(clippy::too_many_arguments)]
fn quant_band(
    ctx: &mut BandCtx<'_>,
    coder: &mut Coder<'_, '_>,
    x: &mut [f32],
    b: i32,
    mut bblocks: usize,
    lowband: Option<&[f32]>,
    lm: i32,
    lowband_out: Option<&mut [f32]>,
    gain: f32,
    mut fill: u32,
) -> Result<u32, EncoderError> {
    let n = x.len();
    let n0 = n;
    let long_blocks = bblocks == 1;
    let encode = coder.is_encoder();
    let tf_change = ctx.tf_change;
    let mut time_divide = 0;
    let mut recombine = 0;

    // Special case for one sample.
    if n == 1 {
        return quant_band_n1(ctx, coder, x, None, lowband_out);
    }

    let mut n_b = n / bblocks;
    if tf_change > 0 {
        recombine = tf_change;
    }

    // The transforms below apply to the folding source as well, so work on
    // a copy of it when any of them will run.
    let needs_copy =
        lowband.is_some() && (recombine != 0 || (n_b & 1) == 0 && tf_change < 0 || bblocks > 1);
    let mut lowband_copy: Vec<f32> = Vec::new();
    if needs_copy {
        if let Some(lb) = lowband {
            lowband_copy.extend_from_slice(lb);
        }
    }

    // Band recombining to increase frequency resolution.
    for k in 0..recombine {
        if encode {
            haar1(x, n >> k, 1 << k);
        }
        if !lowband_copy.is_empty() {
            haar1(&mut lowband_copy, n >> k, 1 << k);
        }
        fill = u32::from(BIT_INTERLEAVE_TABLE[(fill & 0xF) as usize])
            | u32::from(BIT_INTERLEAVE_TABLE[(fill >> 4) as usize]) << 2;
    }
    bblocks >>= recombine;
    n_b <<= recombine;

    // Increasing the time resolution.
    let mut tf = tf_change;
    while (n_b & 1) == 0 && tf < 0 {
        if encode {
            haar1(x, n_b, bblocks);
        }
        if !lowband_copy.is_empty() {
            haar1(&mut lowband_copy, n_b, bblocks);
        }
        fill |= fill << bblocks;
        bblocks <<= 1;
        n_b >>= 1;
        time_divide += 1;
        tf += 1;
    }
    let b0 = bblocks;
    let n_b0 = n_b;

    // Reorganize the samples in time order instead of frequency order.
    if b0 > 1 {
        if encode {
            deinterleave_hadamard(x, n_b >> recombine, b0 << recombine, long_blocks);
        }
        if !lowband_copy.is_empty() {
            deinterleave_hadamard(
                &mut lowband_copy,
                n_b >> recombine,
                b0 << recombine,
                long_blocks,
            );
        }
    }

    let partition_lowband = if lowband_copy.is_empty() {
        lowband
    } else {
        Some(lowband_copy.as_slice())
    };

    let mut cm = quant_partition(
        ctx,
        coder,
        x,
        b,
        bblocks,
        partition_lowband,
        lm,
        gain,
        fill,
    )?;

    // Resynthesis: undo the transforms above.
    if ctx.resynth {
        if b0 > 1 {
            interleave_hadamard(x, n_b >> recombine, b0 << recombine, long_blocks);
        }

        let mut n_b = n_b0;
        let mut bblocks = b0;
        for _ in 0..time_divide {
            bblocks >>= 1;
            n_b <<= 1;
            cm |= cm >> bblocks;
            haar1(x, n_b, bblocks);
        }

        for k in 0..recombine {
            cm = u32::from(BIT_DEINTERLEAVE_TABLE[cm as usize]);
            haar1(x, n0 >> k, 1 << k);
        }
        bblocks <<= recombine;

        // Scale the output for any later folding.
        if let Some(out) = lowband_out {
            let g = (n0 as f32).sqrt();
            out.iter_mut().zip(x.iter()).for_each(|(o, &v)| {
                *o = g * v;
            });
        }
        cm &= (1_u32 << bblocks) - 1;
    }
    Ok(cm)
}

/// Codes one stereo band.
#[allow(clippy::too_many_arguments)]
fn quant_band_stereo(
    ctx: &mut BandCtx<'_>,
    coder: &mut Coder<'_, '_>,
    x: &mut [f32],
    y: &mut [f32],
    mut b: i32,
    bblocks: usize,
    lowband: Option<&[f32]>,
    lm: i32,
    lowband_out: Option<&mut [f32]>,
    fill: u32,
) -> Result<u32, EncoderError> {
    let n = x.len();
    let orig_fill = fill;
    let mut fill = fill;

    // Special case for one sample.
    if n == 1 {
        return quant_band_n1(ctx, coder, x, Some(y), lowband_out);
    }

    let sctx = compute_theta(
        ctx, coder, x, y, &mut b, bblocks, bblocks, lm, true, &mut fill,
    )?;
    let SplitCtx {
        inv,
        imid,
        iside,
        delta,
        itheta,
        qalloc,
    } = sctx;
    let mid = (1.0 / 32768.0) * imid as f32;
    let side = (1.0 / 32768.0) * iside as f32;
    let mut cm;

    // For two samples the mid/side orthogonality lets the side be coded
    // with a single sign bit.
    if n == 2 {
        let mut sbits = 0;
        if itheta != 0 && itheta != 16384 {
            sbits = 1 << BITRES;
        }
        let mbits = b - sbits;
        ctx.remaining_bits -= qalloc + sbits;

        let swapped = itheta > 8192;
        let mut sign = 0_i32;
        if sbits != 0 {
            let encoded_sign = if coder.is_encoder() {
                let (x2, y2): (&[f32], &[f32]) = if swapped { (y, x) } else { (x, y) };
                u32::from(x2[0] * y2[1] - x2[1] * y2[0] < 0.0)
            } else {
                0
            };
            sign = coder.bits(encoded_sign, 1)? as i32;
        }
        let sign = 1 - 2 * sign;

        {
            let x2: &mut [f32] = if swapped { &mut *y } else { &mut *x };
            // orig_fill is used so the side folds even when itheta==16384
            // cleared the low bits.
            cm = quant_band(
                ctx,
                coder,
                x2,
                mbits,
                bblocks,
                lowband,
                lm,
                lowband_out,
                1.0,
                orig_fill,
            )?;
        }
        // The side is the mid rotated by 90 degrees.
        {
            let (x2, y2): (&mut [f32], &mut [f32]) = if swapped {
                (&mut *y, &mut *x)
            } else {
                (&mut *x, &mut *y)
            };
            y2[0] = -(sign as f32) * x2[1];
            y2[1] = sign as f32 * x2[0];
        }

        if ctx.resynth {
            x[0] *= mid;
            x[1] *= mid;
            y[0] *= side;
            y[1] *= side;
            let tmp = x[0];
            x[0] = tmp - y[0];
            y[0] = tmp + y[0];
            let tmp = x[1];
            x[1] = tmp - y[1];
            y[1] = tmp + y[1];
        }
    } else {
        // "Normal" split code.
        let mut mbits = i32::max(0, i32::min(b, (b - delta) / 2));
        let mut sbits = b - mbits;
        ctx.remaining_bits -= qalloc;

        let rebalance = ctx.remaining_bits;
        if mbits >= sbits {
            // The mid gets no gain: the normalized mid is needed for later
            // folding.
            cm = quant_band(
                ctx, coder, x, mbits, bblocks, lowband, lm, lowband_out, 1.0, fill,
            )?;
            let rebalance = mbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 0 {
                sbits += rebalance - (3 << BITRES);
            }
            // The high fill bits are always zero in a stereo split, so the
            // side never folds.
            cm |= quant_band(
                ctx,
                coder,
                y,
                sbits,
                bblocks,
                None,
                lm,
                None,
                side,
                fill >> bblocks,
            )?;
        } else {
            cm = quant_band(
                ctx,
                coder,
                y,
                sbits,
                bblocks,
                None,
                lm,
                None,
                side,
                fill >> bblocks,
            )?;
            let rebalance = sbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 16384 {
                mbits += rebalance - (3 << BITRES);
            }
            cm |= quant_band(
                ctx, coder, x, mbits, bblocks, lowband, lm, lowband_out, 1.0, fill,
            )?;
        }

        if ctx.resynth {
            stereo_merge(x, y, mid);
        }
    }

    if ctx.resynth && inv {
        y.iter_mut().for_each(|v| *v = -*v);
    }
    Ok(cm)
}

/// Duplicates enough of the first band's folding data so the second band can
/// fold even when it is wider. Only does anything above a hybrid start band.
fn special_hybrid_folding(norm: &mut [f32], norm2: Option<&mut [f32]>, start: usize, lm: usize) {
    let n1 = band_width(start) << lm;
    let n2 = band_width(start + 1) << lm;
    if n2 > n1 {
        norm.copy_within(2 * n1 - n2..n1, n1);
        if let Some(norm2) = norm2 {
            norm2.copy_within(2 * n1 - n2..n1, n1);
        }
    }
}

/// Codes all bands, in order, through the shared range coder.
///
/// Returns the updated noise seed.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_all_bands(
    coder: &mut Coder<'_, '_>,
    mode: &Mode,
    start: usize,
    end: usize,
    x_: &mut [f32],
    mut y_: Option<&mut [f32]>,
    collapse_masks: &mut [u8],
    band_e: &[f32],
    pulses: &[i32; NB_BANDS],
    short_blocks: bool,
    spread: usize,
    mut dual_stereo: bool,
    intensity: usize,
    tf_res: &[i32; NB_BANDS],
    total_bits_q3: i32,
    mut balance: i32,
    lm: usize,
    coded_bands: usize,
    seed: u32,
    disable_inv: bool,
) -> Result<u32, EncoderError> {
    let m = 1 << lm;
    let blocks = if short_blocks { m } else { 1 };
    let channels = 1 + usize::from(y_.is_some());
    let norm_offset = m * EBANDS[start];
    let norm_len = m * EBANDS[NB_BANDS - 1] - norm_offset;
    let encode = coder.is_encoder();
    let resynth = !encode;

    if y_.is_none() {
        dual_stereo = false;
    }

    // The folding buffer holds every coded band's normalized shape except
    // the last band, which nothing folds from.
    let mut norm = vec![0_f32; norm_len];
    let mut norm2 = vec![0_f32; if channels == 2 { norm_len } else { 0 }];

    let mut ctx = BandCtx {
        mode,
        resynth,
        band: 0,
        intensity,
        spread,
        tf_change: 0,
        remaining_bits: 0,
        band_e,
        seed,
        // Avoid injecting noise in the first band on transients.
        avoid_split_noise: blocks > 1,
        disable_inv,
    };

    let mut lowband_offset = 0;
    let mut update_lowband = true;

    for i in start..end {
        ctx.band = i;
        let last = i == end - 1;
        let n = m * band_width(i);
        let x_lo = m * EBANDS[i];
        let out_offset = x_lo - norm_offset;
        let tell = coder.tell_frac() as i32;

        // Compute how many bits to give to this band.
        if i != start {
            balance -= tell;
        }
        let remaining_bits = total_bits_q3 - tell - 1;
        ctx.remaining_bits = remaining_bits;
        let band_bits = if i <= coded_bands - 1 {
            let curr_balance = balance / i32::min(3, (coded_bands - i) as i32);
            i32::max(
                0,
                i32::min(
                    16383,
                    i32::min(remaining_bits + 1, pulses[i] + curr_balance),
                ),
            )
        } else {
            0
        };

        if resynth
            && (m * EBANDS[i] >= m * EBANDS[start] + n || i == start + 1)
            && (update_lowband || lowband_offset == 0)
        {
            lowband_offset = i;
        }
        if i == start + 1 {
            let norm2_ref = if channels == 2 {
                Some(norm2.as_mut_slice())
            } else {
                None
            };
            special_hybrid_folding(&mut norm, norm2_ref, start, lm);
        }

        ctx.tf_change = tf_res[i];

        // A conservative estimate of the collapse masks of the bands the
        // fold would copy from.
        let mut effective_lowband = None;
        let mut x_cm: u32;
        let mut y_cm: u32;
        if lowband_offset != 0 && (spread != SPREAD_AGGRESSIVE || blocks > 1 || ctx.tf_change < 0)
        {
            // This ensures the fold never repeats spectral content within
            // one band.
            let eff = if m * EBANDS[lowband_offset] >= norm_offset + n {
                m * EBANDS[lowband_offset] - norm_offset - n
            } else {
                0
            };
            effective_lowband = Some(eff);

            let mut fold_start = lowband_offset;
            loop {
                fold_start -= 1;
                if m * EBANDS[fold_start] <= eff + norm_offset {
                    break;
                }
            }
            let mut fold_end = lowband_offset - 1;
            loop {
                fold_end += 1;
                if !(fold_end < i && m * EBANDS[fold_end] < eff + norm_offset + n) {
                    break;
                }
            }

            x_cm = 0;
            y_cm = 0;
            let mut fold_i = fold_start;
            loop {
                x_cm |= u32::from(collapse_masks[fold_i * channels]);
                y_cm |= u32::from(collapse_masks[fold_i * channels + channels - 1]);
                fold_i += 1;
                if fold_i >= fold_end {
                    break;
                }
            }
        } else {
            // The LCG fold makes (almost) every block non-zero.
            x_cm = (1 << blocks) - 1;
            y_cm = (1 << blocks) - 1;
        }

        if dual_stereo && i == intensity {
            // Switch off dual stereo to do intensity.
            dual_stereo = false;
            if resynth {
                (0..out_offset).into_iter().for_each(|j| {
                    norm[j] = 0.5 * (norm[j] + norm2[j]);
                });
            }
        }

        // The folding source is copied out up front: with a hybrid start
        // band it can reach past the output offset, which the borrow rules
        // (rightly) refuse to alias.
        let lowband_vec: Option<Vec<f32>> =
            effective_lowband.map(|e| norm[e..e + n].to_vec());
        let lowband2_vec: Option<Vec<f32>> = if dual_stereo {
            effective_lowband.map(|e| norm2[e..e + n].to_vec())
        } else {
            None
        };

        if dual_stereo {
            let y = match y_.as_deref_mut() {
                Some(y) => y,
                None => return Err(EncoderError::InternalError("dual stereo without stereo")),
            };
            x_cm = quant_band(
                &mut ctx,
                coder,
                &mut x_[x_lo..x_lo + n],
                band_bits / 2,
                blocks,
                lowband_vec.as_deref(),
                lm as i32,
                if last {
                    None
                } else {
                    Some(&mut norm[out_offset..out_offset + n])
                },
                1.0,
                x_cm,
            )?;
            y_cm = quant_band(
                &mut ctx,
                coder,
                &mut y[x_lo..x_lo + n],
                band_bits / 2,
                blocks,
                lowband2_vec.as_deref(),
                lm as i32,
                if last {
                    None
                } else {
                    Some(&mut norm2[out_offset..out_offset + n])
                },
                1.0,
                y_cm,
            )?;
        } else {
            let lowband_out = if last {
                None
            } else {
                Some(&mut norm[out_offset..out_offset + n])
            };
            match y_.as_deref_mut() {
                Some(y) => {
                    x_cm = quant_band_stereo(
                        &mut ctx,
                        coder,
                        &mut x_[x_lo..x_lo + n],
                        &mut y[x_lo..x_lo + n],
                        band_bits,
                        blocks,
                        lowband_vec.as_deref(),
                        lm as i32,
                        lowband_out,
                        x_cm | y_cm,
                    )?;
                }
                None => {
                    x_cm = quant_band(
                        &mut ctx,
                        coder,
                        &mut x_[x_lo..x_lo + n],
                        band_bits,
                        blocks,
                        lowband_vec.as_deref(),
                        lm as i32,
                        lowband_out,
                        1.0,
                        x_cm | y_cm,
                    )?;
                }
            }
            y_cm = x_cm;
        }

        collapse_masks[i * channels] = x_cm as u8;
        collapse_masks[i * channels + channels - 1] = y_cm as u8;
        balance += pulses[i] + tell;

        // Keep updating the folding position only while the depth stays
        // above one bit per sample.
        update_lowband = band_bits > (n as i32) << BITRES;
        // Noise avoidance on splits only matters before anything can fold.
        ctx.avoid_split_noise = false;
    }

    Ok(ctx.seed)
}

/// Codes the per-band time-frequency resolution flags.
///
/// On encode, `tf_res` carries the analysis decision per band and
/// `tf_select` the preferred table column; on decode both are derived from
/// the stream. Either way `tf_res` afterwards holds the resolution change
/// each band applies.
#[allow(clippy::too_many_arguments)]
pub(crate) fn tf_code(
    coder: &mut Coder<'_, '_>,
    start: usize,
    end: usize,
    is_transient: bool,
    tf_res: &mut [i32; NB_BANDS],
    lm: usize,
    tf_select_in: i32,
    budget_bits: u32,
) -> Result<(), EncoderError> {
    use crate::celt::tables::TF_SELECT_TABLE;

    let mut budget = budget_bits;
    let mut tell = coder.tell();
    let mut logp: u32 = if is_transient { 2 } else { 4 };

    // Reserve space to code the tf_select decision.
    let tf_select_rsv = lm > 0 && tell + logp + 1 <= budget;
    if tf_select_rsv {
        budget -= 1;
    }

    let transient = usize::from(is_transient);
    let mut curr = 0_i32;
    let mut tf_changed = 0_i32;
    for i in start..end {
        if tell + logp <= budget {
            let bit = coder.bit_logp((tf_res[i] ^ curr) != 0, logp)?;
            curr ^= i32::from(bit);
            tell = coder.tell();
            tf_changed |= curr;
        }
        tf_res[i] = curr;
        logp = if is_transient { 4 } else { 5 };
    }

    let mut tf_select = 0_i32;
    if tf_select_rsv
        && TF_SELECT_TABLE[lm][4 * transient + tf_changed as usize]
            != TF_SELECT_TABLE[lm][4 * transient + 2 + tf_changed as usize]
    {
        tf_select = i32::from(coder.bit_logp(tf_select_in != 0, 1)?);
    }

    (start..end).into_iter().for_each(|i| {
        tf_res[i] = i32::from(
            TF_SELECT_TABLE[lm][4 * transient + 2 * tf_select as usize + tf_res[i] as usize],
        );
    });
    Ok(())
}

/// Injects noise into the transient bands whose every sub-block collapsed,
/// bounded by the quieter of the two previous frames.
#[allow(clippy::too_many_arguments)]
pub(crate) fn anti_collapse(
    x_: &mut [f32],
    collapse_masks: &[u8],
    lm: usize,
    channels: usize,
    bins_per_channel: usize,
    start: usize,
    end: usize,
    log_e: &[f32],
    prev1_log_e: &[f32],
    prev2_log_e: &[f32],
    pulses: &[i32; NB_BANDS],
    mut seed: u32,
    encode: bool,
) {
    for i in start..end {
        let n0 = band_width(i);
        let depth = ((1 + pulses[i]) / n0 as i32) >> lm;
        let thresh = 0.5 * fast_exp2(-0.125 * depth as f32);
        let sqrt_1 = 1.0 / ((n0 << lm) as f32).sqrt();

        for c in 0..channels {
            let mut prev1 = prev1_log_e[c * NB_BANDS + i];
            let mut prev2 = prev2_log_e[c * NB_BANDS + i];
            if !encode && channels == 1 {
                prev1 = f32::max(prev1, prev1_log_e[NB_BANDS + i]);
                prev2 = f32::max(prev2, prev2_log_e[NB_BANDS + i]);
            }
            let ediff = f32::max(0.0, log_e[c * NB_BANDS + i] - f32::min(prev1, prev2));

            let mut r = 2.0 * fast_exp2(-ediff);
            if lm == 3 {
                r *= 1.41421356;
            }
            r = f32::min(thresh, r);
            r *= sqrt_1;

            let base = c * bins_per_channel + (EBANDS[i] << lm);
            let mut renormalize = false;
            (0..1 << lm).into_iter().for_each(|k| {
                // Detect collapse.
                if collapse_masks[i * channels + c] & (1 << k) == 0 {
                    // Fill with noise.
                    (0..n0).into_iter().for_each(|j| {
                        seed = lcg_rand(seed);
                        x_[base + (j << lm) + k] = if seed & 0x8000 != 0 { r } else { -r };
                    });
                    renormalize = true;
                }
            });
            // We just added some energy, so renormalise.
            if renormalize {
                renormalise_vector(&mut x_[base..base + (n0 << lm)], 1.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use nanorand::RNG;

    use super::*;
    use crate::celt::mode::compute_caps;
    use crate::celt::rate::compute_allocation;
    use crate::celt::{SPREAD_NORMAL, SPREAD_NONE};
    use crate::range_coder::{RangeDecoder, RangeEncoder, Tell};

    #[test]
    fn test_haar1_is_self_inverse() {
        let mut rng = nanorand::WyRand::new_seed(11);
        let original: Vec<f32> = (0..64)
            .into_iter()
            .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0)
            .collect();
        let mut x = original.clone();
        haar1(&mut x, 32, 2);
        haar1(&mut x, 32, 2);
        x.iter().zip(original.iter()).for_each(|(a, b)| {
            assert!((a - b).abs() < 1e-5);
        });
    }

    #[test]
    fn test_hadamard_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(12);
        [(8_usize, 2_usize), (12, 4), (4, 8)].iter().for_each(|&(n0, stride)| {
            let original: Vec<f32> = (0..n0 * stride)
                .into_iter()
                .map(|_| rng.generate_range::<u32>(0, 2000) as f32 / 1000.0 - 1.0)
                .collect();
            [true, false].iter().for_each(|&hadamard| {
                let mut x = original.clone();
                deinterleave_hadamard(&mut x, n0, stride, hadamard);
                interleave_hadamard(&mut x, n0, stride, hadamard);
                x.iter().zip(original.iter()).for_each(|(a, b)| {
                    assert!((a - b).abs() < 1e-6);
                });
            });
        });
    }

    #[test]
    fn test_normalise_denormalise_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(13);
        let lm = 2;
        let bins = EBANDS[NB_BANDS] << lm;
        let freq: Vec<f32> = (0..bins)
            .into_iter()
            .map(|_| rng.generate_range::<u32>(0, 65536) as f32 - 32768.0)
            .collect();

        let mut band_e = vec![0_f32; NB_BANDS];
        compute_band_energies(&freq, &mut band_e, NB_BANDS, lm, 1, bins);
        let mut x = vec![0_f32; bins];
        normalise_bands(&freq, &mut x, &band_e, NB_BANDS, lm, 1, bins);

        // Every band is unit norm now.
        (0..NB_BANDS).into_iter().for_each(|i| {
            let lo = EBANDS[i] << lm;
            let hi = EBANDS[i + 1] << lm;
            let e: f32 = x[lo..hi].iter().map(|v| v * v).sum();
            assert!((e - 1.0).abs() < 1e-3, "band {} energy {}", i, e);
        });

        // Denormalising with the exact log energies returns the spectrum.
        let mut band_log_e = vec![0_f32; NB_BANDS];
        (0..NB_BANDS).into_iter().for_each(|i| {
            band_log_e[i] = crate::math::fast_log2(band_e[i]) - E_MEANS[i];
        });
        let mut rec = vec![0_f32; bins];
        denormalise_bands(&x, &mut rec, &band_log_e, 0, NB_BANDS, lm, 0, false);
        rec.iter().zip(freq.iter()).for_each(|(a, b)| {
            assert!((a - b).abs() < 2e-2 * (1.0 + b.abs()), "{} vs {}", a, b);
        });
    }

    /// Runs the full band loop encode-then-decode and checks the §8-style
    /// invariants: identical collapse masks on bands with pulses, matching
    /// final ranges and a decoded shape close to the coded one.
    fn band_loop_case(channels: usize, lm: usize, total_bytes: usize, transient: bool, seed: u64) {
        let mut rng = nanorand::WyRand::new_seed(seed);
        let mode = Mode::new();
        let end = NB_BANDS;
        let bins = EBANDS[NB_BANDS] << lm;

        // A random normalized spectrum.
        let mut x = vec![0_f32; bins];
        let mut y = vec![0_f32; bins];
        let mut band_e = vec![0_f32; 2 * NB_BANDS];
        (0..channels).into_iter().for_each(|c| {
            let target: &mut Vec<f32> = if c == 0 { &mut x } else { &mut y };
            target.iter_mut().for_each(|v| {
                *v = rng.generate_range::<u32>(0, 65536) as f32 - 32768.0;
            });
        });
        let joined: Vec<f32> = x.iter().chain(y.iter()).copied().collect();
        compute_band_energies(&joined, &mut band_e, end, lm, channels, bins);
        let mut norm_x = vec![0_f32; bins];
        normalise_bands(&x, &mut norm_x, &band_e, end, lm, 1, bins);
        let mut norm_y = vec![0_f32; bins];
        if channels == 2 {
            normalise_bands(&y, &mut norm_y, &band_e[NB_BANDS..], end, lm, 1, bins);
        }

        let total_bits_q3 = (total_bytes as i32 * 8) << 3;
        let caps = compute_caps(lm, channels);
        let offsets = [0_i32; NB_BANDS];
        let tf_res = [0_i32; NB_BANDS];
        let spread = if transient { SPREAD_NONE } else { SPREAD_NORMAL };
        let short_blocks = transient && lm > 0;

        let mut buffer = vec![0_u8; total_bytes];
        let mut enc_masks = vec![0_u8; channels * end];
        let enc_range;
        {
            let mut enc = RangeEncoder::new(&mut buffer);
            let mut coder = Coder::Encode(&mut enc);
            let alloc = compute_allocation(
                0, end, &offsets, &caps, 5, end, false,
                total_bits_q3 - (coder.tell_frac() as i32) - 1,
                channels, lm, &mut coder, end, NB_BANDS - 1,
            )
            .unwrap();
            let mut enc_x = norm_x.clone();
            let mut enc_y = norm_y.clone();
            quant_all_bands(
                &mut coder,
                &mode,
                0,
                end,
                &mut enc_x,
                if channels == 2 { Some(&mut enc_y) } else { None },
                &mut enc_masks,
                &band_e,
                &alloc.pulses,
                short_blocks,
                spread,
                alloc.dual_stereo,
                alloc.intensity,
                &tf_res,
                total_bits_q3,
                alloc.balance,
                lm,
                alloc.coded_bands,
                42,
                false,
            )
            .unwrap();
            enc.done().unwrap();
            enc_range = enc.range();
        }

        let mut dec = RangeDecoder::new(&buffer);
        let mut coder = Coder::Decode(&mut dec);
        let alloc = compute_allocation(
            0, end, &offsets, &caps, 5, end, false,
            total_bits_q3 - (coder.tell_frac() as i32) - 1,
            channels, lm, &mut coder, end, NB_BANDS - 1,
        )
        .unwrap();
        let mut dec_x = vec![0_f32; bins];
        let mut dec_y = vec![0_f32; bins];
        let mut dec_masks = vec![0_u8; channels * end];
        quant_all_bands(
            &mut coder,
            &mode,
            0,
            end,
            &mut dec_x,
            if channels == 2 { Some(&mut dec_y) } else { None },
            &mut dec_masks,
            &band_e,
            &alloc.pulses,
            short_blocks,
            spread,
            alloc.dual_stereo,
            alloc.intensity,
            &tf_res,
            total_bits_q3,
            alloc.balance,
            lm,
            alloc.coded_bands,
            42,
            false,
        )
        .unwrap();

        assert_eq!(dec.range(), enc_range, "final range diverged");

        // Low bands with a real budget must have received pulses.
        (0..4).into_iter().for_each(|i| {
            if alloc.pulses[i] > 8 && i < alloc.coded_bands {
                (0..channels).into_iter().for_each(|c| {
                    assert_ne!(dec_masks[i * channels + c], 0, "band {} collapsed", i);
                });
            }
        });

        // The decoded mono shape correlates with the input in the bands
        // that got a meaningful budget.
        if channels == 1 {
            (0..4).into_iter().for_each(|i| {
                let lo = EBANDS[i] << lm;
                let hi = EBANDS[i + 1] << lm;
                let dot: f32 = dec_x[lo..hi]
                    .iter()
                    .zip(norm_x[lo..hi].iter())
                    .map(|(a, b)| a * b)
                    .sum();
                assert!(dot > 0.5, "band {} correlation {}", i, dot);
            });
        }

        dec_x
            .iter()
            .chain(dec_y.iter())
            .for_each(|v| assert!(v.is_finite()));
    }

    #[test]
    fn test_tf_code_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(0x7F7F);
        (0..200).into_iter().for_each(|_| {
            let lm = rng.generate_range::<usize>(0, 4);
            let end = rng.generate_range::<usize>(2, NB_BANDS + 1);
            let is_transient = lm > 0 && rng.generate_range::<u32>(0, 2) == 0;
            let tf_select = rng.generate_range::<u32>(0, 2) as i32;
            let mut wanted = [0_i32; NB_BANDS];
            (0..end).into_iter().for_each(|i| {
                wanted[i] = rng.generate_range::<u32>(0, 2) as i32;
            });

            let mut buffer = vec![0_u8; 64];
            let budget = (buffer.len() * 8) as u32;
            let mut enc_res = wanted;
            {
                let mut enc = RangeEncoder::new(&mut buffer);
                let mut coder = Coder::Encode(&mut enc);
                tf_code(
                    &mut coder, 0, end, is_transient, &mut enc_res, lm, tf_select, budget,
                )
                .unwrap();
                enc.done().unwrap();
            }

            let mut dec = RangeDecoder::new(&buffer);
            let mut coder = Coder::Decode(&mut dec);
            let mut dec_res = [0_i32; NB_BANDS];
            tf_code(
                &mut coder, 0, end, is_transient, &mut dec_res, lm, 0, budget,
            )
            .unwrap();

            (0..end).into_iter().for_each(|i| {
                assert_eq!(enc_res[i], dec_res[i], "band {} diverged", i);
            });
        });
    }

    #[test]
    fn test_band_loop_mono_long() {
        band_loop_case(1, 3, 160, false, 21);
        band_loop_case(1, 0, 40, false, 22);
    }

    #[test]
    fn test_band_loop_mono_transient() {
        band_loop_case(1, 2, 80, true, 23);
        band_loop_case(1, 3, 120, true, 24);
    }

    #[test]
    fn test_band_loop_stereo() {
        band_loop_case(2, 3, 240, false, 25);
        band_loop_case(2, 1, 60, false, 26);
        band_loop_case(2, 2, 100, true, 27);
    }
}
