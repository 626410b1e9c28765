//! Implements the shape quantizer: the spreading rotation, the greedy pulse
//! search and the codeword (de)quantization.

use crate::celt::cwrs::{decode_pulses, encode_pulses, pvq_v};
use crate::celt::{EPSILON, SPREAD_NONE};
use crate::encoder_error::EncoderError;
use crate::math::fast_atan2;
use crate::range_coder::{RangeDecoder, RangeEncoder};

const SPREAD_FACTOR: [usize; 3] = [15, 10, 5];

fn exp_rotation1(x: &mut [f32], stride: usize, c: f32, s: f32) {
    let len = x.len();
    let ms = -s;

    (0..len - stride).into_iter().for_each(|i| {
        let x1 = x[i];
        let x2 = x[i + stride];
        x[i + stride] = c * x2 + s * x1;
        x[i] = c * x1 + ms * x2;
    });

    (0..len.saturating_sub(2 * stride))
        .into_iter()
        .rev()
        .for_each(|i| {
            let x1 = x[i];
            let x2 = x[i + stride];
            x[i + stride] = c * x2 + s * x1;
            x[i] = c * x1 + ms * x2;
        });
}

/// Rotates the band to spread (or on decode, un-spread) the coded pulses
/// across bins. The rotation angle shrinks as the pulse density grows.
pub(crate) fn exp_rotation(x: &mut [f32], dir: i32, stride: usize, k: usize, spread: usize) {
    let len = x.len();
    if 2 * k >= len || spread == SPREAD_NONE {
        return;
    }
    let factor = SPREAD_FACTOR[spread - 1];

    let gain = len as f32 / (len + factor * k) as f32;
    let theta = 0.5 * gain * gain;
    let c = (0.5 * std::f32::consts::PI * theta).cos();
    let s = (0.5 * std::f32::consts::PI * (1.0 - theta)).cos();

    // An extra pass with a longer stride spreads the energy further once the
    // band is long enough.
    let mut stride2 = 0;
    if len >= 8 * stride {
        stride2 = 1;
        // This is just a simple (equivalent) way of computing
        // sqrt(len/stride) with rounding.
        while (stride2 * stride2 + stride2) * stride + (stride >> 2) < len {
            stride2 += 1;
        }
    }

    let sublen = len / stride;
    (0..stride).into_iter().for_each(|i| {
        let block = &mut x[i * sublen..(i + 1) * sublen];
        if dir < 0 {
            if stride2 != 0 {
                exp_rotation1(block, stride2, s, c);
            }
            exp_rotation1(block, 1, c, s);
        } else {
            exp_rotation1(block, 1, c, -s);
            if stride2 != 0 {
                exp_rotation1(block, stride2, s, -c);
            }
        }
    });
}

/// Greedy rate-distortion pulse search.
///
/// Takes the (rotated) target shape, returns the pulse vector of L1 norm `k`
/// and its squared norm. The target is clobbered.
fn op_pvq_search(x: &mut [f32], iy: &mut [i32], k: usize) -> f32 {
    let n = x.len();
    let mut signs = vec![1_i32; n];
    let mut y = vec![0_f32; n];

    (0..n).into_iter().for_each(|j| {
        if x[j] < 0.0 {
            signs[j] = -1;
            x[j] = -x[j];
        }
        iy[j] = 0;
    });

    let mut xy = 0_f32;
    let mut yy = 0_f32;
    let mut pulses_left = k as i32;

    // Pre-search by projecting onto the pyramid.
    if k > (n >> 1) {
        let mut sum: f32 = x.iter().sum();
        // If the sum is tiny or not finite, replace the input with a single
        // pulse position. 64 approximates infinity here.
        if !(sum > EPSILON && sum < 64.0) {
            x[0] = 1.0;
            x[1..].iter_mut().for_each(|v| *v = 0.0);
            sum = 1.0;
        }
        // Using k + e with e < 1 guarantees we cannot get more than k pulses.
        let rcp = (k as f32 + 0.8) * (1.0 / sum);
        (0..n).into_iter().for_each(|j| {
            iy[j] = (rcp * x[j]).floor() as i32;
            let yj = iy[j] as f32;
            yy += yj * yj;
            xy += x[j] * yj;
            y[j] = 2.0 * yj;
            pulses_left -= iy[j];
        });
    }
    debug_assert!(pulses_left >= 0);

    // This should never happen, but if it does (e.g. on silence) we put the
    // remaining pulses in the first bin rather than looping for a long time.
    if pulses_left > n as i32 + 3 {
        let tmp = pulses_left as f32;
        yy += tmp * tmp;
        yy += tmp * y[0];
        iy[0] += pulses_left;
        pulses_left = 0;
    }

    (0..pulses_left).into_iter().for_each(|_| {
        let mut best_num = -1e30_f32;
        let mut best_den = 0_f32;
        let mut best_id = 0;
        // The squared magnitude term gets added either way, so hoist it.
        yy += 1.0;
        (0..n).into_iter().for_each(|j| {
            // Trial sums with one more pulse at j; y[] carries a factor of
            // two so the cross term needs no doubling here.
            let rxy = xy + x[j];
            let ryy = yy + y[j];
            // Maximise rxy^2 / ryy without a division.
            let rxy2 = rxy * rxy;
            if best_den * rxy2 > ryy * best_num {
                best_den = ryy;
                best_num = rxy2;
                best_id = j;
            }
        });
        xy += x[best_id];
        yy += y[best_id];
        y[best_id] += 2.0;
        iy[best_id] += 1;
    });

    // Put the original signs back.
    (0..n).into_iter().for_each(|j| {
        if signs[j] < 0 {
            iy[j] = -iy[j];
        }
    });

    yy
}

/// Scales the pulse vector back to a unit-norm (times `gain`) shape.
fn normalise_residual(iy: &[i32], x: &mut [f32], ryy: f32, gain: f32) {
    let g = gain / ryy.sqrt();
    x.iter_mut().zip(iy.iter()).for_each(|(xj, &yj)| {
        *xj = g * yj as f32;
    });
}

/// One bit per sub-block: set when the block received at least one pulse.
fn extract_collapse_mask(iy: &[i32], b: usize) -> u32 {
    if b <= 1 {
        return 1;
    }
    let n0 = iy.len() / b;
    let mut mask = 0_u32;
    (0..b).into_iter().for_each(|i| {
        let mut tmp = 0_i32;
        (0..n0).into_iter().for_each(|j| {
            tmp |= iy[i * n0 + j];
        });
        if tmp != 0 {
            mask |= 1 << i;
        }
    });
    mask
}

/// Quantizes the band shape with `k` pulses and writes the codeword index.
///
/// When `resynth` is set, the shape is replaced by what the decoder will
/// reconstruct; otherwise its content is unspecified afterwards.
#[allow(clippy::too_many_arguments)]
pub(crate) fn alg_quant(
    x: &mut [f32],
    k: usize,
    spread: usize,
    b: usize,
    enc: &mut RangeEncoder<'_>,
    gain: f32,
    resynth: bool,
) -> Result<u32, EncoderError> {
    let n = x.len();
    debug_assert!(k > 0);
    debug_assert!(n > 1);

    let mut iy = vec![0_i32; n];
    exp_rotation(x, 1, b, k, spread);
    let yy = op_pvq_search(x, &mut iy, k);
    enc.encode_uint(encode_pulses(&iy), pvq_v(n, k) as u32)?;

    if resynth {
        normalise_residual(&iy, x, yy, gain);
        exp_rotation(x, -1, b, k, spread);
    }

    Ok(extract_collapse_mask(&iy, b))
}

/// Decodes a codeword index back into the band shape.
pub(crate) fn alg_unquant(
    x: &mut [f32],
    k: usize,
    spread: usize,
    b: usize,
    dec: &mut RangeDecoder<'_>,
    gain: f32,
) -> u32 {
    let n = x.len();
    debug_assert!(k > 0);
    debug_assert!(n > 1);

    let index = dec.decode_uint(pvq_v(n, k) as u32);
    let mut iy = vec![0_i32; n];
    decode_pulses(index, &mut iy, k);
    let ryy: f32 = iy.iter().map(|&v| (v * v) as f32).sum();

    normalise_residual(&iy, x, ryy, gain);
    exp_rotation(x, -1, b, k, spread);
    extract_collapse_mask(&iy, b)
}

/// Rescales a vector to unit L2 norm times `gain`.
pub(crate) fn renormalise_vector(x: &mut [f32], gain: f32) {
    let e: f32 = EPSILON + x.iter().map(|v| v * v).sum::<f32>();
    let g = gain / e.sqrt();
    x.iter_mut().for_each(|v| *v *= g);
}

/// The stereo angle of a band in Q14: 0 for mid only, 16384 for side only.
pub(crate) fn stereo_itheta(x: &[f32], y: &[f32], stereo: bool, n: usize) -> i32 {
    let mut emid = EPSILON;
    let mut eside = EPSILON;

    if stereo {
        (0..n).into_iter().for_each(|i| {
            let m = 0.5 * (x[i] + y[i]);
            let s = 0.5 * (x[i] - y[i]);
            emid += m * m;
            eside += s * s;
        });
    } else {
        emid += x.iter().map(|v| v * v).sum::<f32>();
        eside += y.iter().map(|v| v * v).sum::<f32>();
    }

    let mid = emid.sqrt();
    let side = eside.sqrt();
    // 0.63662 = 2/pi; the angle of the (mid, side) pair.
    (0.5 + 16384.0 * 0.63662 * fast_atan2(mid, side)).floor() as i32
}
