//! Implements the bit allocator.
//!
//! Given one packet budget, the boosts and the trim, the allocator splits the
//! bits of a frame over the bands: so many for the PVQ shapes, so many for
//! fine energy, and a skip boundary above which bands are folded instead of
//! coded. The encoder and the decoder run the same function over the shared
//! range coder, so the outcome is identical on both sides by construction.

use crate::celt::tables::{band_width, ALLOC_VECTORS, EBANDS, LOG2_FRAC_TABLE, LOG_N};
use crate::celt::{Coder, FINE_OFFSET, MAX_FINE_BITS, NB_BANDS};
use crate::encoder_error::EncoderError;
use crate::range_coder::BITRES;

/// Number of interpolation steps between two allocation template rows.
const ALLOC_STEPS: i32 = 6;

/// The allocator's output for one frame.
pub(crate) struct Allocation {
    /// PVQ budget per band, in 1/8 bits.
    pub(crate) pulses: [i32; NB_BANDS],
    /// Fine energy bits per band and channel.
    pub(crate) fine_bits: [i32; NB_BANDS],
    /// Whether the band takes part in the first finalise pass.
    pub(crate) fine_priority: [bool; NB_BANDS],
    /// Bands actually coded; everything above folds.
    pub(crate) coded_bands: usize,
    /// First band coded as intensity stereo (0 when off).
    pub(crate) intensity: usize,
    /// Whether left and right get independent shapes.
    pub(crate) dual_stereo: bool,
    /// Unspent 1/8 bits handed to the band loop for rebalancing.
    pub(crate) balance: i32,
}

/// Codes the per-band dynalloc boosts.
///
/// On encode, `offsets` carries the number of quanta the analysis wants per
/// band; on decode it is ignored. Either way it holds the boost in 1/8 bits
/// afterwards, and the returned total has been carved out of the budget.
#[allow(clippy::too_many_arguments)]
pub(crate) fn code_dynalloc(
    coder: &mut Coder<'_, '_>,
    start: usize,
    end: usize,
    lm: usize,
    channels: usize,
    caps: &[i32; NB_BANDS],
    total_bits_q3: i32,
    offsets: &mut [i32; NB_BANDS],
) -> Result<i32, EncoderError> {
    let mut dynalloc_logp: u32 = 6;
    let mut total_boost = 0_i32;

    for band in start..end {
        let width = (channels * (band_width(band) << lm)) as i32;
        // Six bits per quantum, but no more than one bit per coefficient and
        // no less than the width floor.
        let quanta = i32::min(width << BITRES, i32::max(6 << BITRES, width));

        let mut dynalloc_loop_logp = dynalloc_logp;
        let mut boost = 0_i32;
        let mut steps = 0_i32;
        while coder.tell_frac() as i32 + ((dynalloc_loop_logp as i32) << BITRES)
            < total_bits_q3 - total_boost
            && boost < caps[band]
        {
            let flag = coder.bit_logp(steps < offsets[band], dynalloc_loop_logp)?;
            if !flag {
                break;
            }
            boost += quanta;
            total_boost += quanta;
            dynalloc_loop_logp = 1;
            steps += 1;
        }
        // Making dynalloc more likely.
        if steps > 0 {
            dynalloc_logp = u32::max(2, dynalloc_logp - 1);
        }
        offsets[band] = boost;
    }

    Ok(total_boost)
}

/// Computes (and codes the coupled parts of) the frame's bit allocation.
#[allow(clippy::too_many_arguments)]
pub(crate) fn compute_allocation(
    start: usize,
    end: usize,
    offsets: &[i32; NB_BANDS],
    caps: &[i32; NB_BANDS],
    alloc_trim: i32,
    intensity_in: usize,
    dual_stereo_in: bool,
    total: i32,
    channels: usize,
    lm: usize,
    coder: &mut Coder<'_, '_>,
    prev_coded_bands: usize,
    signal_bandwidth: usize,
) -> Result<Allocation, EncoderError> {
    let c = channels as i32;
    let mut total = i32::max(total, 0);
    let mut skip_start = start;

    // Reserve a bit to signal the end of manually skipped bands.
    let skip_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
    total -= skip_rsv;

    // Reserve bits for the intensity and dual stereo parameters.
    let mut intensity_rsv = 0_i32;
    let mut dual_stereo_rsv = 0_i32;
    if channels == 2 {
        intensity_rsv = i32::from(LOG2_FRAC_TABLE[end - start]);
        if intensity_rsv > total {
            intensity_rsv = 0;
        } else {
            total -= intensity_rsv;
            dual_stereo_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
            total -= dual_stereo_rsv;
        }
    }

    let mut thresh = [0_i32; NB_BANDS];
    let mut trim_offset = [0_i32; NB_BANDS];
    for band in start..end {
        let n = band_width(band) as i32;
        // Below this threshold the band is sure to get no PVQ bits.
        thresh[band] = i32::max(c << BITRES, (3 * n << lm << BITRES) >> 4);
        // Tilt of the allocation curve.
        trim_offset[band] = c * n * (alloc_trim - 5 - lm as i32) * (end as i32 - band as i32 - 1)
            * (1 << (lm as u32 + BITRES))
            >> 6;
        // Giving less resolution to single-bin bands because they get more
        // benefit from having one coarse value per coefficient.
        if (n << lm) == 1 {
            trim_offset[band] -= c << BITRES;
        }
    }

    // Bisect over the allocation template for the largest row that fits.
    let template_bits = |row: usize, band: usize| -> i32 {
        let n = band_width(band) as i32;
        let bits = c * n * i32::from(ALLOC_VECTORS[row][band]) << lm >> 2;
        if bits > 0 {
            i32::max(0, bits + trim_offset[band])
        } else {
            bits
        }
    };

    let mut lo = 1_i32;
    let mut hi = ALLOC_VECTORS.len() as i32 - 1;
    while lo <= hi {
        let mid = (lo + hi) >> 1;
        let mut psum = 0_i32;
        let mut done = false;
        for band in (start..end).rev() {
            let bits = template_bits(mid as usize, band) + offsets[band];
            if bits >= thresh[band] || done {
                done = true;
                psum += i32::min(bits, caps[band]);
            } else if bits >= c << BITRES {
                psum += c << BITRES;
            }
        }
        if psum > total {
            hi = mid - 1;
        } else {
            lo = mid + 1;
        }
    }
    let hi = lo as usize;
    let lo = (lo - 1) as usize;

    let mut bits1 = [0_i32; NB_BANDS];
    let mut bits2 = [0_i32; NB_BANDS];
    for band in start..end {
        let mut b1 = template_bits(lo, band);
        let mut b2 = if hi >= ALLOC_VECTORS.len() {
            caps[band]
        } else {
            template_bits(hi, band)
        };
        if b1 > 0 {
            b1 += offsets[band];
        }
        b2 += offsets[band];
        if offsets[band] > 0 {
            skip_start = band;
        }
        b2 = i32::max(0, b2 - b1);
        bits1[band] = b1;
        bits2[band] = b2;
    }

    interp_bits2pulses(
        start,
        end,
        skip_start,
        &bits1,
        &bits2,
        &thresh,
        caps,
        total,
        skip_rsv,
        intensity_in,
        intensity_rsv,
        dual_stereo_in,
        dual_stereo_rsv,
        channels,
        lm,
        coder,
        prev_coded_bands,
        signal_bandwidth,
    )
}

#[allow(clippy::too_many_arguments)]
fn interp_bits2pulses(
    start: usize,
    end: usize,
    skip_start: usize,
    bits1: &[i32; NB_BANDS],
    bits2: &[i32; NB_BANDS],
    thresh: &[i32; NB_BANDS],
    caps: &[i32; NB_BANDS],
    mut total: i32,
    skip_rsv: i32,
    intensity_in: usize,
    mut intensity_rsv: i32,
    dual_stereo_in: bool,
    mut dual_stereo_rsv: i32,
    channels: usize,
    lm: usize,
    coder: &mut Coder<'_, '_>,
    prev_coded_bands: usize,
    signal_bandwidth: usize,
) -> Result<Allocation, EncoderError> {
    let c = channels as i32;
    let stereo = if channels == 2 { 1 } else { 0 };
    let alloc_floor = c << BITRES;
    let log_m = (lm as i32) << BITRES;

    let mut bits = [0_i32; NB_BANDS];
    let mut ebits = [0_i32; NB_BANDS];
    let mut fine_priority = [false; NB_BANDS];

    // Find the interpolation point between the two rows that fills the
    // budget as closely as possible.
    let mut lo = 0_i32;
    let mut hi = 1 << ALLOC_STEPS;
    for _ in 0..ALLOC_STEPS {
        let mid = (lo + hi) >> 1;
        let mut psum = 0_i32;
        let mut done = false;
        for band in (start..end).rev() {
            let tmp = bits1[band] + (mid * bits2[band] >> ALLOC_STEPS);
            if tmp >= thresh[band] || done {
                done = true;
                psum += i32::min(tmp, caps[band]);
            } else if tmp >= alloc_floor {
                psum += alloc_floor;
            }
        }
        if psum > total {
            hi = mid;
        } else {
            lo = mid;
        }
    }

    let mut psum = 0_i32;
    let mut done = false;
    for band in (start..end).rev() {
        let mut tmp = bits1[band] + (lo * bits2[band] >> ALLOC_STEPS);
        if tmp < thresh[band] && !done {
            tmp = if tmp >= alloc_floor { alloc_floor } else { 0 };
        } else {
            done = true;
        }
        tmp = i32::min(tmp, caps[band]);
        bits[band] = tmp;
        psum += tmp;
    }

    // Decide which bands to skip, walking from the top down. Every candidate
    // costs one signalled bit.
    let mut coded_bands = end;
    loop {
        let band = coded_bands - 1;
        // Never skip the first band nor a band boosted by dynalloc: coding
        // the skip bit there could only waste the bits it redistributes.
        if band <= skip_start {
            total += skip_rsv;
            break;
        }

        // The left-over bits this band would inherit, including what was
        // stolen back from higher skipped bands.
        let coded_width = (EBANDS[coded_bands] - EBANDS[start]) as i32;
        let mut left = total - psum;
        let percoeff = left / coded_width;
        left -= coded_width * percoeff;
        let rem = i32::max(left - (EBANDS[band] - EBANDS[start]) as i32, 0);
        let band_width_bins = (EBANDS[coded_bands] - EBANDS[band]) as i32;
        let mut band_bits = bits[band] + percoeff * band_width_bins + rem;

        // Only code a skip decision above the threshold; below it the band
        // is force-skipped so the skip flag itself stays affordable.
        if band_bits >= i32::max(thresh[band], alloc_floor + (1 << BITRES)) {
            let stop = if coder.is_encoder() {
                // Hysteresis keeps bands from flickering in and out.
                let depth_threshold = if coded_bands > 17 {
                    if band < prev_coded_bands {
                        7
                    } else {
                        9
                    }
                } else {
                    0
                };
                let keep = coded_bands <= start + 2
                    || (band_bits > (depth_threshold * band_width_bins << lm << BITRES) >> 4
                        && band <= signal_bandwidth);
                coder.bit_logp(keep, 1)?
            } else {
                coder.bit_logp(false, 1)?
            };
            if stop {
                break;
            }
            // We used a bit for the skip flag.
            psum += 1 << BITRES;
            band_bits -= 1 << BITRES;
        }

        // Reallocate the skipped band's bits to the lower bands.
        psum -= bits[band] + intensity_rsv;
        if intensity_rsv > 0 {
            intensity_rsv = i32::from(LOG2_FRAC_TABLE[band - start]);
        }
        psum += intensity_rsv;
        if band_bits >= alloc_floor {
            // Enough for one fine energy bit per channel.
            psum += alloc_floor;
            bits[band] = alloc_floor;
        } else {
            bits[band] = 0;
        }
        coded_bands -= 1;
    }
    debug_assert!(coded_bands > start);

    // Code the intensity and dual stereo parameters.
    let intensity = if intensity_rsv > 0 {
        let clamped = usize::min(usize::max(intensity_in, start), coded_bands);
        let coded = coder.uint(
            (clamped - start) as u32,
            (coded_bands + 1 - start) as u32,
        )?;
        start + coded as usize
    } else {
        0
    };
    if intensity <= start {
        total += dual_stereo_rsv;
        dual_stereo_rsv = 0;
    }
    let dual_stereo = if dual_stereo_rsv > 0 {
        coder.bit_logp(dual_stereo_in, 1)?
    } else {
        false
    };

    // Hand out the remaining bits, one eighth-bit per coefficient.
    let coded_width = (EBANDS[coded_bands] - EBANDS[start]) as i32;
    let mut left = total - psum;
    let percoeff = left / coded_width;
    left -= coded_width * percoeff;
    for band in start..coded_bands {
        bits[band] += percoeff * band_width(band) as i32;
    }
    for band in start..coded_bands {
        let tmp = i32::min(left, band_width(band) as i32);
        bits[band] += tmp;
        left -= tmp;
    }

    // Split each band's allocation between the shape and fine energy.
    let mut balance = 0_i32;
    for band in start..coded_bands {
        let n0 = band_width(band) as i32;
        let n = n0 << lm;
        let bit = bits[band] + balance;
        let mut excess = 0_i32;

        if n > 1 {
            excess = i32::max(bit - caps[band], 0);
            bits[band] = bit - excess;

            // Compensate for the extra degree of freedom when a stereo pair
            // shares one angle.
            let den = c * n
                + i32::from(channels == 2 && n > 2 && !dual_stereo && band < intensity);
            let nclogn = den * (LOG_N[band] + log_m);

            // Offset the fine bits by log2(n)/2 plus a constant compared to
            // their fair share of the band total.
            let mut offset = (nclogn >> 1) - den * FINE_OFFSET;

            // n = 2 is the only point that doesn't match the curve.
            if n == 2 {
                offset += den << BITRES >> 2;
            }

            // Bias towards one or two fine bits when the band is short.
            if bits[band] + offset < (den * 2) << BITRES {
                offset += nclogn >> 2;
            } else if bits[band] + offset < (den * 3) << BITRES {
                offset += nclogn >> 3;
            }

            // Divide with rounding.
            ebits[band] = i32::max(0, bits[band] + offset + (den << (BITRES - 1)));
            ebits[band] = (ebits[band] / den) >> BITRES;

            // Make sure not to bust.
            if c * ebits[band] > bits[band] >> BITRES {
                ebits[band] = bits[band] >> stereo >> BITRES;
            }

            // More than eight is useless, that's as far as the remainder
            // resolution goes.
            ebits[band] = i32::min(ebits[band], MAX_FINE_BITS);

            // Rounded-down or capped bands get priority in the final pass.
            fine_priority[band] = ebits[band] * (den << BITRES) >= bits[band] + offset;

            // Remove the fine bits; the rest goes to the shape.
            bits[band] -= c * ebits[band] << BITRES;
        } else {
            // For one-bin bands everything but a sign bit goes to fine.
            excess = i32::max(bit - (c << BITRES), 0);
            bits[band] = bit - excess;
            ebits[band] = 0;
            fine_priority[band] = true;
        }

        // Fine energy cannot take part in the running rebalance below, so
        // overshoot is converted to extra fine bits here.
        if excess > 0 {
            let extra_fine =
                i32::min(excess >> (stereo + BITRES as i32), MAX_FINE_BITS - ebits[band]);
            ebits[band] += extra_fine;
            let extra_bits = extra_fine * c << BITRES;
            fine_priority[band] = extra_bits >= excess - balance;
            excess -= extra_bits;
        }
        balance = excess;

        debug_assert!(bits[band] >= 0);
        debug_assert!(ebits[band] >= 0);
    }

    // Skipped bands spend whatever they kept on fine energy.
    for band in coded_bands..end {
        ebits[band] = bits[band] >> stereo >> BITRES;
        debug_assert!(c * ebits[band] << BITRES == bits[band]);
        bits[band] = 0;
        fine_priority[band] = ebits[band] < 1;
    }

    Ok(Allocation {
        pulses: bits,
        fine_bits: ebits,
        fine_priority,
        coded_bands,
        intensity,
        dual_stereo,
        balance,
    })
}
