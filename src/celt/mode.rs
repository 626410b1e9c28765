//! The mode configuration shared by the encoder and the decoder.
//!
//! A mode bundles everything that only depends on the sample rate and frame
//! family: the low-overlap window, the MDCT bank, the per-band rate caps and
//! the bits-to-pulses cache. The cache is computed at instantiation instead
//! of being shipped as data; it is a pure function of the band layout.

use std::f64::consts::PI;

use crate::celt::cwrs::pvq_v;
use crate::celt::mdct::Mdct;
use crate::celt::tables::{band_width, STATIC_CAPS};
use crate::celt::{MAX_LM, NB_BANDS, OVERLAP};
use crate::math::ilog;

/// Largest pseudo-pulse index of the cache.
const MAX_PSEUDO: usize = 40;
/// Number of bisection steps needed to search the cache.
const LOG_MAX_PSEUDO: usize = 6;

/// Expands a pseudo-pulse index into a pulse count. Above eight pulses the
/// resolution drops to powers of two times a 3-bit mantissa.
#[inline(always)]
pub(crate) fn get_pulses(index: i32) -> i32 {
    if index < 8 {
        index
    } else {
        (8 + (index & 7)) << ((index >> 3) - 1)
    }
}

/// The rate table of one codeword length: `bits[k]` is the rounded-up size
/// of the codebook with `get_pulses(k)` pulses, in 1/8 bits, minus one.
struct PulseRow {
    bits: Vec<u8>,
}

/// Static codec configuration for 48 kHz.
pub(crate) struct Mode {
    window: Vec<f32>,
    mdct: Mdct,
    /// Rate tables indexed by codeword length.
    pulse_rows: Vec<Option<PulseRow>>,
}

impl Mode {
    /// Builds the 48 kHz mode: a 1920-point MDCT with three subdivisions and
    /// the rate cache for every band size those frames can produce.
    pub(crate) fn new() -> Self {
        let window = vorbis_window(OVERLAP);
        let mdct = Mdct::new(SHORT_MDCT_FULL << MAX_LM, MAX_LM);

        // Collect every codeword length the band quantizer can reach: band
        // widths at every size shift, halved once per possible split.
        let max_n = band_width(NB_BANDS - 1) << MAX_LM;
        let mut pulse_rows: Vec<Option<PulseRow>> = Vec::new();
        pulse_rows.resize_with(max_n + 1, || None);
        (0..NB_BANDS).into_iter().for_each(|band| {
            (0..=MAX_LM).into_iter().for_each(|lm| {
                let mut n = band_width(band) << lm;
                let mut splits = 0;
                while n > 0 {
                    if pulse_rows[n].is_none() {
                        pulse_rows[n] = Some(build_pulse_row(n));
                    }
                    if splits > lm || n == 1 {
                        break;
                    }
                    n >>= 1;
                    splits += 1;
                }
            });
        });

        Self {
            window,
            mdct,
            pulse_rows,
        }
    }

    /// The analysis/synthesis window.
    pub(crate) fn window(&self) -> &[f32] {
        &self.window
    }

    /// The MDCT bank.
    pub(crate) fn mdct(&self) -> &Mdct {
        &self.mdct
    }

    /// The pseudo-pulse index whose rate comes closest to `bits` (1/8 bits)
    /// for a codeword of length `n`, without exceeding the cached maximum.
    pub(crate) fn bits2pulses(&self, n: usize, bits: i32) -> i32 {
        let row = match self.pulse_rows.get(n).and_then(|r| r.as_ref()) {
            Some(row) => row,
            None => return 0,
        };
        let max = row.bits.len() as i32 - 1;
        if max < 1 {
            return 0;
        }

        let bits = bits - 1;
        let mut lo: i32 = 0;
        let mut hi: i32 = max;
        (0..LOG_MAX_PSEUDO).into_iter().for_each(|_| {
            let mid = (lo + hi + 1) >> 1;
            if i32::from(row.bits[mid as usize]) >= bits {
                hi = mid;
            } else {
                lo = mid;
            }
        });

        let lo_bits = if lo == 0 {
            -1
        } else {
            i32::from(row.bits[lo as usize])
        };
        if bits - lo_bits <= i32::from(row.bits[hi as usize]) - bits {
            lo
        } else {
            hi
        }
    }

    /// The rate of the codebook with `get_pulses(q)` pulses, in 1/8 bits.
    pub(crate) fn pulses2bits(&self, n: usize, q: i32) -> i32 {
        if q == 0 {
            return 0;
        }
        match self.pulse_rows.get(n).and_then(|r| r.as_ref()) {
            Some(row) => {
                let q = i32::min(q, row.bits.len() as i32 - 1);
                i32::from(row.bits[q as usize]) + 1
            }
            None => 0,
        }
    }

    /// The rate of the largest codebook for length `n`, in 1/8 bits.
    pub(crate) fn max_pulse_bits(&self, n: usize) -> i32 {
        match self.pulse_rows.get(n).and_then(|r| r.as_ref()) {
            Some(row) => match row.bits.last() {
                Some(&bits) => i32::from(bits) + 1,
                None => 0,
            },
            None => 0,
        }
    }
}

/// Full length of the shortest MDCT.
const SHORT_MDCT_FULL: usize = 2 * crate::celt::SHORT_MDCT_SIZE;

/// Upper rate bound for each band in 1/8 bits, derived from the static cap
/// table the same way on both sides.
pub(crate) fn compute_caps(lm: usize, channels: usize) -> [i32; NB_BANDS] {
    let mut caps = [0_i32; NB_BANDS];
    (0..NB_BANDS).into_iter().for_each(|band| {
        let static_cap = i32::from(STATIC_CAPS[lm][channels - 1][band]);
        let width = (channels * (band_width(band) << lm)) as i32;
        caps[band] = (static_cap + 64) * width >> 2;
    });
    caps
}

/// The power-complementary Vorbis window,
/// `sin(pi/2 * sin^2(pi/2 * (i + 0.5) / n))`.
pub(crate) fn vorbis_window(n: usize) -> Vec<f32> {
    (0..n)
        .into_iter()
        .map(|i| {
            let x = (i as f64 + 0.5) / n as f64 * PI * 0.5;
            (0.5 * PI * x.sin() * x.sin()).sin() as f32
        })
        .collect()
}

/// Builds the rate table for codewords of length `n`. The table ends where
/// the codebook would no longer fit an unsigned 32-bit index.
fn build_pulse_row(n: usize) -> PulseRow {
    let mut bits: Vec<u8> = vec![0];
    for index in 1..MAX_PSEUDO as i32 {
        let pulses = get_pulses(index) as usize;
        let size = pvq_v(n, pulses);
        if size >= 1 << 31 {
            break;
        }
        let rate = log2_frac(size as u32, 3);
        if rate > 256 {
            break;
        }
        bits.push((rate - 1) as u8);
    }
    PulseRow { bits }
}

/// Rounded-up base-2 logarithm with `frac` fractional bits.
fn log2_frac(val: u32, frac: u32) -> u32 {
    debug_assert!(val > 0);
    let l = ilog(val);
    let mut result = (l - 1) << frac;
    if val & (val - 1) == 0 {
        return result;
    }

    // Normalize the mantissa to [1, 2) in Q16, rounding up, then extract one
    // fractional bit per squaring.
    let mut v: u64 = if l > 17 {
        ((u64::from(val) - 1) >> (l - 17)) + 1
    } else {
        u64::from(val) << (17 - l)
    };
    (0..frac).into_iter().rev().for_each(|i| {
        v = (v * v) >> 16;
        if v >= 131072 {
            result |= 1 << i;
            v >>= 1;
        }
    });
    if v > 65536 {
        result += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_window_is_power_complementary() {
        let window = vorbis_window(OVERLAP);
        (0..OVERLAP).into_iter().for_each(|i| {
            let a = window[i];
            let b = window[OVERLAP - 1 - i];
            assert!((a * a + b * b - 1.0).abs() < 1e-6, "at {}", i);
        });
    }

    #[test]
    fn test_get_pulses() {
        assert_eq!(get_pulses(0), 0);
        assert_eq!(get_pulses(7), 7);
        assert_eq!(get_pulses(8), 8);
        assert_eq!(get_pulses(15), 15);
        assert_eq!(get_pulses(16), 16);
        assert_eq!(get_pulses(17), 18);
        assert_eq!(get_pulses(24), 32);
        assert_eq!(get_pulses(39), 120);
    }

    #[test]
    fn test_log2_frac() {
        // Must agree with the rounded-up table used for the intensity
        // reservation.
        use crate::celt::tables::LOG2_FRAC_TABLE;
        (1..=24_u32).into_iter().for_each(|i| {
            assert_eq!(
                log2_frac(i, 3),
                u32::from(LOG2_FRAC_TABLE[(i - 1) as usize]),
                "log2_frac({})",
                i
            );
        });
    }

    #[test]
    fn test_rate_cache_is_monotone() {
        let mode = Mode::new();
        [1_usize, 2, 3, 4, 8, 11, 16, 22, 44, 88, 176]
            .iter()
            .for_each(|&n| {
                let mut last = 0;
                let mut q = 1;
                loop {
                    let bits = mode.pulses2bits(n, q);
                    if q > 1 && bits == last {
                        break;
                    }
                    assert!(bits >= last, "n = {}, q = {}", n, q);
                    last = bits;
                    q += 1;
                }
            });
    }

    #[test]
    fn test_bits2pulses_inverts_pulses2bits() {
        let mode = Mode::new();
        [2_usize, 4, 8, 16, 24, 44, 96, 176].iter().for_each(|&n| {
            (2..24).into_iter().for_each(|q| {
                let bits = mode.pulses2bits(n, q);
                if bits == 0
                    || bits == mode.pulses2bits(n, q + 1)
                    || bits == mode.pulses2bits(n, q - 1)
                {
                    return;
                }
                assert_eq!(mode.bits2pulses(n, bits), q, "n = {}, q = {}", n, q);
            });
        });
    }

    #[test]
    fn test_caps_grow_with_channels() {
        (0..=MAX_LM).into_iter().for_each(|lm| {
            let mono = compute_caps(lm, 1);
            let stereo = compute_caps(lm, 2);
            (0..NB_BANDS).into_iter().for_each(|band| {
                assert!(stereo[band] > mono[band]);
                assert!(mono[band] > 0);
            });
        });
    }
}
