//! Static tables of the CELT layer.
//!
//! Probability models, the allocation template and the band layout are fixed
//! by the bitstream definition; both sides of the codec index them with the
//! same decoded parameters.

use crate::celt::NB_BANDS;

/// Band boundaries in MDCT bins for the shortest (2.5 ms) frame. A frame at
/// size shift `LM` scales every boundary by `1 << LM`. The last band ends at
/// bin 100, the remaining bins up to the Nyquist stay zero.
pub(crate) const EBANDS: [usize; NB_BANDS + 1] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 34, 40, 48, 60, 78, 100,
];

/// log2 of the band widths of the shortest frame, in 1/8 bits. Drives the
/// theta quantizer resolution.
pub(crate) const LOG_N: [i32; NB_BANDS] = [
    0, 0, 0, 0, 0, 0, 0, 0, 8, 8, 8, 8, 16, 16, 16, 21, 21, 24, 29, 34, 36,
];

/// Mean log2 energy per band, subtracted before coarse quantization so the
/// Laplace model sees a roughly zero-mean signal.
pub(crate) const E_MEANS: [f32; NB_BANDS] = [
    6.4375, 6.25, 5.75, 5.3125, 5.0625, 4.8125, 4.5, 4.375, 4.875, 4.6875, 4.5625, 4.4375, 4.875,
    4.625, 4.3125, 4.5, 4.375, 4.625, 4.75, 4.4375, 3.75,
];

/// Inter-frame energy prediction coefficient, indexed by LM.
pub(crate) const PRED_COEF: [f32; 4] = [
    29440.0 / 32768.0,
    26112.0 / 32768.0,
    21248.0 / 32768.0,
    16384.0 / 32768.0,
];

/// Inter-band energy prediction leakage, indexed by LM. The carry update is
/// `prev += q - beta * q`.
pub(crate) const BETA_COEF: [f32; 4] = [
    30147.0 / 32768.0,
    22282.0 / 32768.0,
    12124.0 / 32768.0,
    6554.0 / 32768.0,
];

/// Inter-band leakage used for intra frames.
pub(crate) const BETA_INTRA: f32 = 4915.0 / 32768.0;

/// Laplace probability model for coarse energy in inter frames, indexed by
/// LM. Two entries per band: (fs, decay), scaled by 2^7 and 2^6 when coding.
pub(crate) const E_PROB_MODEL_INTER: [[u8; 42]; 4] = [
    // 120-sample frames.
    [
        72, 127, 65, 129, 66, 128, 65, 128, 64, 128, 62, 128, 64, 128, 64, 128, 92, 78, 92, 79,
        92, 78, 90, 79, 116, 41, 115, 40, 114, 40, 132, 26, 132, 26, 145, 17, 161, 12, 176, 10,
        177, 11,
    ],
    // 240-sample frames.
    [
        83, 78, 84, 81, 88, 75, 86, 74, 87, 71, 90, 73, 93, 74, 93, 74, 109, 40, 114, 36, 117, 34,
        117, 34, 143, 17, 145, 18, 146, 19, 162, 12, 165, 10, 178, 7, 189, 6, 190, 8, 177, 9,
    ],
    // 480-sample frames.
    [
        61, 90, 93, 60, 105, 42, 107, 41, 110, 45, 116, 38, 113, 38, 112, 38, 124, 26, 132, 27,
        136, 19, 140, 20, 155, 14, 159, 16, 158, 18, 170, 13, 177, 10, 187, 8, 192, 6, 175, 9,
        159, 10,
    ],
    // 960-sample frames.
    [
        42, 121, 96, 66, 108, 43, 111, 40, 117, 44, 123, 32, 120, 36, 119, 33, 127, 33, 134, 34,
        139, 21, 147, 23, 152, 20, 158, 25, 154, 26, 166, 21, 173, 16, 184, 13, 184, 10, 150, 13,
        139, 15,
    ],
];

/// Laplace probability model for coarse energy in intra frames.
pub(crate) const E_PROB_MODEL_INTRA: [[u8; 42]; 4] = [
    // 120-sample frames.
    [
        24, 179, 48, 138, 54, 135, 54, 132, 53, 134, 56, 133, 55, 132, 55, 132, 61, 114, 70, 96,
        74, 88, 75, 88, 87, 74, 89, 66, 91, 67, 100, 59, 108, 50, 120, 40, 122, 37, 97, 43, 78,
        50,
    ],
    // 240-sample frames.
    [
        23, 178, 54, 115, 63, 102, 66, 98, 69, 99, 74, 89, 71, 91, 73, 91, 78, 89, 86, 80, 92, 66,
        93, 64, 102, 59, 103, 60, 104, 60, 117, 52, 123, 44, 138, 35, 133, 31, 97, 38, 77, 45,
    ],
    // 480-sample frames.
    [
        21, 178, 59, 110, 71, 86, 75, 85, 84, 83, 91, 66, 88, 73, 87, 72, 92, 75, 98, 72, 105, 58,
        107, 54, 115, 52, 114, 55, 112, 56, 129, 51, 132, 40, 150, 33, 140, 29, 98, 35, 77, 42,
    ],
    // 960-sample frames.
    [
        22, 178, 63, 114, 74, 82, 84, 83, 92, 82, 103, 62, 96, 72, 96, 67, 101, 73, 107, 72, 113,
        55, 118, 52, 125, 52, 118, 52, 117, 55, 135, 49, 137, 39, 157, 32, 145, 29, 97, 33, 77,
        40,
    ],
];

/// Fallback model for coarse energy when fewer than 15 bits remain:
/// {-1, 0, +1} with a shared two-bit alphabet.
pub(crate) const SMALL_ENERGY_ICDF: [u8; 3] = [2, 1, 0];

/// Allocation template, in 1/32 bit per MDCT bin per band. The allocator
/// bisects over the rows and interpolates between the two neighbours that
/// bracket the packet budget.
pub(crate) const ALLOC_VECTORS: [[u8; NB_BANDS]; 11] = [
    [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0],
    [90, 80, 75, 69, 63, 56, 49, 40, 34, 29, 20, 18, 10, 0, 0, 0, 0, 0, 0, 0, 0],
    [110, 100, 90, 84, 78, 71, 65, 58, 51, 45, 39, 32, 26, 20, 12, 0, 0, 0, 0, 0, 0],
    [118, 110, 103, 93, 86, 80, 75, 70, 65, 59, 53, 47, 40, 31, 23, 15, 4, 0, 0, 0, 0],
    [126, 119, 112, 104, 95, 89, 83, 78, 72, 66, 60, 54, 47, 39, 32, 25, 17, 12, 1, 0, 0],
    [134, 127, 120, 114, 103, 97, 91, 85, 78, 72, 66, 60, 54, 47, 41, 35, 29, 23, 16, 10, 1],
    [144, 137, 130, 124, 113, 107, 101, 95, 88, 82, 76, 70, 64, 57, 51, 45, 39, 33, 26, 15, 1],
    [152, 145, 138, 132, 123, 117, 111, 105, 98, 92, 86, 80, 74, 67, 61, 55, 49, 43, 36, 20, 1],
    [162, 155, 148, 142, 133, 127, 121, 115, 108, 102, 96, 90, 84, 77, 71, 65, 59, 53, 46, 30, 1],
    [172, 165, 158, 152, 143, 137, 131, 125, 118, 112, 106, 100, 94, 87, 81, 75, 69, 63, 56, 45, 20],
    [200, 200, 200, 200, 200, 200, 200, 200, 198, 193, 188, 183, 178, 173, 168, 163, 158, 153, 148, 129, 104],
];

/// Upper bound of the per-band rate, in the same 1/32 bit-per-bin scale as
/// the allocation template, indexed by [LM][stereo][band].
pub(crate) const STATIC_CAPS: [[[u8; NB_BANDS]; 2]; 4] = [
    // 120-sample frames.
    [
        [
            224, 224, 224, 224, 224, 224, 224, 224, 160, 160, 160, 160, 185, 185, 185, 178, 178,
            168, 134, 61, 37,
        ],
        [
            224, 224, 224, 224, 224, 224, 224, 224, 240, 240, 240, 240, 207, 207, 207, 198, 198,
            183, 144, 66, 40,
        ],
    ],
    // 240-sample frames.
    [
        [
            160, 160, 160, 160, 160, 160, 160, 160, 185, 185, 185, 185, 193, 193, 193, 183, 183,
            172, 138, 64, 38,
        ],
        [
            240, 240, 240, 240, 240, 240, 240, 240, 207, 207, 207, 207, 204, 204, 204, 193, 193,
            180, 143, 66, 40,
        ],
    ],
    // 480-sample frames.
    [
        [
            185, 185, 185, 185, 185, 185, 185, 185, 193, 193, 193, 193, 193, 193, 193, 183, 183,
            172, 138, 65, 39,
        ],
        [
            207, 207, 207, 207, 207, 207, 207, 207, 204, 204, 204, 204, 201, 201, 201, 188, 188,
            176, 141, 66, 40,
        ],
    ],
    // 960-sample frames.
    [
        [
            193, 193, 193, 193, 193, 193, 193, 193, 193, 193, 193, 193, 194, 194, 194, 184, 184,
            173, 139, 65, 39,
        ],
        [
            204, 204, 204, 204, 204, 204, 204, 204, 201, 201, 201, 201, 198, 198, 198, 187, 187,
            175, 140, 66, 40,
        ],
    ],
];

/// Rounded-up log2 in 1/8 bits, used to reserve room for the intensity
/// stereo boundary symbol.
pub(crate) const LOG2_FRAC_TABLE: [u8; 24] = [
    0, 8, 13, 16, 19, 21, 23, 24, 26, 27, 28, 29, 30, 31, 32, 32, 33, 34, 34, 35, 36, 36, 37, 37,
];

/// Per-band time-frequency adjustment, indexed by
/// `[LM][4 * transient + 2 * tf_select + tf_changed]`.
pub(crate) const TF_SELECT_TABLE: [[i8; 8]; 4] = [
    [0, -1, 0, -1, 0, -1, 0, -1],
    [0, -1, 0, -2, 1, 0, 1, -1],
    [0, -2, 0, -3, 2, 0, 1, -1],
    [0, -2, 0, -3, 3, 0, 1, -1],
];

/// ICDF of the allocation trim, centered on the neutral value 5.
pub(crate) const TRIM_ICDF: [u8; 11] = [126, 124, 119, 109, 87, 41, 19, 9, 4, 2, 0];

/// ICDF of the spread decision.
pub(crate) const SPREAD_ICDF: [u8; 4] = [25, 23, 2, 0];

/// ICDF of the postfilter tapset.
pub(crate) const TAPSET_ICDF: [u8; 3] = [2, 1, 0];

/// Comb filter tap presets. Three taps per tapset; the outer taps are applied
/// symmetrically around the period.
pub(crate) const COMB_GAINS: [f32; 9] = [
    0.30664063,
    0.21704102,
    0.12963867,
    0.4638672,
    0.2680664,
    0.0,
    0.7998047,
    0.100097656,
    0.0,
];

/// Pre- and de-emphasis coefficient at 48 kHz.
pub(crate) const PREEMPHASIS: f32 = 0.85;

/// Remaps the collapse-mask bits when sub-blocks are merged by a Haar step.
pub(crate) const BIT_INTERLEAVE_TABLE: [u8; 16] =
    [0, 1, 1, 1, 2, 3, 3, 3, 2, 3, 3, 3, 2, 3, 3, 3];

/// Expands merged collapse-mask bits back onto the original sub-blocks.
pub(crate) const BIT_DEINTERLEAVE_TABLE: [u8; 16] = [
    0x00, 0x03, 0x0C, 0x0F, 0x30, 0x33, 0x3C, 0x3F, 0xC0, 0xC3, 0xCC, 0xCF, 0xF0, 0xF3, 0xFC,
    0xFF,
];

/// Output order of the Hadamard-interleaved sub-blocks, concatenated for
/// strides 2, 4 and 8.
pub(crate) const ORDERY_TABLE: [usize; 14] = [1, 0, 3, 0, 2, 1, 7, 0, 4, 3, 6, 1, 5, 2];

/// Fractional powers of two in Q14, used by the theta resolution.
pub(crate) const EXP2_TABLE8: [i32; 8] = [16384, 17866, 19483, 21247, 23170, 25267, 27554, 30048];

/// Width of each band of the shortest frame, in bins.
#[inline(always)]
pub(crate) fn band_width(band: usize) -> usize {
    EBANDS[band + 1] - EBANDS[band]
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]

    use super::*;

    #[test]
    fn test_band_layout() {
        assert_eq!(EBANDS[0], 0);
        assert_eq!(EBANDS[NB_BANDS], 100);
        (0..NB_BANDS).into_iter().for_each(|i| {
            assert!(EBANDS[i] < EBANDS[i + 1], "band {} is empty", i);
        });
    }

    #[test]
    fn test_models_cover_all_bands() {
        E_PROB_MODEL_INTER
            .iter()
            .chain(E_PROB_MODEL_INTRA.iter())
            .for_each(|model| {
                assert_eq!(model.len(), 2 * NB_BANDS);
            });
    }

    #[test]
    fn test_alloc_vectors_are_monotone() {
        // Each template row must allocate at least as many bits as the
        // previous one in every band, otherwise the bisection breaks.
        (1..ALLOC_VECTORS.len()).into_iter().for_each(|row| {
            (0..NB_BANDS).into_iter().for_each(|band| {
                assert!(
                    ALLOC_VECTORS[row][band] >= ALLOC_VECTORS[row - 1][band],
                    "row {} band {}",
                    row,
                    band
                );
            });
        });
    }
}
