//! Implements the FFT used for the MDCT.

use std::f64::consts::PI;

use num_complex::Complex;
use num_traits::Zero;

pub(crate) type Complex32 = Complex<f32>;

/// A mixed-radix Fast Fourier Transform based up on the principle, "Keep It
/// Simple, Stupid."
///
/// This code is originally from Mark Borgerding's KISS-FFT but has been
/// heavily modified to better suit Opus: the input permutation is
/// precomputed, so the caller scatters its samples through `bitrev()` and the
/// transform then runs fully in place, one factor per stage.
///
/// Only the forward transform is provided. The MDCT uses it for both
/// directions by conjugating its pre- and post-rotation twiddles.
pub(crate) struct KissFft {
    nfft: usize,
    scale: f32,
    /// Radix of every stage, outermost first. 4 is preferred, then 2, 3, 5.
    factors: Vec<usize>,
    /// Size of the sub-transforms below each stage.
    msizes: Vec<usize>,
    /// Digit-reversal permutation: input `i` lands at `bitrev[i]`.
    bitrev: Vec<usize>,
    /// The full twiddle circle, `exp(-2 pi i k / nfft)`.
    twiddles: Vec<Complex32>,
}

impl KissFft {
    /// Prepares a transform of the given size.
    ///
    /// The size must factor into 2, 3, 4 and 5.
    pub(crate) fn new(nfft: usize) -> Self {
        debug_assert!(nfft > 1);

        let factors = factorize(nfft);
        let mut msizes = vec![1_usize; factors.len()];
        (0..factors.len() - 1).into_iter().rev().for_each(|i| {
            msizes[i] = msizes[i + 1] * factors[i + 1];
        });

        let twiddles = (0..nfft)
            .into_iter()
            .map(|i| {
                let phase = -2.0 * PI * i as f64 / nfft as f64;
                Complex32::new(phase.cos() as f32, phase.sin() as f32)
            })
            .collect();

        let mut bitrev = vec![0_usize; nfft];
        fill_bitrev(&mut bitrev, &factors, &msizes, 0, 0, 0, 1);

        Self {
            nfft,
            scale: 1.0 / nfft as f32,
            factors,
            msizes,
            bitrev,
            twiddles,
        }
    }

    /// The transform size.
    pub(crate) fn nfft(&self) -> usize {
        self.nfft
    }

    /// The forward scaling factor, `1 / nfft`.
    pub(crate) fn scale(&self) -> f32 {
        self.scale
    }

    /// The input permutation. Input sample `i` must be stored at
    /// `bitrev()[i]` before calling `process()`.
    pub(crate) fn bitrev(&self) -> &[usize] {
        &self.bitrev
    }

    /// Runs the forward transform in place.
    ///
    /// The buffer must already be permuted through `bitrev()`. No scaling is
    /// applied; the MDCT folds `scale()` into its pre-rotation.
    pub(crate) fn process(&self, x: &mut [Complex32]) {
        debug_assert_eq!(x.len(), self.nfft);

        let n = self.nfft;
        let mut scratch = [Complex32::zero(); 5];

        (0..self.factors.len()).into_iter().rev().for_each(|t| {
            let p = self.factors[t];
            let m = self.msizes[t];
            let blocks = n / (p * m);

            (0..blocks).into_iter().for_each(|b| {
                let base = b * p * m;
                (0..m).into_iter().for_each(|k| {
                    (0..p).into_iter().for_each(|q| {
                        scratch[q] = x[base + q * m + k] * self.twiddles[(q * k * blocks) % n];
                    });
                    (0..p).into_iter().for_each(|j| {
                        let mut sum = Complex32::zero();
                        (0..p).into_iter().for_each(|q| {
                            sum += scratch[q] * self.twiddles[(q * j * m * blocks) % n];
                        });
                        x[base + j * m + k] = sum;
                    });
                });
            });
        });
    }
}

/// Greedy mixed-radix factorization, preferring radix 4.
fn factorize(mut n: usize) -> Vec<usize> {
    let mut factors = Vec::new();
    let mut p = 4;
    while n > 1 {
        while n % p != 0 {
            p = match p {
                4 => 2,
                2 => 3,
                _ => p + 2,
            };
        }
        n /= p;
        factors.push(p);
    }
    factors
}

/// Records where each input sample of a decimation-in-time traversal lands.
fn fill_bitrev(
    table: &mut [usize],
    factors: &[usize],
    msizes: &[usize],
    stage: usize,
    fout: usize,
    in_pos: usize,
    in_stride: usize,
) {
    let p = factors[stage];
    let m = msizes[stage];
    if m == 1 {
        (0..p).into_iter().for_each(|j| {
            table[in_pos + j * in_stride] = fout + j;
        });
    } else {
        (0..p).into_iter().for_each(|j| {
            fill_bitrev(
                table,
                factors,
                msizes,
                stage + 1,
                fout + j * m,
                in_pos + j * in_stride,
                in_stride * p,
            );
        });
    }
}
