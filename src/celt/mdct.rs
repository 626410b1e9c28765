//! Implements the modified discrete cosine transform.

use std::f64::consts::PI;

use num_traits::Zero;

use crate::celt::kiss_fft::{Complex32, KissFft};

/// This is a simple MDCT implementation that uses a N/4 complex FFT
/// to do most of the work. It should be relatively straightforward to
/// plug in pretty much any FFT here.
///
/// The algorithm is similar to (and inspired from) Fabrice Bellard's
/// MDCT implementation in FFMPEG, but has differences in signs, ordering
/// and scaling in many places.
///
/// One instance covers the longest transform of a mode and all its
/// power-of-two subdivisions: `shift` selects the size `n >> shift`.
pub(crate) struct Mdct {
    n: usize,
    max_shift: usize,
    kfft: Vec<KissFft>,
    /// Rotation twiddles per shift: `cos` in the first half, `sin` in the
    /// second, at the `(i + 1/8)` offsets the time-domain aliasing
    /// cancellation requires.
    trig: Vec<Vec<f32>>,
}

impl Mdct {
    /// Prepares transforms of length `n >> shift` for `shift` in
    /// `0..=max_shift`. `n` is the full MDCT length: the transform consumes
    /// `n/2 + overlap` samples and produces `n/2` coefficients.
    pub(crate) fn new(n: usize, max_shift: usize) -> Self {
        let kfft = (0..=max_shift)
            .into_iter()
            .map(|shift| KissFft::new((n >> shift) >> 2))
            .collect();

        let trig = (0..=max_shift)
            .into_iter()
            .map(|shift| {
                let len = n >> shift;
                let n4 = len >> 2;
                let mut t = vec![0_f32; len >> 1];
                (0..n4).into_iter().for_each(|i| {
                    let phase = 2.0 * PI * (i as f64 + 0.125) / len as f64;
                    t[i] = phase.cos() as f32;
                    t[n4 + i] = phase.sin() as f32;
                });
                t
            })
            .collect();

        Self {
            n,
            max_shift,
            kfft,
            trig,
        }
    }

    /// Forward MDCT.
    ///
    /// Reads `n/2 + overlap` samples from `input` and writes `n/2`
    /// coefficients to `output[offset + k * stride]`. The `stride` spreads
    /// the short blocks of a transient frame into one interleaved spectrum.
    pub(crate) fn forward(
        &self,
        shift: usize,
        input: &[f32],
        output: &mut [f32],
        offset: usize,
        stride: usize,
        window: &[f32],
    ) {
        debug_assert!(shift <= self.max_shift);

        let n = self.n >> shift;
        let n2 = n >> 1;
        let n4 = n >> 2;
        let overlap = window.len();
        debug_assert!(input.len() >= n2 + overlap);

        let kfft = &self.kfft[shift];
        let trig = &self.trig[shift];
        let scale = kfft.scale();

        // Consider the input to be composed of four blocks: [a, b, c, d].
        // Window and fold them down to n/2 values.
        let mut f = vec![0_f32; n2];
        {
            let quarter = (overlap + 3) >> 2;
            let mut yp = 0;
            let mut xp1 = overlap >> 1;
            let mut xp2 = n2 - 1 + (overlap >> 1);
            let mut wp1 = overlap >> 1;
            let mut wp2 = (overlap >> 1) - 1;

            // Real part arranged as -d-cR, imag part arranged as -b+aR.
            (0..quarter).into_iter().for_each(|_| {
                f[yp] = window[wp2] * input[xp1 + n2] + window[wp1] * input[xp2];
                f[yp + 1] = window[wp1] * input[xp1] - window[wp2] * input[xp2 - n2];
                yp += 2;
                xp1 += 2;
                xp2 -= 2;
                wp1 += 2;
                wp2 = wp2.wrapping_sub(2);
            });

            // Flat part of the window.
            (quarter..n4 - quarter).into_iter().for_each(|_| {
                f[yp] = input[xp2];
                f[yp + 1] = input[xp1];
                yp += 2;
                xp1 += 2;
                xp2 -= 2;
            });

            // Real part arranged as a-bR, imag part arranged as -c-dR.
            let mut wp1 = 0;
            let mut wp2 = overlap - 1;
            (n4 - quarter..n4).into_iter().for_each(|_| {
                f[yp] = -window[wp1] * input[xp1 - n2] + window[wp2] * input[xp2];
                f[yp + 1] = window[wp2] * input[xp1] + window[wp1] * input[xp2 + n2];
                yp += 2;
                xp1 += 2;
                xp2 = xp2.wrapping_sub(2);
                wp1 += 2;
                wp2 -= 2;
            });
        }

        // Pre-rotation, scattering directly into bit-reversed order.
        let mut f2 = vec![Complex32::zero(); n4];
        let bitrev = kfft.bitrev();
        (0..n4).into_iter().for_each(|i| {
            let t0 = trig[i];
            let t1 = trig[n4 + i];
            let re = f[2 * i];
            let im = f[2 * i + 1];
            let yr = re * t0 - im * t1;
            let yi = im * t0 + re * t1;
            f2[bitrev[i]] = Complex32::new(yr * scale, yi * scale);
        });

        kfft.process(&mut f2);

        // Post-rotation and de-shuffle into the strided output.
        {
            let mut yp1 = offset;
            let mut yp2 = offset + stride * (n2 - 1);
            (0..n4).into_iter().for_each(|i| {
                let yr = f2[i].im * trig[n4 + i] - f2[i].re * trig[i];
                let yi = f2[i].re * trig[n4 + i] + f2[i].im * trig[i];
                output[yp1] = yr;
                output[yp2] = yi;
                yp1 += 2 * stride;
                yp2 = yp2.wrapping_sub(2 * stride);
            });
        }
    }

    /// Inverse MDCT.
    ///
    /// Reads `n/2` coefficients from `input[offset + k * stride]` and writes
    /// `n/2 + overlap/2` samples starting at `output[out_offset]`. The first
    /// `overlap` output samples cross-fade with whatever the buffer already
    /// holds; the final `overlap/2` samples stay un-mirrored until the next
    /// block or frame completes them. The caller must therefore preserve the
    /// buffer contents between calls.
    pub(crate) fn backward(
        &self,
        shift: usize,
        input: &[f32],
        offset: usize,
        stride: usize,
        output: &mut [f32],
        out_offset: usize,
        window: &[f32],
    ) {
        debug_assert!(shift <= self.max_shift);

        let n = self.n >> shift;
        let n2 = n >> 1;
        let n4 = n >> 2;
        let overlap = window.len();
        debug_assert!(output.len() >= out_offset + n2 + (overlap >> 1));

        let kfft = &self.kfft[shift];
        let trig = &self.trig[shift];
        let bitrev = kfft.bitrev();

        // Pre-rotation, scattered into bit-reversed order. Real and imaginary
        // parts are swapped because we use a forward FFT instead of an
        // inverse one.
        let mut f = vec![Complex32::zero(); n4];
        {
            let mut xp1 = offset;
            let mut xp2 = offset + stride * (n2 - 1);
            (0..n4).into_iter().for_each(|i| {
                let yr = input[xp2] * trig[i] + input[xp1] * trig[n4 + i];
                let yi = input[xp1] * trig[i] - input[xp2] * trig[n4 + i];
                f[bitrev[i]] = Complex32::new(yi, yr);
                xp1 += 2 * stride;
                xp2 = xp2.wrapping_sub(2 * stride);
            });
        }

        kfft.process(&mut f);

        // Post-rotate and de-shuffle from both ends of the buffer at once to
        // make it in-place. When n4 is odd the middle pair is computed twice.
        (0..(n4 + 1) >> 1).into_iter().for_each(|i| {
            let j = n4 - 1 - i;

            let re = f[i].im;
            let im = f[i].re;
            let yr0 = re * trig[i] + im * trig[n4 + i];
            let yi0 = re * trig[n4 + i] - im * trig[i];

            let re = f[j].im;
            let im = f[j].re;
            let yr1 = re * trig[j] + im * trig[n4 + j];
            let yi1 = re * trig[n4 + j] - im * trig[j];

            f[i] = Complex32::new(yr0, yi1);
            f[j] = Complex32::new(yr1, yi0);
        });

        // Lay the samples down after the half-overlap lead-in.
        let base = out_offset + (overlap >> 1);
        (0..n4).into_iter().for_each(|i| {
            output[base + 2 * i] = f[i].re;
            output[base + 2 * i + 1] = f[i].im;
        });

        // Mirror on both sides for time-domain aliasing cancellation. The
        // `x2` samples are the previous block's tail already in the buffer.
        {
            let mut xp1 = out_offset + overlap - 1;
            let mut yp1 = out_offset;
            (0..overlap >> 1).into_iter().for_each(|i| {
                let w1 = window[i];
                let w2 = window[overlap - 1 - i];
                let x1 = output[xp1];
                let x2 = output[yp1];
                output[yp1] = w2 * x2 - w1 * x1;
                output[xp1] = w1 * x2 + w2 * x1;
                yp1 += 1;
                xp1 -= 1;
            });
        }
    }
}
