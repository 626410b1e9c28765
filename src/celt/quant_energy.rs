//! Implements the band energy quantizer.
//!
//! Per band and channel the log2 amplitude is coded in three layers: coarse
//! 6 dB steps with an inter-band and inter-frame predictor, a fine uniform
//! remainder, and a final pass that dumps whatever bits are left after the
//! shapes were coded.

use crate::celt::tables::{
    BETA_COEF, BETA_INTRA, E_MEANS, E_PROB_MODEL_INTER, E_PROB_MODEL_INTRA, PRED_COEF,
    SMALL_ENERGY_ICDF,
};
use crate::celt::{MAX_FINE_BITS, NB_BANDS};
use crate::encoder_error::EncoderError;
use crate::math::fast_log2;
use crate::range_coder::{RangeDecoder, RangeEncoder, Tell};

/// Converts linear band amplitudes to the mean-removed log2 domain.
pub(crate) fn amp2_log2(
    eff_end: usize,
    end: usize,
    band_e: &[f32],
    band_log_e: &mut [f32],
    channels: usize,
) {
    (0..channels).into_iter().for_each(|c| {
        (0..eff_end).into_iter().for_each(|i| {
            band_log_e[i + c * NB_BANDS] = fast_log2(band_e[i + c * NB_BANDS]) - E_MEANS[i];
        });
        (eff_end..end).into_iter().for_each(|i| {
            band_log_e[i + c * NB_BANDS] = -14.0;
        });
    });
}

/// How badly the energy predictor would miss if this frame's history were
/// lost. Drives the delayed-intra heuristic.
fn loss_distortion(
    band_log_e: &[f32],
    old_ebands: &[f32],
    start: usize,
    end: usize,
    channels: usize,
) -> f32 {
    let mut dist = 0_f32;
    (0..channels).into_iter().for_each(|c| {
        (start..end).into_iter().for_each(|i| {
            let d = band_log_e[i + c * NB_BANDS] - old_ebands[i + c * NB_BANDS];
            dist += d * d;
        });
    });
    f32::min(200.0, dist)
}

#[allow(clippy::too_many_arguments)]
fn quant_coarse_energy_impl(
    start: usize,
    end: usize,
    band_log_e: &[f32],
    old_ebands: &mut [f32],
    budget: i32,
    mut tell: i32,
    prob_model: &[u8; 42],
    error: &mut [f32],
    enc: &mut RangeEncoder<'_>,
    channels: usize,
    lm: usize,
    intra: bool,
    max_decay: f32,
    lfe: bool,
) -> Result<i32, EncoderError> {
    let mut badness = 0_i32;
    let mut prev = [0_f32; 2];

    if tell + 3 <= budget {
        enc.encode_bit_logp(u32::from(intra), 3)?;
    }

    let (coef, beta) = if intra {
        (0.0, BETA_INTRA)
    } else {
        (PRED_COEF[lm], BETA_COEF[lm])
    };

    for i in start..end {
        for c in 0..channels {
            let x = band_log_e[i + c * NB_BANDS];
            let old_e = f32::max(-9.0, old_ebands[i + c * NB_BANDS]);
            let f = x - coef * old_e - prev[c];
            let mut qi = (0.5 + f).floor() as i32;
            let decay_bound = f32::max(-28.0, old_ebands[i + c * NB_BANDS] - max_decay);

            // Prevent the energy from going down too quickly (e.g. for bands
            // that have just one bin).
            if qi < 0 && x < decay_bound {
                qi += (decay_bound - x) as i32;
                if qi > 0 {
                    qi = 0;
                }
            }
            if lfe && i >= 2 {
                qi = i32::min(qi, 0);
            }
            let qi0 = qi;

            // The unquantized error drops with the budget: Laplace, then a
            // two-bit alphabet, then one bit, then nothing at all.
            if budget - tell >= 15 {
                let pi = 2 * usize::min(i, 20);
                enc.encode_laplace(
                    &mut qi,
                    u32::from(prob_model[pi]) << 7,
                    u32::from(prob_model[pi + 1]) << 6,
                )?;
            } else if budget - tell >= 2 {
                qi = i32::max(-1, i32::min(qi, 1));
                let sym = (2 * qi ^ -i32::from(qi < 0)) as usize;
                enc.encode_icdf(sym, &SMALL_ENERGY_ICDF, 2)?;
            } else if budget - tell >= 1 {
                qi = i32::min(0, qi);
                enc.encode_bit_logp((-qi) as u32, 1)?;
            } else {
                qi = -1;
            }
            error[i + c * NB_BANDS] = f - qi as f32;
            badness += (qi0 - qi).abs();

            let q = qi as f32;
            let mut tmp = coef * old_e + prev[c] + q;
            tmp = f32::max(-28.0, tmp);
            old_ebands[i + c * NB_BANDS] = tmp;
            prev[c] = prev[c] + q - beta * q;

            tell = enc.tell() as i32;
        }
    }

    Ok(badness)
}

/// Coarse-quantizes the band energies, choosing between intra and inter
/// prediction by trial-coding both when the budget allows it.
///
/// Returns whether the frame ended up intra coded.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_coarse_energy(
    start: usize,
    end: usize,
    eff_end: usize,
    band_log_e: &[f32],
    old_ebands: &mut [f32],
    budget: u32,
    error: &mut [f32],
    enc: &mut RangeEncoder<'_>,
    channels: usize,
    lm: usize,
    nb_available_bytes: i32,
    force_intra: bool,
    delayed_intra: &mut f32,
    mut two_pass: bool,
    loss_rate: i32,
    lfe: bool,
) -> Result<bool, EncoderError> {
    let mut intra = force_intra
        || (!two_pass
            && *delayed_intra > (2 * channels * (end - start)) as f32
            && nb_available_bytes > ((end - start) * channels) as i32);
    let intra_bias = (budget as f32 * *delayed_intra * loss_rate as f32
        / (channels as f32 * 512.0)) as i32;
    let new_distortion = loss_distortion(band_log_e, old_ebands, start, eff_end, channels);

    let tell = enc.tell() as i32;
    if tell + 3 > budget as i32 {
        two_pass = false;
        intra = false;
    }

    let mut max_decay = 16.0_f32;
    if end - start > 10 {
        max_decay = f32::min(max_decay, 0.125 * nb_available_bytes as f32);
    }
    if lfe {
        max_decay = 3.0;
    }

    let start_state = enc.save_state();
    let mut old_intra = old_ebands.to_vec();
    let mut error_intra = vec![0_f32; channels * NB_BANDS];

    let badness_intra = if two_pass || intra {
        quant_coarse_energy_impl(
            start,
            end,
            band_log_e,
            &mut old_intra,
            budget as i32,
            tell,
            &E_PROB_MODEL_INTRA[lm],
            &mut error_intra,
            enc,
            channels,
            lm,
            true,
            max_decay,
            lfe,
        )?
    } else {
        0
    };

    if !intra {
        let intra_state = enc.save_state();
        let tell_intra = enc.tell_frac() as i32;
        enc.restore_state(&start_state);

        let badness_inter = quant_coarse_energy_impl(
            start,
            end,
            band_log_e,
            old_ebands,
            budget as i32,
            tell,
            &E_PROB_MODEL_INTER[lm],
            error,
            enc,
            channels,
            lm,
            false,
            max_decay,
            lfe,
        )?;

        if two_pass
            && (badness_intra < badness_inter
                || (badness_intra == badness_inter
                    && enc.tell_frac() as i32 + intra_bias > tell_intra))
        {
            enc.restore_state(&intra_state);
            old_ebands.copy_from_slice(&old_intra);
            error.copy_from_slice(&error_intra);
            intra = true;
        }
    } else {
        old_ebands.copy_from_slice(&old_intra);
        error.copy_from_slice(&error_intra);
    }

    if intra {
        *delayed_intra = new_distortion;
    } else {
        *delayed_intra = PRED_COEF[lm] * PRED_COEF[lm] * *delayed_intra + new_distortion;
    }

    Ok(intra)
}

/// Decodes the coarse energies into `old_ebands`.
pub(crate) fn unquant_coarse_energy(
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    intra: bool,
    dec: &mut RangeDecoder<'_>,
    channels: usize,
    lm: usize,
    budget: i32,
) {
    let prob_model = if intra {
        &E_PROB_MODEL_INTRA[lm]
    } else {
        &E_PROB_MODEL_INTER[lm]
    };
    let (coef, beta) = if intra {
        (0.0, BETA_INTRA)
    } else {
        (PRED_COEF[lm], BETA_COEF[lm])
    };
    let mut prev = [0_f32; 2];

    for i in start..end {
        for c in 0..channels {
            let tell = dec.tell() as i32;
            let qi = if budget - tell >= 15 {
                let pi = 2 * usize::min(i, 20);
                dec.decode_laplace(
                    u32::from(prob_model[pi]) << 7,
                    u32::from(prob_model[pi + 1]) << 6,
                )
            } else if budget - tell >= 2 {
                let sym = dec.decode_icdf(&SMALL_ENERGY_ICDF, 2) as i32;
                (sym >> 1) ^ -(sym & 1)
            } else if budget - tell >= 1 {
                -i32::from(dec.decode_bit_logp(1))
            } else {
                -1
            };

            let q = qi as f32;
            let old_e = f32::max(-9.0, old_ebands[i + c * NB_BANDS]);
            old_ebands[i + c * NB_BANDS] = f32::max(-28.0, coef * old_e + prev[c] + q);
            prev[c] = prev[c] + q - beta * q;
        }
    }
}

/// Writes the fine energy remainders as raw bits.
pub(crate) fn quant_fine_energy(
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    error: &mut [f32],
    fine_quant: &[i32; NB_BANDS],
    enc: &mut RangeEncoder<'_>,
    channels: usize,
) -> Result<(), EncoderError> {
    for i in start..end {
        if fine_quant[i] <= 0 {
            continue;
        }
        let frac = 1 << fine_quant[i];
        for c in 0..channels {
            // Has to truncate towards negative infinity.
            let mut q2 = ((error[i + c * NB_BANDS] + 0.5) * frac as f32).floor() as i32;
            q2 = i32::min(q2, frac - 1);
            q2 = i32::max(q2, 0);
            enc.encode_bits(q2 as u32, fine_quant[i] as u32)?;

            let offset = (q2 as f32 + 0.5) / frac as f32 - 0.5;
            old_ebands[i + c * NB_BANDS] += offset;
            error[i + c * NB_BANDS] -= offset;
        }
    }
    Ok(())
}

/// Reads the fine energy remainders.
pub(crate) fn unquant_fine_energy(
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    fine_quant: &[i32; NB_BANDS],
    dec: &mut RangeDecoder<'_>,
    channels: usize,
) {
    for i in start..end {
        if fine_quant[i] <= 0 {
            continue;
        }
        for c in 0..channels {
            let q2 = dec.decode_bits(fine_quant[i] as u32) as i32;
            let offset = (q2 as f32 + 0.5) / (1 << fine_quant[i]) as f32 - 0.5;
            old_ebands[i + c * NB_BANDS] += offset;
        }
    }
}

/// Spends the bits left at the end of the frame on one more bit of energy
/// resolution per band, priority bands first.
#[allow(clippy::too_many_arguments)]
pub(crate) fn quant_energy_finalise(
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    error: &mut [f32],
    fine_quant: &[i32; NB_BANDS],
    fine_priority: &[bool; NB_BANDS],
    mut bits_left: i32,
    enc: &mut RangeEncoder<'_>,
    channels: usize,
) -> Result<(), EncoderError> {
    for prio in 0..2 {
        for i in start..end {
            if bits_left < channels as i32 {
                break;
            }
            if fine_quant[i] >= MAX_FINE_BITS || fine_priority[i] != (prio == 1) {
                continue;
            }
            for c in 0..channels {
                let q2 = i32::from(error[i + c * NB_BANDS] >= 0.0);
                enc.encode_bits(q2 as u32, 1)?;
                let offset = (q2 as f32 - 0.5) / (1 << (fine_quant[i] + 1)) as f32;
                old_ebands[i + c * NB_BANDS] += offset;
                error[i + c * NB_BANDS] -= offset;
                bits_left -= 1;
            }
        }
    }
    Ok(())
}

/// Mirrors `quant_energy_finalise()`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn unquant_energy_finalise(
    start: usize,
    end: usize,
    old_ebands: &mut [f32],
    fine_quant: &[i32; NB_BANDS],
    fine_priority: &[bool; NB_BANDS],
    mut bits_left: i32,
    dec: &mut RangeDecoder<'_>,
    channels: usize,
) {
    for prio in 0..2 {
        for i in start..end {
            if bits_left < channels as i32 {
                break;
            }
            if fine_quant[i] >= MAX_FINE_BITS || fine_priority[i] != (prio == 1) {
                continue;
            }
            for c in 0..channels {
                let q2 = dec.decode_bits(1) as i32;
                let offset = (q2 as f32 - 0.5) / (1 << (fine_quant[i] + 1)) as f32;
                old_ebands[i + c * NB_BANDS] += offset;
                bits_left -= 1;
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

    fn random_energies(rng: &mut nanorand::WyRand, channels: usize) -> Vec<f32> {
        (0..channels * NB_BANDS)
            .into_iter()
            .map(|_| rng.generate_range::<u32>(0, 24000) as f32 / 1000.0 - 12.0)
            .collect()
    }

    #[test]
    fn test_coarse_energy_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(0xE4E4);
        (0..64).into_iter().for_each(|iteration| {
            let channels = 1 + (iteration & 1) as usize;
            let lm = (iteration >> 1) & 3;
            let band_log_e = random_energies(&mut rng, channels);
            let mut old_enc = vec![0_f32; channels * NB_BANDS];
            let mut error = vec![0_f32; channels * NB_BANDS];
            let mut delayed_intra = 1.0_f32;

            let mut buffer = vec![0_u8; 256];
            let budget = (buffer.len() * 8) as u32;
            let mut enc = RangeEncoder::new(&mut buffer);
            let intra = quant_coarse_energy(
                0,
                NB_BANDS,
                NB_BANDS,
                &band_log_e,
                &mut old_enc,
                budget,
                &mut error,
                &mut enc,
                channels,
                lm,
                200,
                false,
                &mut delayed_intra,
                true,
                0,
                false,
            )
            .unwrap();
            enc.done().unwrap();
            drop(enc);

            let mut dec = RangeDecoder::new(&buffer);
            let decoded_intra = dec.decode_bit_logp(3);
            assert_eq!(decoded_intra, intra);
            let mut old_dec = vec![0_f32; channels * NB_BANDS];
            unquant_coarse_energy(
                0,
                NB_BANDS,
                &mut old_dec,
                decoded_intra,
                &mut dec,
                channels,
                lm,
                budget as i32,
            );

            old_enc.iter().zip(old_dec.iter()).for_each(|(e, d)| {
                assert_eq!(e, d, "encoder and decoder energies diverged");
            });
            // The coarse step is one unit in the log2 domain, so the error
            // never exceeds half a step when the budget is plentiful.
            error.iter().for_each(|e| assert!(e.abs() <= 1.0));
        });
    }

    #[test]
    fn test_fine_energy_round_trip() {
        let mut rng = nanorand::WyRand::new_seed(0xF1FE);
        let band_log_e = random_energies(&mut rng, 1);

        // Fake a coarse pass: integer energies with the remainder as error.
        let mut old_enc: Vec<f32> = band_log_e.iter().map(|x| (x + 0.5).floor()).collect();
        let mut error: Vec<f32> = band_log_e
            .iter()
            .zip(old_enc.iter())
            .map(|(x, o)| x - o)
            .collect();
        let pre_fine = old_enc.clone();

        let mut fine_quant = [0_i32; NB_BANDS];
        fine_quant.iter_mut().enumerate().for_each(|(i, q)| {
            *q = (i % (MAX_FINE_BITS as usize)) as i32;
        });

        let coarse_err: f32 = error.iter().map(|e| e * e).sum();

        let mut buffer = vec![0_u8; 256];
        let mut enc = RangeEncoder::new(&mut buffer);
        quant_fine_energy(
            0,
            NB_BANDS,
            &mut old_enc,
            &mut error,
            &fine_quant,
            &mut enc,
            1,
        )
        .unwrap();
        enc.done().unwrap();
        drop(enc);

        // Refinement must not increase the residual.
        let fine_err: f32 = error.iter().map(|e| e * e).sum();
        assert!(fine_err < coarse_err);

        // The decoder lands on exactly the encoder's refined energies.
        let mut dec = RangeDecoder::new(&buffer);
        let mut decoded = pre_fine;
        unquant_fine_energy(0, NB_BANDS, &mut decoded, &fine_quant, &mut dec, 1);
        decoded.iter().zip(old_enc.iter()).for_each(|(d, e)| {
            assert_eq!(d, e);
        });
    }
}
