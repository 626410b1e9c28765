//! Implements the combinatorial indexing of the pyramid vector quantizer.
//!
//! A codeword is a length-`n` integer vector whose absolute values sum to
//! `k`. The functions here biject such vectors with the integers in
//! `[0, V(n, k))`, so that a codeword can travel through the range coder as
//! a single uniform symbol.

/// The codebook size V(n, k): the number of integer vectors of length `n`
/// with L1 norm exactly `k`.
///
/// Saturates at `u64::MAX` for sizes beyond any codable codebook.
pub(crate) fn pvq_v(n: usize, k: usize) -> u64 {
    if k == 0 {
        return 1;
    }
    if n == 0 {
        return 0;
    }

    let mut row = v_row(1, k);
    (2..=n).into_iter().for_each(|dim| {
        update_row(&mut row, dim);
    });
    row[k]
}

/// The row V(1, 0..=k).
fn v_row(n: usize, k: usize) -> Vec<u64> {
    debug_assert_eq!(n, 1);
    let mut row = vec![2_u64; k + 1];
    row[0] = 1;
    row
}

/// Advances a row V(dim-1, 0..=k) to V(dim, 0..=k) in place, using
/// V(n, k) = V(n-1, k) + V(n, k-1) + V(n-1, k-1).
fn update_row(row: &mut [u64], _dim: usize) {
    let mut prev_diag = row[0];
    (1..row.len()).into_iter().for_each(|t| {
        let above = row[t];
        row[t] = above
            .saturating_add(row[t - 1])
            .saturating_add(prev_diag);
        prev_diag = above;
    });
}

/// Steps a row V(m, 0..=k) down to V(m-1, 0..=k).
///
/// Exact only while no entry has saturated, which holds for every codable
/// codebook (V(n, k) < 2^31).
fn downdate_row(row: &[u64], out: &mut [u64]) {
    out[0] = 1;
    (1..row.len()).into_iter().for_each(|t| {
        out[t] = row[t] - row[t - 1] - out[t - 1];
    });
}

/// Expands the codeword with the given index into `y`.
///
/// `index` must be in `[0, V(y.len(), k))`.
pub(crate) fn decode_pulses(index: u32, y: &mut [i32], k: usize) {
    let n = y.len();
    debug_assert!(n > 0);

    let mut idx = u64::from(index);
    let mut k = k;
    let mut row = v_row(1, k);
    (2..=n).into_iter().for_each(|dim| update_row(&mut row, dim));
    let mut sub = vec![0_u64; k + 1];

    for pos in 0..n {
        let m = n - pos;
        if k == 0 {
            y[pos] = 0;
            continue;
        }
        if m == 1 {
            y[pos] = if idx == 0 { k as i32 } else { -(k as i32) };
            k = 0;
            continue;
        }

        // Codewords with a zero here come first, then for each magnitude the
        // positive sign before the negative one.
        downdate_row(&row, &mut sub);
        if idx < sub[k] {
            y[pos] = 0;
        } else {
            idx -= sub[k];
            let mut mag = 0_i32;
            for j in 1..=k {
                let c = sub[k - j];
                if idx < c {
                    mag = j as i32;
                    break;
                }
                idx -= c;
                if idx < c {
                    mag = -(j as i32);
                    break;
                }
                idx -= c;
            }
            debug_assert!(mag != 0);
            y[pos] = mag;
            k -= mag.unsigned_abs() as usize;
        }
        row[..sub.len()].copy_from_slice(&sub);
    }
}

/// The inverse of `decode_pulses()`: the index of the codeword `y`.
pub(crate) fn encode_pulses(y: &[i32]) -> u32 {
    let n = y.len();
    debug_assert!(n > 0);

    let mut k: usize = y.iter().map(|v| v.unsigned_abs() as usize).sum();
    let mut idx: u64 = 0;
    let mut row = v_row(1, k);
    (2..=n).into_iter().for_each(|dim| update_row(&mut row, dim));
    let mut sub = vec![0_u64; k + 1];

    for pos in 0..n {
        let m = n - pos;
        if k == 0 {
            break;
        }
        if m == 1 {
            if y[pos] < 0 {
                idx += 1;
            }
            break;
        }

        downdate_row(&row, &mut sub);
        let val = y[pos];
        if val != 0 {
            idx += sub[k];
            let mag = val.unsigned_abs() as usize;
            (1..mag).into_iter().for_each(|j| {
                idx += 2 * sub[k - j];
            });
            if val < 0 {
                idx += sub[k - mag];
            }
            k -= mag;
        }
        row[..sub.len()].copy_from_slice(&sub);
    }

    debug_assert!(idx < u64::from(u32::MAX));
    idx as u32
}

#[cfg(test)]
mod tests {
    #![allow(clippy::panic)]
    #![allow(clippy::unwrap_used)]

    use std::collections::HashSet;

    use nanorand::RNG;

    use super::*;

    #[test]
    fn test_v_recurrence() {
        (2..=16).into_iter().for_each(|n| {
            (1..=12).into_iter().for_each(|k| {
                assert_eq!(
                    pvq_v(n, k),
                    pvq_v(n - 1, k) + pvq_v(n, k - 1) + pvq_v(n - 1, k - 1),
                    "n = {}, k = {}",
                    n,
                    k
                );
            });
        });
    }

    #[test]
    fn test_v_base_cases() {
        assert_eq!(pvq_v(0, 0), 1);
        assert_eq!(pvq_v(0, 3), 0);
        assert_eq!(pvq_v(1, 0), 1);
        assert_eq!(pvq_v(1, 5), 2);
        assert_eq!(pvq_v(3, 1), 6);
        assert_eq!(pvq_v(2, 2), 8);
    }

    #[test]
    fn test_exhaustive_enumeration() {
        // Every index must yield a distinct vector with the exact L1 norm,
        // and encoding it must give the index back.
        (1..=7).into_iter().for_each(|n| {
            (0..=8_usize).into_iter().for_each(|k| {
                let v = pvq_v(n, k);
                let mut seen = HashSet::new();
                (0..v as u32).into_iter().for_each(|index| {
                    let mut y = vec![0_i32; n];
                    decode_pulses(index, &mut y, k);

                    let norm: usize = y.iter().map(|x| x.unsigned_abs() as usize).sum();
                    assert_eq!(norm, k, "index {} of V({}, {})", index, n, k);
                    assert!(seen.insert(y.clone()), "duplicate vector for {:?}", y);
                    assert_eq!(encode_pulses(&y), index);
                });
                assert_eq!(seen.len() as u64, v);
            });
        });
    }

    #[test]
    fn test_random_round_trips() {
        let mut rng = nanorand::WyRand::new_seed(4711);
        (0..1000).into_iter().for_each(|_| {
            let n = rng.generate_range::<usize>(1, 33);
            let k = rng.generate_range::<usize>(1, 17);
            if pvq_v(n, k) >= 1 << 31 {
                return;
            }

            // Draw a random codeword by spreading k pulses.
            let mut y = vec![0_i32; n];
            (0..k).into_iter().for_each(|_| {
                let pos = rng.generate_range::<usize>(0, n);
                if y[pos] >= 0 && rng.generate_range::<u32>(0, 2) == 0 {
                    y[pos] += 1;
                } else if y[pos] <= 0 {
                    y[pos] -= 1;
                } else {
                    y[pos] += 1;
                }
            });

            let index = encode_pulses(&y);
            let mut decoded = vec![0_i32; n];
            decode_pulses(index, &mut decoded, k);
            assert_eq!(decoded, y);
        });
    }
}
