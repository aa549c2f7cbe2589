// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `cwrs` module ranks pulse vectors in the combinatorial number system.
//!
//! A band of `n` bins quantized with `k` pulses is one of `V(n, k)` signed integer vectors whose
//! magnitudes sum to `k`. The vector is transmitted as its rank under a fixed enumeration,
//! coded as a uniform integer. Ranking and unranking walk the vector position by position,
//! counting the codewords of every shorter value assignment with the recurrence
//! `V(n, k) = V(n - 1, k) + V(n, k - 1) + V(n - 1, k - 1)`.

use crate::entropy::{RangeDecoder, RangeEncoder};
use crate::math::ilog;

/// The largest pulse count any band may be assigned; the pulse cache never prices a count
/// beyond it, so no codeword with more pulses can be signalled.
pub const MAX_PULSES: usize = 128;

/// Largest `n` for which `V(n, k)` fits in 32 bits, indexed by `k`; and vice versa.
#[rustfmt::skip]
const MAX_N: [i32; 15] = [
    32767, 32767, 32767, 1476, 283, 109, 60, 40,
    29, 24, 20, 18, 16, 14, 13,
];
#[rustfmt::skip]
const MAX_K: [i32; 15] = [
    32767, 32767, 32767, 32767, 1172, 238, 95, 53,
    36, 27, 22, 18, 16, 15, 13,
];

/// Returns true when `V(n, k)` is guaranteed to fit in an unsigned 32-bit integer.
pub fn fits_in32(n: usize, k: usize) -> bool {
    if n >= 14 {
        if k >= 14 {
            false
        }
        else {
            n as i32 <= MAX_N[k]
        }
    }
    else {
        k as i32 <= MAX_K[n]
    }
}

/// Advance `row` from `V(d, .)` to `V(d + 1, .)` in place.
fn next_row(row: &mut [u64]) {
    let mut prev_old = row[0];

    for t in 1..row.len() {
        let old = row[t];
        row[t] = old + prev_old + row[t - 1];
        prev_old = old;
    }
}

/// The number of codewords of `n` bins summing `k` pulses.
pub fn pvq_codewords(n: usize, k: usize) -> u32 {
    debug_assert!(n >= 1);

    let mut row = vec![0u64; k + 1];
    row[0] = 1;

    for _ in 0..n {
        next_row(&mut row);
    }

    debug_assert!(row[k] <= u64::from(u32::MAX));
    row[k] as u32
}

/// Rank `y` among the codewords with its dimension and pulse count.
///
/// Values at each position are enumerated in the order `0, +1, -1, +2, -2, ...`. The walk runs
/// from the last position to the first so the recurrence rows build upward. Returns the rank and
/// the total codeword count.
fn rank_pulses(y: &[i32]) -> (u32, u32) {
    let n = y.len();
    let k: usize = y.iter().map(|&v| v.unsigned_abs() as usize).sum();

    let mut row = vec![0u64; k + 1];
    row[0] = 1;

    let mut index = 0u64;
    let mut ksum = 0usize;

    for j in (0..n).rev() {
        let a = y[j].unsigned_abs() as usize;
        let kj = ksum + a;

        if a > 0 {
            // Codewords with a shorter value at this position: zero first, both signs of every
            // smaller magnitude, then the positive twin when this value is negative.
            index += row[kj];

            for m in 1..a {
                index += 2 * row[kj - m];
            }

            if y[j] < 0 {
                index += row[kj - a];
            }
        }

        ksum = kj;
        next_row(&mut row);
    }

    debug_assert!(row[k] <= u64::from(u32::MAX));
    debug_assert!(index < row[k]);

    (index as u32, row[k] as u32)
}

/// Encode the pulse vector `y` as a uniform codeword rank.
pub fn encode_pulses(y: &[i32], enc: &mut RangeEncoder<'_>) {
    let (index, total) = rank_pulses(y);
    enc.encode_uint(index, total);
}

/// Decode `k` pulses over `y.len()` bins, writing the signed pulse counts into `y`.
///
/// `rows` is reusable scratch for the recurrence table.
pub fn decode_pulses(
    y: &mut [i32],
    k: usize,
    dec: &mut RangeDecoder<'_>,
    rows: &mut Vec<u64>,
) {
    let n = y.len();
    debug_assert!(n >= 1 && k > 0 && k <= MAX_PULSES);

    // Table of V(d, t) for d in [0, n], t in [0, k]; unranking needs the rows in descending
    // d order, so they are all built up front.
    let width = k + 1;
    rows.clear();
    rows.resize((n + 1) * width, 0);

    rows[0] = 1;
    for d in 1..=n {
        let (prev, cur) = rows.split_at_mut(d * width);
        let prev = &prev[(d - 1) * width..];
        let cur = &mut cur[..width];

        cur.copy_from_slice(prev);
        next_row(cur);
    }

    let total = rows[n * width + k];
    debug_assert!(total <= u64::from(u32::MAX));

    let mut index = u64::from(dec.decode_uint(total as u32));
    let mut kleft = k;

    for j in 0..n {
        let rest = n - 1 - j;
        let row = &rows[rest * width..rest * width + width];

        // Find the value at this position by skipping the codeword spans of every value that
        // precedes it in the enumeration order.
        let mut val = 0i32;

        if kleft > 0 {
            let mut span = row[kleft];

            if index >= span {
                index -= span;

                let mut m = 1usize;
                loop {
                    // Positive then negative of magnitude m.
                    span = row[kleft - m];

                    if index < span {
                        val = m as i32;
                        break;
                    }
                    index -= span;

                    if index < span {
                        val = -(m as i32);
                        break;
                    }
                    index -= span;

                    m += 1;
                }
            }
        }

        y[j] = val;
        kleft -= val.unsigned_abs() as usize;
    }

    debug_assert_eq!(kleft, 0);
    debug_assert_eq!(index, 0);
}

/// Fractional base-2 logarithm of `val`, rounded up, with `frac` fractional bits.
pub fn log2_frac(val: u32, frac: u32) -> i32 {
    let mut l = ilog(val) as i32;
    let mut val = val;

    if val & (val - 1) != 0 {
        // Scale into [0x8000, 0x10000), rounding up.
        if l > 16 {
            val = ((val - 1) >> (l - 16)) + 1;
        }
        else {
            val <<= 16 - l;
        }

        l = (l - 1) << frac;

        // At least one iteration is always needed: the rounding above may carry into the
        // integer part of the logarithm.
        let mut f = frac as i32;
        loop {
            let b = (val >> 16) as i32;
            l += b << frac;
            val >>= b;
            val = (val * val + 0x7fff) >> 15;

            if f == 0 {
                break;
            }
            f -= 1;
        }

        l + (val > 0x8000) as i32
    }
    else {
        // Exact powers of two require no rounding.
        (l - 1) << frac
    }
}

/// Number of 1/8 bits needed to code each pulse count up to `max_k` in `n` bins.
pub fn get_required_bits(bits: &mut [i32], n: usize, max_k: usize, frac: u32) {
    debug_assert!(max_k > 0 && max_k <= MAX_PULSES);

    bits[0] = 0;

    let mut row = vec![0u64; max_k + 1];
    row[0] = 1;

    for _ in 0..n {
        next_row(&mut row);
    }

    for k in 1..=max_k {
        debug_assert!(row[k] <= u64::from(u32::MAX));
        bits[k] = log2_frac(row[k] as u32, frac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::{RangeDecoder, RangeEncoder};

    #[test]
    fn verify_codeword_counts() {
        // V(1, k) = 2 for k > 0, and the first interesting sizes by hand.
        assert_eq!(pvq_codewords(1, 3), 2);
        assert_eq!(pvq_codewords(2, 1), 4);
        assert_eq!(pvq_codewords(2, 2), 8);
        assert_eq!(pvq_codewords(3, 1), 6);
        assert_eq!(pvq_codewords(3, 2), 18);
        assert_eq!(pvq_codewords(4, 2), 32);
    }

    #[test]
    fn verify_rank_is_bijective_small() {
        // Exhaustively unrank every index for a few shapes and check ranks invert.
        for &(n, k) in &[(2usize, 3usize), (3, 2), (4, 3), (5, 1), (6, 4)] {
            let total = pvq_codewords(n, k);

            let mut buf = vec![0u8; 16];
            let mut rows = Vec::new();

            for index in 0..total {
                let mut enc = RangeEncoder::new(&mut buf);
                enc.encode_uint(index, total);
                enc.done();

                let mut dec = RangeDecoder::new(&buf);
                let mut y = vec![0i32; n];
                decode_pulses(&mut y, k, &mut dec, &mut rows);

                let sum: u32 = y.iter().map(|v| v.unsigned_abs()).sum();
                assert_eq!(sum as usize, k, "pulse magnitudes must sum to k");

                let (rank, rank_total) = super::rank_pulses(&y);
                assert_eq!(rank_total, total);
                assert_eq!(rank, index);
            }
        }
    }

    #[test]
    fn verify_round_trip_large() {
        let shapes = [(96usize, 5usize), (22, 17), (8, 30), (176, 3), (11, 40)];

        let mut rows = Vec::new();

        for &(n, k) in &shapes {
            assert!(fits_in32(n, k));

            // An adversarial-ish vector: pulses piled at both ends with mixed signs.
            let mut y = vec![0i32; n];
            y[0] = (k as i32 + 1) / 2;
            y[n - 1] = -(k as i32 - y[0]);

            let mut buf = vec![0u8; 64];
            let mut enc = RangeEncoder::new(&mut buf);
            encode_pulses(&y, &mut enc);
            assert!(!enc.error());
            enc.done();

            let mut dec = RangeDecoder::new(&buf);
            let mut out = vec![0i32; n];
            decode_pulses(&mut out, k, &mut dec, &mut rows);

            assert_eq!(out, y);
        }
    }

    #[test]
    fn verify_fits_in32_bounds() {
        assert!(fits_in32(176, 3));
        assert!(!fits_in32(176, 8));
        assert!(fits_in32(2, 1000));
        assert!(fits_in32(13, 13));
        assert!(!fits_in32(20, 40));
    }

    #[test]
    fn verify_log2_frac() {
        // Exact powers of two need no rounding.
        assert_eq!(log2_frac(1, 3), 0);
        assert_eq!(log2_frac(2, 3), 8);
        assert_eq!(log2_frac(8, 3), 24);

        // Rounded-up fractional values: log2(3) = 1.585, in 1/8 bits ceil -> 13.
        assert_eq!(log2_frac(3, 3), 13);

        // Monotone in val.
        let mut last = 0;
        for v in 1..4096u32 {
            let l = log2_frac(v, 3);
            assert!(l >= last);
            last = l;
        }
    }
}
