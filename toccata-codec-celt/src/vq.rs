// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `vq` module quantizes unit-norm band vectors against the pyramid codebook.
//!
//! A band is represented by `k` signed unit pulses over its bins. The search maximizes the
//! correlation with the input under the codebook energy, the selected vector is transmitted as a
//! combinatorial rank, and a pair of structured rotations optionally spreads the pulses to avoid
//! sparse-codeword artifacts at low rates.

use crate::cwrs;
use crate::entropy::{RangeDecoder, RangeEncoder};
use crate::math::celt_inner_prod;

pub const SPREAD_NONE: i32 = 0;
pub const SPREAD_LIGHT: i32 = 1;
pub const SPREAD_NORMAL: i32 = 2;
pub const SPREAD_AGGRESSIVE: i32 = 3;

const SPREAD_FACTOR: [i32; 3] = [15, 10, 5];

const EPSILON: f32 = 1e-15;

/// One pass of paired 2-D rotations at the given stride.
fn exp_rotation1(x: &mut [f32], len: usize, stride: usize, c: f32, s: f32) {
    let ms = -s;

    for i in 0..len - stride {
        let x1 = x[i];
        let x2 = x[i + stride];
        x[i + stride] = c * x2 + s * x1;
        x[i] = c * x1 + ms * x2;
    }

    if len >= 2 * stride + 1 {
        for i in (0..len - 2 * stride).rev() {
            let x1 = x[i];
            let x2 = x[i + stride];
            x[i + stride] = c * x2 + s * x1;
            x[i] = c * x1 + ms * x2;
        }
    }
}

/// Spreading rotation. `dir` is +1 on the encoder side ahead of the pulse search and -1 to
/// invert it; the rotation preserves the L2 norm exactly up to rounding.
pub fn exp_rotation(x: &mut [f32], len: usize, dir: i32, stride: usize, k: usize, spread: i32) {
    if 2 * k >= len || spread == SPREAD_NONE {
        return;
    }

    let factor = SPREAD_FACTOR[(spread - 1) as usize];

    let gain = len as f32 / (len as i32 + factor * k as i32) as f32;
    let theta = 0.5 * gain * gain;

    let c = (0.5 * std::f32::consts::PI * theta).cos();
    let s = (0.5 * std::f32::consts::PI * (1.0 - theta)).cos();

    let mut stride2 = 0;
    if len >= 8 * stride {
        // Equivalent to computing sqrt(len / stride) with rounding.
        stride2 = 1;
        while (stride2 * stride2 + stride2) * stride + (stride >> 2) < len {
            stride2 += 1;
        }
    }

    let len = len / stride;

    for i in 0..stride {
        let chunk = &mut x[i * len..(i + 1) * len];

        if dir < 0 {
            if stride2 != 0 {
                exp_rotation1(chunk, len, stride2, s, c);
            }
            exp_rotation1(chunk, len, 1, c, s);
        }
        else {
            exp_rotation1(chunk, len, 1, c, -s);
            if stride2 != 0 {
                exp_rotation1(chunk, len, stride2, s, -c);
            }
        }
    }
}

/// Greedy pyramid search: find the pulse vector `iy` with `sum |iy| == k` maximizing
/// `<x, iy>^2 / <iy, iy>`. Returns `<iy, iy>` so the normalizer can reuse it.
///
/// `x` is consumed as scratch: the signs are stripped and the remnants are meaningless to the
/// caller afterwards.
pub fn op_pvq_search(x: &mut [f32], iy: &mut [i32], k: usize, y_scratch: &mut [f32]) -> f32 {
    let n = x.len();
    let y = &mut y_scratch[..n];

    // Strip the signs; they are restored onto the chosen pulse counts at the end.
    let mut signx = vec![false; n];

    for j in 0..n {
        signx[j] = x[j] < 0.0;
        x[j] = x[j].abs();
        iy[j] = 0;
        y[j] = 0.0;
    }

    let mut xy = 0.0f32;
    let mut yy = 0.0f32;
    let mut pulses_left = k as i32;

    // Pre-search by projecting onto the pyramid when many pulses are needed.
    if k > (n >> 1) {
        let mut sum: f32 = x.iter().sum();

        // If x is too small or non-finite, replace it with a pulse at position zero. This keeps
        // infinities and NaNs from allocating an unbounded number of pulses.
        if !(sum > EPSILON && sum < 64.0) {
            x[0] = 1.0;
            for xj in x[1..].iter_mut() {
                *xj = 0.0;
            }
            sum = 1.0;
        }

        // Using k + e with e < 1 guarantees no more than k pulses are assigned.
        let rcp = (k as f32 + 0.8) / sum;

        for j in 0..n {
            // Rounding towards zero is what bounds the pulse total.
            iy[j] = (rcp * x[j]).floor() as i32;
            y[j] = iy[j] as f32;
            yy += y[j] * y[j];
            xy += x[j] * y[j];
            // The doubled copy folds the cross term of adding a pulse into a single addition.
            y[j] *= 2.0;
            pulses_left -= iy[j];
        }
    }
    debug_assert!(pulses_left >= 0);

    // A degenerate projection (e.g. silence) can leave nearly everything unallocated; dump the
    // remainder on the first bin rather than search for it.
    if pulses_left > n as i32 + 3 {
        let tmp = pulses_left as f32;
        yy += tmp * tmp;
        yy += tmp * y[0];
        iy[0] += pulses_left;
        pulses_left = 0;
    }

    for _ in 0..pulses_left {
        // The squared-magnitude term of the candidate pulse is position independent.
        yy += 1.0;

        let mut best_id = 0usize;
        let mut best_num = {
            let rxy = xy + x[0];
            rxy * rxy
        };
        let mut best_den = yy + y[0];

        for j in 1..n {
            let rxy = {
                let r = xy + x[j];
                r * r
            };
            let ryy = yy + y[j];

            // num / den >= best_num / best_den, cross-multiplied to avoid the division. The
            // strict inequality keeps the lowest index on ties, which the decoder relies on
            // indirectly through the encoder's determinism.
            if best_den * rxy > ryy * best_num {
                best_den = ryy;
                best_num = rxy;
                best_id = j;
            }
        }

        xy += x[best_id];
        yy += y[best_id];
        y[best_id] += 2.0;
        iy[best_id] += 1;
    }

    // Put the original signs back.
    for j in 0..n {
        if signx[j] {
            iy[j] = -iy[j];
        }
    }

    yy
}

/// Scale the integer pulse vector onto `x` with gain `gain / sqrt(ryy)`.
fn normalise_residual(iy: &[i32], x: &mut [f32], ryy: f32, gain: f32) {
    let g = gain / ryy.sqrt();

    for (x, &iy) in x.iter_mut().zip(iy) {
        *x = g * iy as f32;
    }
}

/// One bit per sub-block recording whether any pulse landed in it.
fn extract_collapse_mask(iy: &[i32], b: usize) -> u32 {
    if b <= 1 {
        return 1;
    }

    let n0 = iy.len() / b;
    let mut collapse_mask = 0u32;

    for (i, block) in iy.chunks_exact(n0).enumerate() {
        if block.iter().any(|&v| v != 0) {
            collapse_mask |= 1 << i;
        }
    }

    collapse_mask
}

/// Quantize the unit-norm vector `x` with `k` pulses, writing the codeword rank to `enc` and
/// resynthesizing the quantized vector (scaled by `gain`) in place. Returns the collapse mask.
#[allow(clippy::too_many_arguments)]
pub fn alg_quant(
    x: &mut [f32],
    k: usize,
    spread: i32,
    b: usize,
    enc: &mut RangeEncoder<'_>,
    gain: f32,
    resynth: bool,
    iy: &mut [i32],
    y_scratch: &mut [f32],
) -> u32 {
    let n = x.len();
    debug_assert!(k > 0, "alg_quant needs at least one pulse");
    debug_assert!(n > 1, "alg_quant needs at least two dimensions");

    exp_rotation(x, n, 1, b, k, spread);

    let yy = op_pvq_search(x, &mut iy[..n], k, y_scratch);

    cwrs::encode_pulses(&iy[..n], enc);

    if resynth {
        normalise_residual(&iy[..n], x, yy, gain);
        exp_rotation(x, n, -1, b, k, spread);
    }

    extract_collapse_mask(&iy[..n], b)
}

/// Decode `k` pulses into the unit-norm vector `x`, scaled by `gain`. Returns the collapse mask.
pub fn alg_unquant(
    x: &mut [f32],
    k: usize,
    spread: i32,
    b: usize,
    dec: &mut RangeDecoder<'_>,
    gain: f32,
    iy: &mut [i32],
    rows: &mut Vec<u64>,
) -> u32 {
    let n = x.len();
    debug_assert!(k > 0 && n > 1);

    cwrs::decode_pulses(&mut iy[..n], k, dec, rows);

    let ryy: f32 = iy[..n].iter().map(|&v| (v * v) as f32).sum();

    normalise_residual(&iy[..n], x, ryy, gain);
    exp_rotation(x, n, -1, b, k, spread);

    extract_collapse_mask(&iy[..n], b)
}

/// Rescale `x` to L2 norm `gain`.
pub fn renormalise_vector(x: &mut [f32], gain: f32) {
    let e = EPSILON + celt_inner_prod(x, x);
    let g = gain / e.sqrt();

    for x in x.iter_mut() {
        *x *= g;
    }
}

/// Mid/side angle of a stereo band pair, in 1/16384ths of a quarter turn.
pub fn stereo_itheta(x: &[f32], y: &[f32], stereo: bool) -> i32 {
    let mut emid = EPSILON;
    let mut eside = EPSILON;

    if stereo {
        for (&x, &y) in x.iter().zip(y) {
            let m = 0.5 * x + 0.5 * y;
            let s = 0.5 * x - 0.5 * y;
            emid += m * m;
            eside += s * s;
        }
    }
    else {
        emid += celt_inner_prod(x, x);
        eside += celt_inner_prod(y, y);
    }

    let mid = emid.sqrt();
    let side = eside.sqrt();

    // 0.63662 = 2/pi
    (0.5 + 16384.0 * 0.63662 * side.atan2(mid)).floor() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    fn snr(expected: &[f32], actual: &[f32]) -> f64 {
        let mut sig = 0f64;
        let mut err = 0f64;

        for (e, a) in expected.iter().zip(actual) {
            sig += f64::from(*e) * f64::from(*e);
            err += (f64::from(*e) - f64::from(*a)).powi(2);
        }

        10.0 * (sig / err).log10()
    }

    #[test]
    fn verify_exp_rotation_invertible() {
        let mut rng = SmallRng::seed_from_u64(0x5104);

        for &n in &[15usize, 23, 50, 80] {
            for &k in &[1usize, 3, 7] {
                if 2 * k >= n {
                    continue;
                }

                let x: Vec<f32> = (0..n).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();
                let mut work = x.clone();

                exp_rotation(&mut work, n, 1, 1, k, SPREAD_NORMAL);
                exp_rotation(&mut work, n, -1, 1, k, SPREAD_NORMAL);

                assert!(snr(&x, &work) >= 60.0, "rotation not invertible for n={} k={}", n, k);
            }
        }
    }

    #[test]
    fn verify_exp_rotation_preserves_norm() {
        let mut rng = SmallRng::seed_from_u64(0x0707);

        let n = 50;
        let mut x: Vec<f32> = (0..n).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();
        renormalise_vector(&mut x, 1.0);

        exp_rotation(&mut x, n, 1, 1, 4, SPREAD_AGGRESSIVE);

        let e = celt_inner_prod(&x, &x);
        assert!((e - 1.0).abs() < 1e-5);
    }

    #[test]
    fn verify_pvq_search_pulse_budget() {
        let mut rng = SmallRng::seed_from_u64(0xbeef);

        for &(n, k) in &[(4usize, 2usize), (16, 8), (16, 40), (96, 3), (30, 64)] {
            let mut x: Vec<f32> = (0..n).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();
            renormalise_vector(&mut x, 1.0);

            let mut iy = vec![0i32; n];
            let mut scratch = vec![0f32; n];
            let yy = op_pvq_search(&mut x, &mut iy, k, &mut scratch);

            let total: u32 = iy.iter().map(|v| v.unsigned_abs()).sum();
            assert_eq!(total as usize, k);

            let sumsq: i64 = iy.iter().map(|&v| i64::from(v) * i64::from(v)).sum();
            assert_eq!(sumsq as f32, yy);
        }
    }

    #[test]
    fn verify_pvq_search_matches_peak() {
        // A single dominant direction takes every pulse.
        let mut x = vec![0.01f32, 0.01, 1.0, 0.01];
        let mut iy = vec![0i32; 4];
        let mut scratch = vec![0f32; 4];

        op_pvq_search(&mut x, &mut iy, 4, &mut scratch);

        assert_eq!(iy, vec![0, 0, 4, 0]);
    }

    #[test]
    fn verify_pvq_search_tie_breaks_low_index() {
        // Identical inputs: the lowest index must win each placement.
        let mut x = vec![0.5f32, 0.5, 0.5, 0.5];
        let mut iy = vec![0i32; 4];
        let mut scratch = vec![0f32; 4];

        op_pvq_search(&mut x, &mut iy, 1, &mut scratch);

        assert_eq!(iy, vec![1, 0, 0, 0]);
    }

    #[test]
    fn verify_quant_round_trip() {
        use crate::entropy::{RangeDecoder, RangeEncoder};

        let mut rng = SmallRng::seed_from_u64(0x9a9a);

        let n = 24;
        let k = 10;
        let b = 1;

        let mut x: Vec<f32> = (0..n).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();
        renormalise_vector(&mut x, 1.0);

        let mut buf = vec![0u8; 128];
        let mut enc = RangeEncoder::new(&mut buf);

        let mut encoded = x.clone();
        let mut iy = vec![0i32; n];
        let mut scratch = vec![0f32; n];

        let mask_enc = alg_quant(
            &mut encoded,
            k,
            SPREAD_NORMAL,
            b,
            &mut enc,
            1.0,
            true,
            &mut iy,
            &mut scratch,
        );
        enc.done();

        // The resynthesized vector is unit norm.
        let e = celt_inner_prod(&encoded, &encoded);
        assert!((e - 1.0).abs() < 1e-5);

        let mut dec = RangeDecoder::new(&buf);
        let mut decoded = vec![0f32; n];
        let mut rows = Vec::new();

        let mask_dec =
            alg_unquant(&mut decoded, k, SPREAD_NORMAL, b, &mut dec, 1.0, &mut iy, &mut rows);

        assert_eq!(mask_enc, mask_dec);

        for (e, d) in encoded.iter().zip(decoded.iter()) {
            assert!((e - d).abs() < 1e-6, "encoder/decoder resynthesis must agree");
        }
    }

    #[test]
    fn verify_stereo_itheta_extremes() {
        let x = vec![0.7f32; 8];
        let z = vec![0.0f32; 8];

        // All mid: angle 0. The two degenerate mono splits mirror around a quarter turn.
        assert_eq!(stereo_itheta(&x, &x, true), 0);

        let a = stereo_itheta(&x, &z, false);
        let b = stereo_itheta(&z, &x, false);
        assert_eq!(a + b, 16384);
        assert!(a < 16);
    }
}
