// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `celt` module holds the time-domain helpers shared by both endpoints: the pitch comb
//! filter with its window cross-fade, and the pre-emphasis/de-emphasis pair that shapes the
//! spectrum around the MDCT.

use crate::tables::COMB_FILTER_TAPS;

/// Shortest comb filter period.
pub const COMBFILTER_MINPERIOD: usize = 15;
/// Longest comb filter period; also the length of per-channel filter memory.
pub const COMBFILTER_MAXPERIOD: usize = 1024;

/// Internal signal scale: PCM in `[-1, 1]` maps to this amplitude inside the codec.
pub const SIG_SCALE: f32 = 32768.0;

/// Comb filter over `buf[base..base + n]` reading its own output history (the decoder's
/// post-filter form). The first `overlap` samples cross-fade from the old `(t0, g0, tapset0)`
/// parameters to the new `(t1, g1, tapset1)`.
#[allow(clippy::too_many_arguments)]
pub fn comb_filter_inplace(
    buf: &mut [f32],
    base: usize,
    t0: usize,
    t1: usize,
    n: usize,
    g0: f32,
    g1: f32,
    tapset0: usize,
    tapset1: usize,
    window: &[f32],
    mut overlap: usize,
) {
    if g0 == 0.0 && g1 == 0.0 {
        return;
    }

    // A zero gain leaves the period at zero; clamp so the history reads stay meaningful.
    let t0 = t0.max(COMBFILTER_MINPERIOD);
    let t1 = t1.max(COMBFILTER_MINPERIOD);

    let g00 = g0 * COMB_FILTER_TAPS[tapset0][0];
    let g01 = g0 * COMB_FILTER_TAPS[tapset0][1];
    let g02 = g0 * COMB_FILTER_TAPS[tapset0][2];
    let g10 = g1 * COMB_FILTER_TAPS[tapset1][0];
    let g11 = g1 * COMB_FILTER_TAPS[tapset1][1];
    let g12 = g1 * COMB_FILTER_TAPS[tapset1][2];

    // If the filter didn't change there is nothing to cross-fade.
    if g0 == g1 && t0 == t1 && tapset0 == tapset1 {
        overlap = 0;
    }

    let mut x1 = buf[base + 1 - t1];
    let mut x2 = buf[base - t1];
    let mut x3 = buf[base - t1 - 1];
    let mut x4 = buf[base - t1 - 2];

    let mut i = 0;
    while i < overlap.min(n) {
        let x0 = buf[base + i + 2 - t1];
        let f = window[i] * window[i];

        buf[base + i] += ((1.0 - f) * g00) * buf[base + i - t0]
            + ((1.0 - f) * g01) * (buf[base + i + 1 - t0] + buf[base + i - 1 - t0])
            + ((1.0 - f) * g02) * (buf[base + i + 2 - t0] + buf[base + i - 2 - t0])
            + (f * g10) * x2
            + (f * g11) * (x1 + x3)
            + (f * g12) * (x0 + x4);

        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;

        i += 1;
    }

    if g1 == 0.0 {
        return;
    }

    // The remainder runs with the constant new filter.
    while i < n {
        buf[base + i] += g10 * buf[base + i - t1]
            + g11 * (buf[base + i + 1 - t1] + buf[base + i - 1 - t1])
            + g12 * (buf[base + i + 2 - t1] + buf[base + i - 2 - t1]);
        i += 1;
    }
}

/// Comb filter reading a separate (unfiltered) source signal: the encoder's pre-filter form.
/// `x[x_base + i]` aligns with `y[i]`; `x` carries at least `t + 2` samples of history before
/// `x_base`.
#[allow(clippy::too_many_arguments)]
pub fn comb_filter(
    y: &mut [f32],
    x: &[f32],
    x_base: usize,
    t0: usize,
    t1: usize,
    n: usize,
    g0: f32,
    g1: f32,
    tapset0: usize,
    tapset1: usize,
    window: &[f32],
    mut overlap: usize,
) {
    if g0 == 0.0 && g1 == 0.0 {
        y[..n].copy_from_slice(&x[x_base..x_base + n]);
        return;
    }

    let t0 = t0.max(COMBFILTER_MINPERIOD);
    let t1 = t1.max(COMBFILTER_MINPERIOD);

    let g00 = g0 * COMB_FILTER_TAPS[tapset0][0];
    let g01 = g0 * COMB_FILTER_TAPS[tapset0][1];
    let g02 = g0 * COMB_FILTER_TAPS[tapset0][2];
    let g10 = g1 * COMB_FILTER_TAPS[tapset1][0];
    let g11 = g1 * COMB_FILTER_TAPS[tapset1][1];
    let g12 = g1 * COMB_FILTER_TAPS[tapset1][2];

    if g0 == g1 && t0 == t1 && tapset0 == tapset1 {
        overlap = 0;
    }

    let mut x1 = x[x_base + 1 - t1];
    let mut x2 = x[x_base - t1];
    let mut x3 = x[x_base - t1 - 1];
    let mut x4 = x[x_base - t1 - 2];

    let mut i = 0;
    while i < overlap.min(n) {
        let x0 = x[x_base + i + 2 - t1];
        let f = window[i] * window[i];

        y[i] = x[x_base + i]
            + ((1.0 - f) * g00) * x[x_base + i - t0]
            + ((1.0 - f) * g01) * (x[x_base + i + 1 - t0] + x[x_base + i - 1 - t0])
            + ((1.0 - f) * g02) * (x[x_base + i + 2 - t0] + x[x_base + i - 2 - t0])
            + (f * g10) * x2
            + (f * g11) * (x1 + x3)
            + (f * g12) * (x0 + x4);

        x4 = x3;
        x3 = x2;
        x2 = x1;
        x1 = x0;

        i += 1;
    }

    if g1 == 0.0 {
        y[i..n].copy_from_slice(&x[x_base + i..x_base + n]);
        return;
    }

    while i < n {
        y[i] = x[x_base + i]
            + g10 * x[x_base + i - t1]
            + g11 * (x[x_base + i + 1 - t1] + x[x_base + i - 1 - t1])
            + g12 * (x[x_base + i + 2 - t1] + x[x_base + i - 2 - t1]);
        i += 1;
    }
}

/// Pre-emphasis: `y[n] = x[n] - 0.85 * x[n-1]`, at signal scale.
///
/// The multiply and subtract are kept as separate single-precision operations; a fused multiply
/// would change the rounding of the stored filter memory.
pub fn preemphasis(pcm: &[f32], stride: usize, out: &mut [f32], coef0: f32, mem: &mut f32) {
    let mut m = *mem;

    for (i, o) in out.iter_mut().enumerate() {
        let x: f32 = SIG_SCALE * pcm[stride * i];
        let y: f32 = x - m;
        *o = y;
        m = coef0 * x;
    }

    *mem = m;
}

/// De-emphasis: `y[n] = x[n] + 0.85 * y[n-1]`, rescaling back to `[-1, 1]`.
pub fn deemphasis(x: &[f32], pcm: &mut [f32], stride: usize, coef0: f32, mem: &mut f32) {
    let mut m = *mem;

    for (i, &v) in x.iter().enumerate() {
        let tmp = v + 1e-30 + m;
        m = coef0 * tmp;
        pcm[stride * i] = tmp * (1.0 / SIG_SCALE);
    }

    *mem = m;
}

/// First-order DC-reject high-pass (3 Hz at 48 kHz) applied ahead of pre-emphasis.
pub fn dc_reject(pcm: &[f32], stride: usize, out: &mut [f32], cutoff_hz: f32, mem: &mut f32) {
    let coef = 6.3 * cutoff_hz / 48000.0;
    let mut m = *mem;

    for (i, o) in out.iter_mut().enumerate() {
        let x = pcm[stride * i];
        let y = x - m;
        m = m + coef * y + 1e-30;
        *o = y;
    }

    *mem = m;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_preemphasis_deemphasis_inverse() {
        let pcm: Vec<f32> =
            (0..480).map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48000.0).sin()).collect();

        let mut emphasized = vec![0.0f32; 480];
        let mut mem_e = 0.0;
        preemphasis(&pcm, 1, &mut emphasized, 0.85, &mut mem_e);

        let mut out = vec![0.0f32; 480];
        let mut mem_d = 0.0;
        deemphasis(&emphasized, &mut out, 1, 0.85, &mut mem_d);

        for (a, b) in pcm.iter().zip(out.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn verify_dc_reject_kills_offset() {
        let pcm = vec![0.25f32; 48000];
        let mut out = vec![0.0f32; 48000];
        let mut mem = 0.0;

        dc_reject(&pcm, 1, &mut out, 3.0, &mut mem);

        // After a second of constant input, the output has decayed towards zero.
        assert!(out[0] > 0.2);
        assert!(out[47999].abs() < 0.02);
    }

    #[test]
    fn verify_comb_filter_zero_gain_is_identity() {
        let x: Vec<f32> = (0..1200).map(|i| (i as f32 * 0.1).sin()).collect();
        let mut y = vec![0.0f32; 100];

        comb_filter(&mut y, &x, 1100, 0, 0, 100, 0.0, 0.0, 0, 0, &[], 0);

        assert_eq!(&y[..], &x[1100..1200]);
    }

    #[test]
    fn verify_comb_filter_boosts_periodic_signal() {
        // A signal with period 100 fed through a matching comb filter grows; the filter adds
        // a delayed copy in phase.
        let period = 100usize;
        let n = 480;
        let total = COMBFILTER_MAXPERIOD + n;

        let x: Vec<f32> = (0..total)
            .map(|i| (2.0 * std::f32::consts::PI * i as f32 / period as f32).sin())
            .collect();

        let mut y = vec![0.0f32; n];
        comb_filter(&mut y, &x, COMBFILTER_MAXPERIOD, period, period, n, 0.5, 0.5, 0, 0, &[], 0);

        let e_in: f32 = x[COMBFILTER_MAXPERIOD..].iter().map(|v| v * v).sum();
        let e_out: f32 = y.iter().map(|v| v * v).sum();

        assert!(e_out > 1.5 * e_in);
    }
}
