// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `bands` module runs the shape quantizer over the frequency bands.
//!
//! Every band is reduced to a unit-norm vector and coded against the pyramid codebook. Bands too
//! large for a single codeword split recursively in half around a coded angle; stereo bands
//! split into mid and side the same way. Bands with no bit allocation are folded from the
//! already-reconstructed lower spectrum, and transient frames that lost all pulses in a
//! sub-block get refilled with deterministic noise so the energy envelope cannot collapse.
//!
//! Encoding and decoding are the same control flow; every branch below runs identically on both
//! endpoints, driven by the same decoded values.

use crate::entropy::{Coder, BITRES};
use crate::math::{bitexact_cos, bitexact_log2tan, celt_inner_prod, dual_inner_prod, frac_mul16};
use crate::math::isqrt32;
use crate::mode::SHORT_MDCT_SIZE;
use crate::rate::{get_pulses, PulseCache};
use crate::tables::{E_BANDS, LOG_N, NB_BANDS};
use crate::vq;
use crate::vq::{SPREAD_AGGRESSIVE, SPREAD_LIGHT, SPREAD_NONE, SPREAD_NORMAL};

const QTHETA_OFFSET: i32 = 4;
const QTHETA_OFFSET_TWOPHASE: i32 = 16;

const EPSILON: f32 = 1e-15;

/// Deterministic noise generator shared by both endpoints.
#[inline]
pub fn lcg_rand(seed: u32) -> u32 {
    seed.wrapping_mul(1664525).wrapping_add(1013904223)
}

/// Per-band amplitudes of the MDCT spectrum.
pub fn compute_band_energies(
    x: &[f32],
    band_e: &mut [f32],
    end: usize,
    channels: usize,
    lm: usize,
) {
    let m = 1 << lm;
    let n = m * SHORT_MDCT_SIZE;

    for c in 0..channels {
        for i in 0..end {
            let lo = m * E_BANDS[i] as usize;
            let hi = m * E_BANDS[i + 1] as usize;

            let mut sum = 1e-27f32;
            for &v in &x[c * n + lo..c * n + hi] {
                sum += v * v;
            }

            band_e[i + c * NB_BANDS] = sum.sqrt();
        }
    }
}

/// Scale each band to unit norm.
pub fn normalise_bands(
    freq: &[f32],
    x: &mut [f32],
    band_e: &[f32],
    end: usize,
    channels: usize,
    lm: usize,
) {
    let m = 1 << lm;
    let n = m * SHORT_MDCT_SIZE;

    for c in 0..channels {
        for i in 0..end {
            let lo = m * E_BANDS[i] as usize;
            let hi = m * E_BANDS[i + 1] as usize;
            let g = 1.0 / (1e-27 + band_e[i + c * NB_BANDS]);

            for j in lo..hi {
                x[c * n + j] = freq[c * n + j] * g;
            }
        }
    }
}

/// Scale the unit-norm bands back up by the decoded envelope.
#[allow(clippy::too_many_arguments)]
pub fn denormalise_bands(
    x: &[f32],
    freq: &mut [f32],
    band_log_e: &[f32],
    start: usize,
    end: usize,
    lm: usize,
    silence: bool,
) {
    use crate::math::celt_exp2;
    use crate::tables::E_MEANS;

    let m = 1 << lm;
    let n = m * SHORT_MDCT_SIZE;

    let (start, end, bound) =
        if silence { (0, 0, 0) } else { (start, end, m * E_BANDS[end] as usize) };

    for f in freq[..m * E_BANDS[start] as usize].iter_mut() {
        *f = 0.0;
    }

    for i in start..end {
        let lo = m * E_BANDS[i] as usize;
        let hi = m * E_BANDS[i + 1] as usize;

        let lg = band_log_e[i] + E_MEANS[i];
        let g = celt_exp2(lg.min(32.0));

        for j in lo..hi {
            freq[j] = g * x[j];
        }
    }

    for f in freq[bound..n].iter_mut() {
        *f = 0.0;
    }
}

/// Refill sub-blocks that lost every pulse on a transient frame with low-level noise, then
/// restore the band's unit energy.
#[allow(clippy::too_many_arguments)]
pub fn anti_collapse(
    x: &mut [f32],
    collapse_masks: &[u8],
    lm: usize,
    channels: usize,
    size: usize,
    start: usize,
    end: usize,
    log_e: &[f32],
    prev1_log_e: &[f32],
    prev2_log_e: &[f32],
    pulses: &[i32; NB_BANDS],
    mut seed: u32,
) {
    use crate::math::celt_exp2;

    for i in start..end {
        let n0 = (E_BANDS[i + 1] - E_BANDS[i]) as usize;

        // Depth the band was coded to, in bits per sample per sub-block.
        debug_assert!(pulses[i] >= 0);
        let depth = ((1 + pulses[i]) as usize / n0) >> lm;

        let thresh = 0.5 * celt_exp2(-0.125 * depth as f32);
        let sqrt_1 = 1.0 / (((n0 << lm) as f32).sqrt());

        for c in 0..channels {
            let mut prev1 = prev1_log_e[c * NB_BANDS + i];
            let mut prev2 = prev2_log_e[c * NB_BANDS + i];

            if channels == 1 {
                prev1 = prev1.max(prev1_log_e[NB_BANDS + i]);
                prev2 = prev2.max(prev2_log_e[NB_BANDS + i]);
            }

            let e_diff = (log_e[c * NB_BANDS + i] - prev1.min(prev2)).max(0.0);

            let mut r = 2.0 * celt_exp2(-e_diff);
            if lm == 3 {
                r *= 1.41421356;
            }
            r = thresh.min(r) * sqrt_1;

            let base = c * size + ((E_BANDS[i] as usize) << lm);
            let band = &mut x[base..base + (n0 << lm)];

            let mut renormalize = false;

            for k in 0..(1 << lm) {
                // Detect collapse.
                if collapse_masks[i * channels + c] & (1 << k) == 0 {
                    // Fill with noise.
                    for j in 0..n0 {
                        seed = lcg_rand(seed);
                        band[(j << lm) + k] = if seed & 0x8000 != 0 { r } else { -r };
                    }
                    renormalize = true;
                }
            }

            // Some energy was added; restore the unit norm.
            if renormalize {
                vq::renormalise_vector(band, 1.0);
            }
        }
    }
}

/// Decide how much spreading rotation to use, with hysteresis on the running average, and keep
/// the high-frequency tonality counter for the post-filter tapset.
#[allow(clippy::too_many_arguments)]
pub fn spreading_decision(
    x: &[f32],
    average: &mut i32,
    last_decision: i32,
    hf_average: &mut i32,
    tapset_decision: &mut i32,
    update_hf: bool,
    end: usize,
    channels: usize,
    lm: usize,
    spread_weight: &[i32; NB_BANDS],
) -> i32 {
    let m = 1 << lm;
    let n0 = m * SHORT_MDCT_SIZE;

    debug_assert!(end > 0);

    if m * (E_BANDS[end] - E_BANDS[end - 1]) as usize <= 8 {
        return SPREAD_NONE;
    }

    let mut sum = 0i32;
    let mut nb_bands = 0i32;
    let mut hf_sum = 0i32;

    for c in 0..channels {
        for i in 0..end {
            let n = m * (E_BANDS[i + 1] - E_BANDS[i]) as usize;
            if n <= 8 {
                continue;
            }

            let band = &x[m * E_BANDS[i] as usize + c * n0..][..n];

            // Rough CDF of the squared bin magnitudes against the flat level.
            let mut tcount = [0i32; 3];
            for &v in band {
                let x2n = v * v * n as f32;
                if x2n < 0.25 {
                    tcount[0] += 1;
                }
                if x2n < 0.0625 {
                    tcount[1] += 1;
                }
                if x2n < 0.015625 {
                    tcount[2] += 1;
                }
            }

            // Only the last four bands count towards the 8 kHz+ tonality measure.
            if i > NB_BANDS - 4 {
                hf_sum += 32 * (tcount[1] + tcount[0]) / n as i32;
            }

            let tmp = i32::from(2 * tcount[2] >= n as i32)
                + i32::from(2 * tcount[1] >= n as i32)
                + i32::from(2 * tcount[0] >= n as i32);

            sum += tmp * spread_weight[i];
            nb_bands += spread_weight[i];
        }
    }

    if update_hf {
        if hf_sum != 0 {
            hf_sum /= channels as i32 * (4 - NB_BANDS as i32 + end as i32);
        }
        *hf_average = (*hf_average + hf_sum) >> 1;
        let mut hf_sum = *hf_average;

        if *tapset_decision == 2 {
            hf_sum += 4;
        }
        else if *tapset_decision == 0 {
            hf_sum += 1;
        }

        *tapset_decision = if hf_sum > 22 {
            2
        }
        else if hf_sum > 18 {
            1
        }
        else {
            0
        };
    }

    debug_assert!(nb_bands > 0);
    let mut sum = (sum << 8) / nb_bands;

    // Recursive averaging, then hysteresis against the previous decision.
    sum = (sum + *average) >> 1;
    *average = sum;

    let sum = (3 * sum + (((3 - last_decision) << 7) + 64) + 2) >> 2;

    if sum < 80 {
        SPREAD_AGGRESSIVE
    }
    else if sum < 256 {
        SPREAD_NORMAL
    }
    else if sum < 384 {
        SPREAD_LIGHT
    }
    else {
        SPREAD_NONE
    }
}

/// Orthonormal two-point butterfly over interleaved pairs.
pub fn haar1(x: &mut [f32], n0: usize, stride: usize) {
    let n0 = n0 >> 1;

    for i in 0..stride {
        for j in 0..n0 {
            let a = 0.70710678 * x[stride * 2 * j + i];
            let b = 0.70710678 * x[stride * (2 * j + 1) + i];
            x[stride * 2 * j + i] = a + b;
            x[stride * (2 * j + 1) + i] = a - b;
        }
    }
}

#[rustfmt::skip]
const ORDERY_TABLE: [usize; 30] = [
     1,  0,
     3,  0,  2,  1,
     7,  0,  4,  3,  6,  1,  5,  2,
    15,  0,  8,  7, 12,  3, 11,  4, 14,  1,  9,  6, 13,  2, 10,  5,
];

fn ordery(stride: usize) -> &'static [usize] {
    &ORDERY_TABLE[stride - 2..2 * stride - 2]
}

/// Reorganize interleaved sub-block samples into time order. With `hadamard` set the sub-blocks
/// land in the butterfly ordering that makes recursive splits follow the Haar transform.
fn deinterleave_hadamard(x: &mut [f32], n0: usize, stride: usize, hadamard: bool, tmp: &mut [f32]) {
    let n = n0 * stride;
    let tmp = &mut tmp[..n];

    if hadamard {
        let ordery = ordery(stride);

        for i in 0..stride {
            for j in 0..n0 {
                tmp[ordery[i] * n0 + j] = x[j * stride + i];
            }
        }
    }
    else {
        for i in 0..stride {
            for j in 0..n0 {
                tmp[i * n0 + j] = x[j * stride + i];
            }
        }
    }

    x[..n].copy_from_slice(tmp);
}

fn interleave_hadamard(x: &mut [f32], n0: usize, stride: usize, hadamard: bool, tmp: &mut [f32]) {
    let n = n0 * stride;
    let tmp = &mut tmp[..n];

    if hadamard {
        let ordery = ordery(stride);

        for i in 0..stride {
            for j in 0..n0 {
                tmp[j * stride + i] = x[ordery[i] * n0 + j];
            }
        }
    }
    else {
        for i in 0..stride {
            for j in 0..n0 {
                tmp[j * stride + i] = x[i * n0 + j];
            }
        }
    }

    x[..n].copy_from_slice(tmp);
}

/// Number of levels the split angle is quantized to, from the bits available and the band's
/// pulse capacity.
fn compute_qn(n: usize, b: i32, offset: i32, pulse_cap: i32, stereo: bool) -> i32 {
    const EXP2_TABLE8: [i32; 8] = [16384, 17866, 19483, 21247, 23170, 25267, 27554, 30048];

    let mut n2 = 2 * n as i32 - 1;
    if stereo && n == 2 {
        n2 -= 1;
    }

    // The upper limit ensures a stereo split with itheta == 16384 still has a bit left to code
    // at least one pulse in the side; otherwise the side would collapse since it is not folded.
    let mut qb = (b + n2 * offset) / n2;
    qb = qb.min(b - pulse_cap - (4 << BITRES));
    qb = qb.min(8 << BITRES);

    if qb < (1 << BITRES >> 1) {
        1
    }
    else {
        let qn = EXP2_TABLE8[(qb & 0x7) as usize] >> (14 - (qb >> BITRES));
        ((qn + 1) >> 1) << 1
    }
}

/// Mix the two channels of an intensity-coded band down to the mid channel, weighted by their
/// energies.
fn intensity_stereo(x: &mut [f32], y: &[f32], band_e: &[f32], band: usize) {
    let left = band_e[band];
    let right = band_e[band + NB_BANDS];

    let norm = EPSILON + (EPSILON + left * left + right * right).sqrt();
    let a1 = left / norm;
    let a2 = right / norm;

    for (x, &y) in x.iter_mut().zip(y) {
        *x = a1 * *x + a2 * y;
    }
}

fn stereo_split(x: &mut [f32], y: &mut [f32]) {
    for (x, y) in x.iter_mut().zip(y.iter_mut()) {
        let l = 0.70710678 * *x;
        let r = 0.70710678 * *y;
        *x = l + r;
        *y = l - r;
    }
}

fn stereo_merge(x: &mut [f32], y: &mut [f32], mid: f32) {
    let (xp, side) = dual_inner_prod(y, x, y);

    // Compensate for the mid normalization.
    let xp = mid * xp;

    let el = mid * mid + side - 2.0 * xp;
    let er = mid * mid + side + 2.0 * xp;

    if er < 6e-4 || el < 6e-4 {
        y.copy_from_slice(x);
        return;
    }

    let lgain = 1.0 / el.sqrt();
    let rgain = 1.0 / er.sqrt();

    for (x, y) in x.iter_mut().zip(y.iter_mut()) {
        let l = mid * *x;
        let r = *y;
        *x = lgain * (l - r);
        *y = rgain * (l + r);
    }
}

/// Energy-derived weights of the two channels for the theta RDO distortion measure.
pub fn compute_channel_weights(ex: f32, ey: f32) -> [f32; 2] {
    let min_e = ex.min(ey);
    // Adjustment to make the weights a bit more conservative.
    [ex + min_e / 3.0, ey + min_e / 3.0]
}

/// Reusable buffers for the band loop.
#[derive(Default)]
pub struct BandScratch {
    /// Reconstructed normalized spectrum used as the folding source, both channels.
    pub norm: Vec<f32>,
    lowband_scratch: Vec<f32>,
    tmp: Vec<f32>,
    iy: Vec<i32>,
    y: Vec<f32>,
    rows: Vec<u64>,
}

impl BandScratch {
    pub fn new() -> BandScratch {
        BandScratch {
            norm: Vec::new(),
            lowband_scratch: vec![0.0; 8 * (E_BANDS[NB_BANDS] - E_BANDS[NB_BANDS - 1]) as usize],
            tmp: vec![0.0; 8 * (E_BANDS[NB_BANDS] - E_BANDS[NB_BANDS - 1]) as usize],
            iy: vec![0; 8 * (E_BANDS[NB_BANDS] - E_BANDS[NB_BANDS - 1]) as usize],
            y: vec![0.0; 8 * (E_BANDS[NB_BANDS] - E_BANDS[NB_BANDS - 1]) as usize],
            rows: Vec::new(),
        }
    }
}

/// Shared state of one band's quantization.
struct BandCtx<'a> {
    resynth: bool,
    band: usize,
    intensity: usize,
    spread: i32,
    tf_change: i32,
    remaining_bits: i32,
    seed: u32,
    theta_round: i32,
    disable_inv: bool,
    avoid_split_noise: bool,
    band_e: &'a [f32],
    cache: &'a PulseCache,
    iy: &'a mut [i32],
    y: &'a mut [f32],
    tmp: &'a mut [f32],
    rows: &'a mut Vec<u64>,
}

struct SplitCtx {
    inv: bool,
    imid: i32,
    iside: i32,
    delta: i32,
    itheta: i32,
    qalloc: i32,
}

/// Decide the resolution of the split angle, code it, and derive the mid/side gains.
#[allow(clippy::too_many_arguments)]
fn compute_theta(
    ctx: &mut BandCtx<'_>,
    ec: &mut Coder<'_, '_>,
    x: &mut [f32],
    y: &mut [f32],
    b: &mut i32,
    big_b: usize,
    big_b0: usize,
    lm: i32,
    stereo: bool,
    fill: &mut u32,
) -> SplitCtx {
    let n = x.len();
    let i = ctx.band;

    // Resolution of the split parameter theta.
    let pulse_cap = i32::from(LOG_N[i]) + lm * (1 << BITRES);
    let offset =
        (pulse_cap >> 1) - if stereo && n == 2 { QTHETA_OFFSET_TWOPHASE } else { QTHETA_OFFSET };
    let mut qn = compute_qn(n, *b, offset, pulse_cap, stereo);

    if stereo && i >= ctx.intensity {
        qn = 1;
    }

    let mut itheta = if ec.is_encoder() {
        // theta is the atan() of the ratio between the (normalized) side and mid. Since both
        // have unit norm and are orthogonal, that one parameter rescales them both.
        vq::stereo_itheta(x, y, stereo)
    }
    else {
        0
    };

    let tell = ec.tell_frac() as i32;
    let mut inv = false;

    if qn != 1 {
        if ec.is_encoder() {
            if !stereo || ctx.theta_round == 0 {
                itheta = (itheta * qn + 8192) >> 14;

                if !stereo && ctx.avoid_split_noise && itheta > 0 && itheta < qn {
                    // If this angle would make the allocation inject noise on one side, snap
                    // the angle so the energy of that side is exactly zero.
                    let unquantized = itheta * 16384 / qn;
                    let imid = i32::from(bitexact_cos(unquantized as i16));
                    let iside = i32::from(bitexact_cos((16384 - unquantized) as i16));
                    let delta =
                        frac_mul16((n as i32 - 1) << 7, bitexact_log2tan(iside, imid));

                    if delta > *b {
                        itheta = qn;
                    }
                    else if delta < -*b {
                        itheta = 0;
                    }
                }
            }
            else {
                // The likely quantized angles for both rounding directions.
                let down = (qn - 1).min(0.max((itheta * qn - 8192) >> 14));
                itheta = if ctx.theta_round < 0 { down } else { down + 1 };
            }
        }

        // Entropy coding of the angle: a step pdf for stereo, uniform for the time split, and
        // triangular otherwise.
        if stereo && n > 2 {
            let p0 = 3i32;
            let x0 = qn / 2;
            let ft = (p0 * (x0 + 1) + x0) as u32;

            itheta = match ec {
                Coder::Encoder(enc) => {
                    let x = itheta;
                    let (fl, fh) = if x <= x0 {
                        (p0 * x, p0 * (x + 1))
                    }
                    else {
                        ((x - 1 - x0) + (x0 + 1) * p0, (x - x0) + (x0 + 1) * p0)
                    };
                    enc.encode(fl as u32, fh as u32, ft);
                    x
                }
                Coder::Decoder(dec) => {
                    let fs = dec.decode(ft) as i32;
                    let x = if fs < (x0 + 1) * p0 { fs / p0 } else { x0 + 1 + (fs - (x0 + 1) * p0) };
                    let (fl, fh) = if x <= x0 {
                        (p0 * x, p0 * (x + 1))
                    }
                    else {
                        ((x - 1 - x0) + (x0 + 1) * p0, (x - x0) + (x0 + 1) * p0)
                    };
                    dec.update(fl as u32, fh as u32, ft);
                    x
                }
            };
        }
        else if big_b0 > 1 || stereo {
            // Uniform pdf.
            itheta = ec.uint(itheta as u32, qn as u32 + 1) as i32;
        }
        else {
            // Triangular pdf.
            let half = qn >> 1;
            let ft = ((half + 1) * (half + 1)) as u32;

            itheta = match ec {
                Coder::Encoder(enc) => {
                    let fs = if itheta <= half { itheta + 1 } else { qn + 1 - itheta };
                    let fl = if itheta <= half {
                        itheta * (itheta + 1) >> 1
                    }
                    else {
                        ft as i32 - ((qn + 1 - itheta) * (qn + 2 - itheta) >> 1)
                    };
                    enc.encode(fl as u32, (fl + fs) as u32, ft);
                    itheta
                }
                Coder::Decoder(dec) => {
                    let fm = dec.decode(ft) as i32;

                    let (x, fs, fl) = if fm < (half * (half + 1) >> 1) {
                        let x = (isqrt32(8 * fm as u32 + 1) as i32 - 1) >> 1;
                        (x, x + 1, x * (x + 1) >> 1)
                    }
                    else {
                        let x =
                            (2 * (qn + 1) - isqrt32(8 * (ft as i32 - fm - 1) as u32 + 1) as i32)
                                >> 1;
                        (x, qn + 1 - x, ft as i32 - ((qn + 1 - x) * (qn + 2 - x) >> 1))
                    };
                    dec.update(fl as u32, (fl + fs) as u32, ft);
                    x
                }
            };
        }

        debug_assert!(itheta >= 0);
        itheta = itheta * 16384 / qn;

        if ec.is_encoder() && stereo {
            if itheta == 0 {
                intensity_stereo(x, y, ctx.band_e, i);
            }
            else {
                stereo_split(x, y);
            }
        }
    }
    else if !stereo {
        // A one-level angle on a mono split commits everything to the first half.
        itheta = 0;
    }
    else {
        if ec.is_encoder() {
            inv = itheta > 8192 && !ctx.disable_inv;
            if inv {
                for v in y.iter_mut() {
                    *v = -*v;
                }
            }
            intensity_stereo(x, y, ctx.band_e, i);
        }

        if *b > 2 << BITRES && ctx.remaining_bits > 2 << BITRES {
            inv = ec.bit_logp(inv, 2);
        }
        else {
            inv = false;
        }

        // Inversion can break downmixing; honour the caller's override.
        if ctx.disable_inv {
            inv = false;
        }

        itheta = 0;
    }

    let qalloc = ec.tell_frac() as i32 - tell;
    *b -= qalloc;

    let (imid, iside, delta) = if itheta == 0 {
        *fill &= (1u32 << big_b) - 1;
        (32767, 0, -16384)
    }
    else if itheta == 16384 {
        *fill &= ((1u32 << big_b) - 1) << big_b;
        (0, 32767, 16384)
    }
    else {
        let imid = i32::from(bitexact_cos(itheta as i16));
        let iside = i32::from(bitexact_cos((16384 - itheta) as i16));
        // The mid/side allocation split that minimizes the squared error of the band.
        let delta = frac_mul16((n as i32 - 1) << 7, bitexact_log2tan(iside, imid));
        (imid, iside, delta)
    };

    SplitCtx { inv, imid, iside, delta, itheta, qalloc }
}

/// Single-sample bands carry one sign bit per channel and nothing else.
fn quant_band_n1(
    ctx: &mut BandCtx<'_>,
    ec: &mut Coder<'_, '_>,
    x: &mut [f32],
    y: Option<&mut [f32]>,
    lowband_out: Option<&mut [f32]>,
) -> u32 {
    let mut code_sign = |ch: &mut [f32], ctx: &mut BandCtx<'_>, ec: &mut Coder<'_, '_>| {
        let mut sign = false;

        if ctx.remaining_bits >= 1 << BITRES {
            sign = ec.raw_bits(u32::from(ch[0] < 0.0), 1) != 0;
            ctx.remaining_bits -= 1 << BITRES;
        }

        if ctx.resynth {
            ch[0] = if sign { -1.0 } else { 1.0 };
        }
    };

    code_sign(x, ctx, ec);
    if let Some(y) = y {
        code_sign(y, ctx, ec);
    }

    if let Some(out) = lowband_out {
        out[0] = x[0];
    }

    1
}

/// Code one partition of a band, splitting recursively while the pulse cache cannot express the
/// bit budget.
#[allow(clippy::too_many_arguments)]
fn quant_partition(
    ctx: &mut BandCtx<'_>,
    ec: &mut Coder<'_, '_>,
    x: &mut [f32],
    mut b: i32,
    mut big_b: usize,
    lowband: Option<&[f32]>,
    mut lm: i32,
    gain: f32,
    mut fill: u32,
) -> u32 {
    let mut n = x.len();
    let big_b0 = big_b;
    let i = ctx.band;

    // If 1.5 bits more than the largest codeword are wanted, split the band in two.
    let split = lm != -1 && n > 2 && {
        let cache_max = ctx.cache.max_pseudo(i, lm);
        b > ctx.cache.pulses2bits(i, lm, cache_max) - 1 + 12
    };

    if split {
        n >>= 1;
        let (x, y) = x.split_at_mut(n);
        lm -= 1;

        if big_b == 1 {
            fill = (fill & 1) | (fill << 1);
        }
        big_b = (big_b + 1) >> 1;

        let sctx =
            compute_theta(ctx, ec, x, y, &mut b, big_b, big_b0, lm, false, &mut fill);

        let imid = sctx.imid;
        let iside = sctx.iside;
        let itheta = sctx.itheta;
        let mut delta = sctx.delta;

        let mid = (1.0 / 32768.0) * imid as f32;
        let side = (1.0 / 32768.0) * iside as f32;

        // Give more bits to low-energy MDCTs than they would otherwise deserve.
        if big_b0 > 1 && (itheta & 0x3fff) != 0 {
            if itheta > 8192 {
                // Rough approximation for pre-echo masking.
                delta -= delta >> (4 - lm);
            }
            else {
                // Corresponds to a forward-masking slope of 1.5 dB per 10 ms.
                delta = 0.min(delta + ((n as i32) << BITRES >> (5 - lm)));
            }
        }

        let mut mbits = 0.max(b.min((b - delta) / 2));
        let mut sbits = b - mbits;
        ctx.remaining_bits -= sctx.qalloc;

        let (lowband_mid, lowband_side) = match lowband {
            Some(lb) => (Some(&lb[..n]), Some(&lb[n..2 * n])),
            None => (None, None),
        };

        let rebalance = ctx.remaining_bits;
        let mut cm;

        if mbits >= sbits {
            cm = quant_partition(ctx, ec, x, mbits, big_b, lowband_mid, lm, gain * mid, fill);

            let rebalance = mbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 0 {
                sbits += rebalance - (3 << BITRES);
            }

            cm |= quant_partition(
                ctx,
                ec,
                y,
                sbits,
                big_b,
                lowband_side,
                lm,
                gain * side,
                fill >> big_b,
            ) << (big_b0 >> 1);
        }
        else {
            cm = quant_partition(
                ctx,
                ec,
                y,
                sbits,
                big_b,
                lowband_side,
                lm,
                gain * side,
                fill >> big_b,
            ) << (big_b0 >> 1);

            let rebalance = sbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 16384 {
                mbits += rebalance - (3 << BITRES);
            }

            cm |= quant_partition(ctx, ec, x, mbits, big_b, lowband_mid, lm, gain * mid, fill);
        }

        cm
    }
    else {
        // The basic no-split case.
        let q = ctx.cache.bits2pulses(i, lm, b);
        let mut q = q;
        let mut curr_bits = ctx.cache.pulses2bits(i, lm, q);
        ctx.remaining_bits -= curr_bits;

        // Never bust the budget.
        while ctx.remaining_bits < 0 && q > 0 {
            ctx.remaining_bits += curr_bits;
            q -= 1;
            curr_bits = ctx.cache.pulses2bits(i, lm, q);
            ctx.remaining_bits -= curr_bits;
        }

        if q != 0 {
            let k = get_pulses(q);

            match ec {
                Coder::Encoder(enc) => vq::alg_quant(
                    x,
                    k,
                    ctx.spread,
                    big_b,
                    &mut **enc,
                    gain,
                    ctx.resynth,
                    ctx.iy,
                    ctx.y,
                ),
                Coder::Decoder(dec) => {
                    vq::alg_unquant(x, k, ctx.spread, big_b, &mut **dec, gain, ctx.iy, ctx.rows)
                }
            }
        }
        else {
            // No pulses: fill the band anyway.
            let mut cm = 0;

            if ctx.resynth {
                let cm_mask = (1u32 << big_b) - 1;
                fill &= cm_mask;

                if fill == 0 {
                    for v in x.iter_mut() {
                        *v = 0.0;
                    }
                }
                else {
                    match lowband {
                        None => {
                            // Noise-fill an un-foldable band.
                            for v in x.iter_mut() {
                                ctx.seed = lcg_rand(ctx.seed);
                                *v = (ctx.seed as i32 >> 20) as f32;
                            }
                            cm = cm_mask;
                        }
                        Some(lb) => {
                            // Fold a copy of the lower spectrum, dithered about 48 dB down.
                            for (v, &l) in x.iter_mut().zip(lb) {
                                ctx.seed = lcg_rand(ctx.seed);
                                let tmp =
                                    if ctx.seed & 0x8000 != 0 { 1.0 / 256.0 } else { -1.0 / 256.0 };
                                *v = l + tmp;
                            }
                            cm = fill;
                        }
                    }

                    vq::renormalise_vector(x, gain);
                }
            }

            cm
        }
    }
}

const BIT_INTERLEAVE_TABLE: [u32; 16] = [0, 1, 1, 1, 2, 3, 3, 3, 2, 3, 3, 3, 2, 3, 3, 3];

#[rustfmt::skip]
const BIT_DEINTERLEAVE_TABLE: [u32; 16] = [
    0x00, 0x03, 0x0c, 0x0f, 0x30, 0x33, 0x3c, 0x3f,
    0xc0, 0xc3, 0xcc, 0xcf, 0xf0, 0xf3, 0xfc, 0xff,
];

/// Quantize or reconstruct one band, handling the time-frequency transforms around the
/// recursive partition.
#[allow(clippy::too_many_arguments)]
fn quant_band(
    ctx: &mut BandCtx<'_>,
    ec: &mut Coder<'_, '_>,
    x: &mut [f32],
    b: i32,
    mut big_b: usize,
    lowband: Option<&[f32]>,
    lm: i32,
    lowband_out: Option<&mut [f32]>,
    gain: f32,
    mut lowband_scratch: Option<&mut [f32]>,
    mut fill: u32,
) -> u32 {
    let n0 = x.len();
    let big_b0 = big_b;
    let mut tf_change = ctx.tf_change;
    let long_blocks = big_b0 == 1;

    let mut n_b = n0 / big_b;

    if n0 == 1 {
        return quant_band_n1(ctx, ec, x, None, lowband_out);
    }

    let recombine = if tf_change > 0 { tf_change as usize } else { 0 };

    // The lowband is about to get the same time-frequency transforms as the band itself; work
    // on a copy so the folding source spectrum survives for later bands.
    let mut lowband = lowband;
    let needs_scratch =
        lowband.is_some() && (recombine > 0 || ((n_b & 1) == 0 && tf_change < 0) || big_b0 > 1);

    if needs_scratch {
        let scratch = lowband_scratch.take().expect("folding transform requires scratch");
        scratch[..n0].copy_from_slice(lowband.unwrap());

        // Band recombining to increase frequency resolution.
        for k in 0..recombine {
            haar1(&mut scratch[..n0], n0 >> k, 1 << k);
        }

        // Increasing the time resolution.
        let mut n_b_tmp = n_b << recombine;
        let mut big_b_tmp = big_b >> recombine;
        let mut tf = tf_change + recombine as i32;
        while (n_b_tmp & 1) == 0 && tf < 0 {
            haar1(&mut scratch[..n0], n_b_tmp, big_b_tmp);
            big_b_tmp <<= 1;
            n_b_tmp >>= 1;
            tf += 1;
        }

        lowband = Some(&scratch[..n0]);
    }

    if ec.is_encoder() {
        for k in 0..recombine {
            haar1(x, n0 >> k, 1 << k);
        }
    }
    for _ in 0..recombine {
        fill = BIT_INTERLEAVE_TABLE[(fill & 0xf) as usize]
            | BIT_INTERLEAVE_TABLE[(fill >> 4) as usize] << 2;
    }
    big_b >>= recombine;
    n_b <<= recombine;

    let mut time_divide = 0usize;
    while (n_b & 1) == 0 && tf_change < 0 {
        if ec.is_encoder() {
            haar1(x, n_b, big_b);
        }
        fill |= fill << big_b;
        big_b <<= 1;
        n_b >>= 1;
        time_divide += 1;
        tf_change += 1;
    }
    let big_b_mid = big_b;
    let n_b_mid = n_b;

    // Reorganize the samples in time order instead of frequency order.
    if big_b_mid > 1 && ec.is_encoder() {
        deinterleave_hadamard(x, n_b >> recombine, big_b_mid << recombine, long_blocks, ctx.tmp);
    }

    let mut cm = quant_partition(ctx, ec, x, b, big_b_mid, lowband, lm, gain, fill);

    // Undo the sample reorganization going from time order to frequency order.
    if big_b_mid > 1 && ctx.resynth {
        interleave_hadamard(x, n_b >> recombine, big_b_mid << recombine, long_blocks, ctx.tmp);
    }

    // Undo the time-frequency changes.
    let mut big_b = big_b_mid;
    let mut n_b = n_b_mid;
    for _ in 0..time_divide {
        big_b >>= 1;
        n_b <<= 1;
        cm |= cm >> big_b;
        if ctx.resynth {
            haar1(x, n_b, big_b);
        }
    }

    for k in 0..recombine {
        cm = BIT_DEINTERLEAVE_TABLE[(cm & 0xf) as usize];
        if ctx.resynth {
            haar1(x, n0 >> k, 1 << k);
        }
    }
    big_b <<= recombine;

    // Scale the output for later folding.
    if let Some(out) = lowband_out {
        let n = (n0 as f32).sqrt();
        for (o, &v) in out.iter_mut().zip(x.iter()) {
            *o = n * v;
        }
    }

    cm & ((1u32 << big_b) - 1)
}

/// Quantize or reconstruct one stereo band pair.
#[allow(clippy::too_many_arguments)]
fn quant_band_stereo(
    ctx: &mut BandCtx<'_>,
    ec: &mut Coder<'_, '_>,
    x: &mut [f32],
    y: &mut [f32],
    b: i32,
    big_b: usize,
    lowband: Option<&[f32]>,
    lm: i32,
    lowband_out: Option<&mut [f32]>,
    lowband_scratch: Option<&mut [f32]>,
    fill: u32,
) -> u32 {
    let n = x.len();

    if n == 1 {
        return quant_band_n1(ctx, ec, x, Some(y), lowband_out);
    }

    let orig_fill = fill;
    let mut b = b;
    let mut fill = fill;

    let sctx =
        compute_theta(ctx, ec, x, y, &mut b, big_b, big_b, 0, true, &mut fill);

    let inv = sctx.inv;
    let itheta = sctx.itheta;
    let mid = (1.0 / 32768.0) * sctx.imid as f32;
    let side = (1.0 / 32768.0) * sctx.iside as f32;

    let mut cm;

    if n == 2 {
        // For two samples, mid and side being orthogonal lets the side be coded with one sign.
        let mut sbits = 0;
        if itheta != 0 && itheta != 16384 {
            sbits = 1 << BITRES;
        }
        let mbits = b - sbits;
        ctx.remaining_bits -= sctx.qalloc + sbits;

        let swapped = itheta > 8192;
        let (x2, y2): (&mut [f32], &mut [f32]) =
            if swapped { (y, x) } else { (x, y) };

        let mut sign = 0i32;
        if sbits != 0 {
            let enc_sign = u32::from(x2[0] * y2[1] - x2[1] * y2[0] < 0.0);
            sign = ec.raw_bits(enc_sign, 1) as i32;
        }
        let sign = 1 - 2 * sign;

        // orig_fill folds the side even when itheta == 16384 cleared the low fill bits.
        cm = quant_band(
            ctx,
            ec,
            &mut x2[..],
            mbits,
            big_b,
            lowband,
            lm,
            lowband_out,
            1.0,
            lowband_scratch,
            orig_fill,
        );

        y2[0] = -(sign as f32) * x2[1];
        y2[1] = (sign as f32) * x2[0];

        if ctx.resynth {
            let (x, y) = if swapped { (y2, x2) } else { (x2, y2) };

            x[0] *= mid;
            x[1] *= mid;
            y[0] *= side;
            y[1] *= side;

            let tmp = x[0];
            x[0] = tmp - y[0];
            y[0] = tmp + y[0];
            let tmp = x[1];
            x[1] = tmp - y[1];
            y[1] = tmp + y[1];
        }
    }
    else {
        // Normal split.
        let mut mbits = 0.max(b.min((b - sctx.delta) / 2));
        let mut sbits = b - mbits;
        ctx.remaining_bits -= sctx.qalloc;

        let rebalance = ctx.remaining_bits;

        if mbits >= sbits {
            // The mid keeps unit gain: the normalized mid is the folding source later.
            cm = quant_band(
                ctx,
                ec,
                x,
                mbits,
                big_b,
                lowband,
                lm,
                lowband_out,
                1.0,
                lowband_scratch,
                fill,
            );

            let rebalance = mbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 0 {
                sbits += rebalance - (3 << BITRES);
            }

            // The high fill bits are zero for a stereo split: the side never folds.
            cm |= quant_band(
                ctx,
                ec,
                y,
                sbits,
                big_b,
                None,
                lm,
                None,
                side,
                None,
                fill >> big_b,
            );
        }
        else {
            cm = quant_band(
                ctx,
                ec,
                y,
                sbits,
                big_b,
                None,
                lm,
                None,
                side,
                None,
                fill >> big_b,
            );

            let rebalance = sbits - (rebalance - ctx.remaining_bits);
            if rebalance > 3 << BITRES && itheta != 16384 {
                mbits += rebalance - (3 << BITRES);
            }

            cm |= quant_band(
                ctx,
                ec,
                x,
                mbits,
                big_b,
                lowband,
                lm,
                lowband_out,
                1.0,
                lowband_scratch,
                fill,
            );
        }
    }

    // Used by the decoder and by the resynthesis-enabled encoder.
    if ctx.resynth {
        if n != 2 {
            stereo_merge(x, y, mid);
        }
        if inv {
            for v in y.iter_mut() {
                *v = -*v;
            }
        }
    }

    cm
}

/// Duplicate enough of the first band's folding data to fold the second band when coding starts
/// above band zero. Copies nothing in the full-band configuration.
fn special_hybrid_folding(
    norm: &mut [f32],
    norm2: &mut [f32],
    start: usize,
    m: usize,
    dual_stereo: bool,
) {
    let n1 = m * (E_BANDS[start + 1] - E_BANDS[start]) as usize;
    let n2 = m * (E_BANDS[start + 2] - E_BANDS[start + 1]) as usize;

    if n2 > n1 {
        norm.copy_within(2 * n1 - n2..n1, n1);
        if dual_stereo {
            norm2.copy_within(2 * n1 - n2..n1, n1);
        }
    }
}

/// Code every band of the frame.
#[allow(clippy::too_many_arguments)]
pub fn quant_all_bands(
    start: usize,
    end: usize,
    x_: &mut [f32],
    y_: Option<&mut [f32]>,
    collapse_masks: &mut [u8],
    band_e: &[f32],
    pulses: &[i32; NB_BANDS],
    short_blocks: bool,
    spread: i32,
    mut dual_stereo: bool,
    intensity: usize,
    tf_res: &[i32; NB_BANDS],
    total_bits: i32,
    mut balance: i32,
    ec: &mut Coder<'_, '_>,
    lm: usize,
    coded_bands: usize,
    seed: &mut u32,
    complexity: i32,
    disable_inv: bool,
    cache: &PulseCache,
    scratch: &mut BandScratch,
) {
    let m = 1usize << lm;
    let big_b = if short_blocks { m } else { 1 };
    let norm_offset = m * E_BANDS[start] as usize;
    let channels = if y_.is_some() { 2 } else { 1 };

    let theta_rdo = ec.is_encoder() && y_.is_some() && !dual_stereo && complexity >= 8;
    let resynth = !ec.is_encoder() || theta_rdo;

    let norm_len = m * E_BANDS[NB_BANDS - 1] as usize - norm_offset;
    scratch.norm.clear();
    scratch.norm.resize(2 * norm_len, 0.0);

    let mut y_ = y_;

    let mut lowband_offset = 0usize;
    let mut update_lowband = true;

    let mut ctx_seed = *seed;
    let mut avoid_split_noise = big_b > 1;

    // Snapshots for the theta RDO trials.
    let max_n = m * (E_BANDS[NB_BANDS] - E_BANDS[NB_BANDS - 1]) as usize;
    let mut x_save = vec![0.0f32; max_n];
    let mut y_save = vec![0.0f32; max_n];
    let mut x_save2 = vec![0.0f32; max_n];
    let mut y_save2 = vec![0.0f32; max_n];
    let mut norm_save2 = vec![0.0f32; max_n];

    for i in start..end {
        let last = i == end - 1;
        let band_lo = m * E_BANDS[i] as usize;
        let band_hi = m * E_BANDS[i + 1] as usize;
        let n = band_hi - band_lo;

        let tell = ec.tell_frac() as i32;

        // How many bits this band wants.
        if i != start {
            balance -= tell;
        }
        let remaining_bits = total_bits - tell - 1;

        let b = if i < coded_bands {
            let curr_balance = balance / (3.min(coded_bands - i) as i32);
            0.max(16383.min((remaining_bits + 1).min(pulses[i] + curr_balance)))
        }
        else {
            0
        };

        if resynth
            && ((band_lo as i32 - n as i32) >= (m * E_BANDS[start] as usize) as i32
                || i == start + 1)
            && (update_lowband || lowband_offset == 0)
        {
            lowband_offset = i;
        }

        if i == start + 1 {
            let (norm, norm2) = scratch.norm.split_at_mut(norm_len);
            special_hybrid_folding(norm, norm2, start, m, dual_stereo);
        }

        let tf_change = tf_res[i];

        // Conservative estimate of the collapse masks of the bands folded from.
        let mut effective_lowband = usize::MAX;
        let mut x_cm: u32;
        let mut y_cm: u32;

        if lowband_offset != 0 && (spread != SPREAD_AGGRESSIVE || big_b > 1 || tf_change < 0) {
            // Never repeat spectral content within one band.
            effective_lowband =
                0.max(m as i32 * E_BANDS[lowband_offset] as i32 - norm_offset as i32 - n as i32)
                    as usize;

            let mut fold_start = lowband_offset;
            loop {
                fold_start -= 1;
                if m * E_BANDS[fold_start] as usize <= effective_lowband + norm_offset {
                    break;
                }
            }

            let mut fold_end = lowband_offset - 1;
            loop {
                fold_end += 1;
                if !(fold_end < i
                    && (m * E_BANDS[fold_end] as usize) < effective_lowband + norm_offset + n)
                {
                    break;
                }
            }

            x_cm = 0;
            y_cm = 0;
            for fold_i in fold_start..fold_end {
                x_cm |= u32::from(collapse_masks[fold_i * channels]);
                y_cm |= u32::from(collapse_masks[fold_i * channels + channels - 1]);
            }
        }
        else {
            // Folding will use the noise generator; all blocks are (almost surely) non-zero.
            x_cm = (1u32 << big_b) - 1;
            y_cm = x_cm;
        }

        if dual_stereo && i == intensity {
            // Switch off dual stereo to do intensity.
            dual_stereo = false;
            if resynth {
                let (norm, norm2) = scratch.norm.split_at_mut(norm_len);
                for j in 0..band_lo - norm_offset {
                    norm[j] = 0.5 * (norm[j] + norm2[j]);
                }
            }
        }

        let mut ctx = BandCtx {
            resynth,
            band: i,
            intensity,
            spread,
            tf_change,
            remaining_bits,
            seed: ctx_seed,
            theta_round: 0,
            disable_inv,
            avoid_split_noise,
            band_e,
            cache,
            iy: &mut scratch.iy,
            y: &mut scratch.y,
            tmp: &mut scratch.tmp,
            rows: &mut scratch.rows,
        };

        if dual_stereo {
            let y_ch = y_.as_deref_mut().unwrap();

            let (norm, norm2) = scratch.norm.split_at_mut(norm_len);

            {
                let (norm_lo, norm_hi) = norm.split_at_mut(band_lo - norm_offset);
                let lowband = if effective_lowband != usize::MAX {
                    Some(&norm_lo[effective_lowband..effective_lowband + n])
                }
                else {
                    None
                };
                let lowband_out = if last { None } else { Some(&mut norm_hi[..n]) };

                x_cm = quant_band(
                    &mut ctx,
                    ec,
                    &mut x_[band_lo..band_hi],
                    b / 2,
                    big_b,
                    lowband,
                    lm as i32,
                    lowband_out,
                    1.0,
                    Some(&mut scratch.lowband_scratch[..]),
                    x_cm,
                );
            }
            {
                let (norm_lo, norm_hi) = norm2.split_at_mut(band_lo - norm_offset);
                let lowband = if effective_lowband != usize::MAX {
                    Some(&norm_lo[effective_lowband..effective_lowband + n])
                }
                else {
                    None
                };
                let lowband_out = if last { None } else { Some(&mut norm_hi[..n]) };

                y_cm = quant_band(
                    &mut ctx,
                    ec,
                    &mut y_ch[band_lo..band_hi],
                    b / 2,
                    big_b,
                    lowband,
                    lm as i32,
                    lowband_out,
                    1.0,
                    Some(&mut scratch.lowband_scratch[..]),
                    y_cm,
                );
            }
        }
        else if let Some(y_ch) = y_.as_deref_mut() {
            // Joint stereo.
            if theta_rdo && i < intensity {
                let w = compute_channel_weights(band_e[i], band_e[i + NB_BANDS]);
                let cm = x_cm | y_cm;

                let enc = match ec {
                    Coder::Encoder(enc) => &mut **enc,
                    Coder::Decoder(_) => unreachable!("theta RDO is encoder-only"),
                };

                let ec_save = enc.save();
                let save_remaining = ctx.remaining_bits;
                let save_seed = ctx.seed;
                let save_bytes_from = enc.range_bytes();
                let bytes_save: Vec<u8> =
                    enc.get_bytes(save_bytes_from, enc.storage()).to_vec();

                x_save[..n].copy_from_slice(&x_[band_lo..band_hi]);
                y_save[..n].copy_from_slice(&y_ch[band_lo..band_hi]);

                // Encode rounding the angle down.
                ctx.theta_round = -1;
                x_cm = {
                    let (norm, _) = scratch.norm.split_at_mut(norm_len);
                    let (norm_lo, norm_hi) = norm.split_at_mut(band_lo - norm_offset);
                    let lowband = if effective_lowband != usize::MAX {
                        Some(&norm_lo[effective_lowband..effective_lowband + n])
                    }
                    else {
                        None
                    };
                    let lowband_out = if last { None } else { Some(&mut norm_hi[..n]) };

                    let mut coder = Coder::Encoder(&mut *enc);
                    quant_band_stereo(
                        &mut ctx,
                        &mut coder,
                        &mut x_[band_lo..band_hi],
                        &mut y_ch[band_lo..band_hi],
                        b,
                        big_b,
                        lowband,
                        lm as i32,
                        lowband_out,
                        Some(&mut scratch.lowband_scratch[..]),
                        cm,
                    )
                };

                let dist0 = w[0] * celt_inner_prod(&x_save[..n], &x_[band_lo..band_hi])
                    + w[1] * celt_inner_prod(&y_save[..n], &y_ch[band_lo..band_hi]);

                // Save the down-rounded result.
                let cm2 = x_cm;
                let ec_save2 = enc.save();
                let save2_remaining = ctx.remaining_bits;
                let save2_seed = ctx.seed;
                x_save2[..n].copy_from_slice(&x_[band_lo..band_hi]);
                y_save2[..n].copy_from_slice(&y_ch[band_lo..band_hi]);
                if !last {
                    let norm = &scratch.norm[..norm_len];
                    norm_save2[..n]
                        .copy_from_slice(&norm[band_lo - norm_offset..band_hi - norm_offset]);
                }
                let bytes_save2: Vec<u8> =
                    enc.get_bytes(save_bytes_from, enc.storage()).to_vec();

                // Restore and encode rounding the angle up.
                enc.restore(&ec_save);
                enc.put_bytes(save_bytes_from, &bytes_save);
                ctx.remaining_bits = save_remaining;
                ctx.seed = save_seed;
                x_[band_lo..band_hi].copy_from_slice(&x_save[..n]);
                y_ch[band_lo..band_hi].copy_from_slice(&y_save[..n]);

                if i == start + 1 {
                    let (norm, norm2) = scratch.norm.split_at_mut(norm_len);
                    special_hybrid_folding(norm, norm2, start, m, dual_stereo);
                }

                ctx.theta_round = 1;
                x_cm = {
                    let (norm, _) = scratch.norm.split_at_mut(norm_len);
                    let (norm_lo, norm_hi) = norm.split_at_mut(band_lo - norm_offset);
                    let lowband = if effective_lowband != usize::MAX {
                        Some(&norm_lo[effective_lowband..effective_lowband + n])
                    }
                    else {
                        None
                    };
                    let lowband_out = if last { None } else { Some(&mut norm_hi[..n]) };

                    let mut coder = Coder::Encoder(&mut *enc);
                    quant_band_stereo(
                        &mut ctx,
                        &mut coder,
                        &mut x_[band_lo..band_hi],
                        &mut y_ch[band_lo..band_hi],
                        b,
                        big_b,
                        lowband,
                        lm as i32,
                        lowband_out,
                        Some(&mut scratch.lowband_scratch[..]),
                        cm,
                    )
                };

                let dist1 = w[0] * celt_inner_prod(&x_save[..n], &x_[band_lo..band_hi])
                    + w[1] * celt_inner_prod(&y_save[..n], &y_ch[band_lo..band_hi]);

                if dist0 >= dist1 {
                    // Keep the down-rounded trial.
                    x_cm = cm2;
                    enc.restore(&ec_save2);
                    enc.put_bytes(save_bytes_from, &bytes_save2);
                    ctx.remaining_bits = save2_remaining;
                    ctx.seed = save2_seed;
                    x_[band_lo..band_hi].copy_from_slice(&x_save2[..n]);
                    y_ch[band_lo..band_hi].copy_from_slice(&y_save2[..n]);
                    if !last {
                        let norm = &mut scratch.norm[..norm_len];
                        norm[band_lo - norm_offset..band_hi - norm_offset]
                            .copy_from_slice(&norm_save2[..n]);
                    }
                }
            }
            else {
                ctx.theta_round = 0;
                let (norm, _) = scratch.norm.split_at_mut(norm_len);
                let (norm_lo, norm_hi) = norm.split_at_mut(band_lo - norm_offset);
                let lowband = if effective_lowband != usize::MAX {
                    Some(&norm_lo[effective_lowband..effective_lowband + n])
                }
                else {
                    None
                };
                let lowband_out = if last { None } else { Some(&mut norm_hi[..n]) };

                x_cm = quant_band_stereo(
                    &mut ctx,
                    ec,
                    &mut x_[band_lo..band_hi],
                    &mut y_ch[band_lo..band_hi],
                    b,
                    big_b,
                    lowband,
                    lm as i32,
                    lowband_out,
                    Some(&mut scratch.lowband_scratch[..]),
                    x_cm | y_cm,
                );
            }
            y_cm = x_cm;
        }
        else {
            // Mono.
            let (norm, _) = scratch.norm.split_at_mut(norm_len);
            let (norm_lo, norm_hi) = norm.split_at_mut(band_lo - norm_offset);
            let lowband = if effective_lowband != usize::MAX {
                Some(&norm_lo[effective_lowband..effective_lowband + n])
            }
            else {
                None
            };
            let lowband_out = if last { None } else { Some(&mut norm_hi[..n]) };

            x_cm = quant_band(
                &mut ctx,
                ec,
                &mut x_[band_lo..band_hi],
                b,
                big_b,
                lowband,
                lm as i32,
                lowband_out,
                1.0,
                Some(&mut scratch.lowband_scratch[..]),
                x_cm | y_cm,
            );
            y_cm = x_cm;
        }

        ctx_seed = ctx.seed;

        collapse_masks[i * channels] = x_cm as u8;
        collapse_masks[i * channels + channels - 1] = y_cm as u8;

        balance += pulses[i] + tell;

        // Keep updating the folding position only while there is at least 1 bit/sample depth.
        update_lowband = b > (n as i32) << BITRES;
        // Split noise only needs avoiding in the first band; later bands fold.
        avoid_split_noise = false;
    }

    *seed = ctx_seed;
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn verify_haar1_involution() {
        let mut rng = SmallRng::seed_from_u64(0x4a4a);

        let mut x: Vec<f32> = (0..32).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();
        let orig = x.clone();

        haar1(&mut x, 32, 1);
        haar1(&mut x, 32, 1);

        for (a, b) in x.iter().zip(orig.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn verify_hadamard_reorder_inverts() {
        let mut rng = SmallRng::seed_from_u64(0x1dea);

        for &(n0, stride) in &[(8usize, 2usize), (4, 4), (2, 8), (5, 4)] {
            let mut x: Vec<f32> =
                (0..n0 * stride).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();
            let orig = x.clone();
            let mut tmp = vec![0.0; n0 * stride];

            for &hadamard in &[false, true] {
                if hadamard && stride > 16 {
                    continue;
                }
                deinterleave_hadamard(&mut x, n0, stride, hadamard, &mut tmp);
                interleave_hadamard(&mut x, n0, stride, hadamard, &mut tmp);
                assert_eq!(x, orig);
            }
        }
    }

    #[test]
    fn verify_band_energy_normalisation() {
        let mut rng = SmallRng::seed_from_u64(0xe4e4);

        let lm = 3;
        let n = 960;

        let freq: Vec<f32> = (0..n).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();

        let mut band_e = [0.0f32; 2 * NB_BANDS];
        compute_band_energies(&freq, &mut band_e, NB_BANDS, 1, lm);

        let mut x = vec![0.0f32; n];
        normalise_bands(&freq, &mut x, &band_e, NB_BANDS, 1, lm);

        // Every band of the normalized spectrum has unit norm.
        for i in 0..NB_BANDS {
            let lo = (E_BANDS[i] as usize) << lm;
            let hi = (E_BANDS[i + 1] as usize) << lm;
            let e: f32 = x[lo..hi].iter().map(|v| v * v).sum();
            assert!((e - 1.0).abs() < 1e-4, "band {} norm {}", i, e);
        }
    }

    #[test]
    fn verify_anti_collapse_restores_unit_energy() {
        let mut rng = SmallRng::seed_from_u64(0xac);

        let lm = 3usize;
        let size = 960;

        let mut x = vec![0.0f32; size];

        // Band 12 with half its sub-blocks zeroed.
        let band = 12usize;
        let n0 = (E_BANDS[band + 1] - E_BANDS[band]) as usize;
        let base = (E_BANDS[band] as usize) << lm;

        for j in 0..n0 << lm {
            x[base + j] = 2.0 * rng.random::<f32>() - 1.0;
        }
        vq::renormalise_vector(&mut x[base..base + (n0 << lm)], 1.0);

        // Zero the odd sub-blocks.
        for j in 0..n0 {
            for k in 0..1 << lm {
                if k % 2 == 1 {
                    x[base + (j << lm) + k] = 0.0;
                }
            }
        }
        vq::renormalise_vector(&mut x[base..base + (n0 << lm)], 1.0);

        let mut collapse_masks = [0u8; NB_BANDS];
        collapse_masks[band] = 0b01010101;

        let log_e = [0.0f32; 2 * NB_BANDS];
        let prev1 = [-2.0f32; 2 * NB_BANDS];
        let prev2 = [-2.0f32; 2 * NB_BANDS];
        let mut pulses = [0i32; NB_BANDS];
        pulses[band] = 100;

        anti_collapse(
            &mut x,
            &collapse_masks,
            lm,
            1,
            size,
            band,
            band + 1,
            &log_e,
            &prev1,
            &prev2,
            &pulses,
            42,
        );

        // The noise landed only in the collapsed sub-blocks, and energy is restored.
        let e: f32 = x[base..base + (n0 << lm)].iter().map(|v| v * v).sum();
        assert!((e - 1.0).abs() < 1e-4);

        for j in 0..n0 {
            for k in 0..1 << lm {
                if k % 2 == 1 {
                    assert!(x[base + (j << lm) + k] != 0.0, "collapsed sub-block still empty");
                }
            }
        }
    }

    fn quant_unquant_frame(
        channels: usize,
        lm: usize,
        short_blocks: bool,
        total_bits: i32,
    ) -> (Vec<f32>, Vec<f32>) {
        use crate::entropy::{RangeDecoder, RangeEncoder};
        use crate::rate::init_caps;
        use crate::rate::compute_allocation;

        let mut rng = SmallRng::seed_from_u64(0xf00d + total_bits as u64);

        let m = 1usize << lm;
        let n = m * SHORT_MDCT_SIZE;
        let cache = PulseCache::new();

        // Random normalized spectra for each channel.
        let mut freq = vec![0.0f32; channels * n];
        for v in freq.iter_mut() {
            *v = 2.0 * rng.random::<f32>() - 1.0;
        }

        let mut band_e = [0.0f32; 2 * NB_BANDS];
        compute_band_energies(&freq, &mut band_e, NB_BANDS, channels, lm);
        let mut x = vec![0.0f32; channels * n];
        normalise_bands(&freq, &mut x, &band_e, NB_BANDS, channels, lm);

        let x_orig = x.clone();

        let buf_len = (total_bits / 8 + 16) as usize;
        let mut buf = vec![0u8; buf_len];

        let offsets = [0i32; NB_BANDS];
        let mut cap = [0i32; NB_BANDS];
        init_caps(&mut cap, lm, channels);

        let tf_res = [0i32; NB_BANDS];
        let mut collapse_enc = vec![0u8; channels * NB_BANDS];
        let mut seed_enc = 0u32;

        let mut enc = RangeEncoder::new(&mut buf);
        {
            let mut ec = Coder::Encoder(&mut enc);

            let alloc = compute_allocation(
                0,
                NB_BANDS,
                &offsets,
                &cap,
                5,
                NB_BANDS,
                false,
                total_bits - (ec.tell_frac() as i32) - 1,
                channels,
                lm,
                &mut ec,
                NB_BANDS,
                NB_BANDS,
            );

            let (xs, ys) = if channels == 2 {
                let (a, b) = x.split_at_mut(n);
                (a, Some(b))
            }
            else {
                (&mut x[..], None)
            };

            let mut scratch = BandScratch::new();
            quant_all_bands(
                0,
                NB_BANDS,
                xs,
                ys,
                &mut collapse_enc,
                &band_e,
                &alloc.pulses,
                short_blocks,
                SPREAD_NORMAL,
                alloc.dual_stereo,
                alloc.intensity,
                &tf_res,
                total_bits,
                alloc.balance,
                &mut ec,
                lm,
                alloc.coded_bands,
                &mut seed_enc,
                10,
                false,
                &cache,
                &mut scratch,
            );
        }
        assert!(!enc.error());
        enc.done();

        // Decode.
        let mut dec = RangeDecoder::new(&buf);
        let mut x_dec = vec![0.0f32; channels * n];
        let mut collapse_dec = vec![0u8; channels * NB_BANDS];
        let mut seed_dec = 0u32;

        {
            let mut ec = Coder::Decoder(&mut dec);

            let alloc = compute_allocation(
                0,
                NB_BANDS,
                &offsets,
                &cap,
                5,
                NB_BANDS,
                false,
                total_bits - (ec.tell_frac() as i32) - 1,
                channels,
                lm,
                &mut ec,
                NB_BANDS,
                NB_BANDS,
            );

            let (xs, ys) = if channels == 2 {
                let (a, b) = x_dec.split_at_mut(n);
                (a, Some(b))
            }
            else {
                (&mut x_dec[..], None)
            };

            let mut scratch = BandScratch::new();
            quant_all_bands(
                0,
                NB_BANDS,
                xs,
                ys,
                &mut collapse_dec,
                &band_e,
                &alloc.pulses,
                short_blocks,
                SPREAD_NORMAL,
                alloc.dual_stereo,
                alloc.intensity,
                &tf_res,
                total_bits,
                alloc.balance,
                &mut ec,
                lm,
                alloc.coded_bands,
                &mut seed_dec,
                10,
                false,
                &cache,
                &mut scratch,
            );
        }

        // Collapse masks and the noise seed only track between the endpoints when the encoder
        // resynthesizes; no cross-check here.
        let _ = (seed_enc, seed_dec, collapse_enc, collapse_dec);

        (x_orig, x_dec)
    }

    #[test]
    fn verify_mono_band_round_trip_norm() {
        // Decoded band vectors are unit norm (or zero), and correlate with the input at a
        // decent rate.
        let (orig, dec) = quant_unquant_frame(1, 3, false, 8 * 160 * 8);

        for i in 0..NB_BANDS {
            let lo = (E_BANDS[i] as usize) << 3;
            let hi = (E_BANDS[i + 1] as usize) << 3;

            let e: f32 = dec[lo..hi].iter().map(|v| v * v).sum();
            assert!(
                (e - 1.0).abs() < 1e-4 || e.abs() < 1e-8,
                "band {} energy {} not unit or zero",
                i,
                e
            );
        }

        let corr: f32 = orig.iter().zip(dec.iter()).map(|(a, b)| a * b).sum();
        assert!(corr > 0.0, "decoded spectrum uncorrelated with input");
    }

    #[test]
    fn verify_stereo_band_round_trip() {
        let (_, dec) = quant_unquant_frame(2, 2, false, 8 * 200 * 8);

        for v in &dec {
            assert!(v.is_finite());
        }

        // Both channels' low bands must carry energy.
        let n = 4 * SHORT_MDCT_SIZE;
        let e0: f32 = dec[..32].iter().map(|v| v * v).sum();
        let e1: f32 = dec[n..n + 32].iter().map(|v| v * v).sum();
        assert!(e0 > 0.0 && e1 > 0.0);
    }

    #[test]
    fn verify_transient_band_round_trip() {
        let (_, dec) = quant_unquant_frame(1, 3, true, 8 * 120 * 8);

        for v in &dec {
            assert!(v.is_finite());
        }
    }
}
