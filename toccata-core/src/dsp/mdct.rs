// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `mdct` module implements the Modified Discrete Cosine Transform (MDCT).
//!
//! The (I)MDCT in this module is specialized for lapped audio transforms with a short overlap:
//! the taper of the window is limited to `overlap` samples at each edge of the block while the
//! interior is passed through unmodified. The transform is computed with an `n/4`-point complex
//! FFT wrapped in pre- and post-rotations.
//!
//! For a block of `n2` coefficients, the forward transform consumes `n2 + overlap` time samples
//! and the inverse produces `n2 + overlap` time samples. Reconstruction relies on time-domain
//! aliasing cancellation: the caller overlap-adds the output of consecutive inverse transforms at
//! a hop of `n2` samples, and the power-complementary window halves cancel the aliasing terms in
//! the overlapped regions.

use super::complex::Complex;
use super::fft::Fft;

/// Modified Discrete Cosine Transform (MDCT).
pub struct Mdct {
    /// Number of coefficients per block. The nominal transform length is `2 * n2`.
    n2: usize,
    /// The `n2 / 2`-point complex FFT used by both transform directions.
    fft: Fft,
    /// Rotation twiddles. `trig[i]` and `trig[n4 + i]` are the cosine and sine of
    /// `2 * pi * (i + 0.125) / (2 * n2)` for `i` in `[0, n4)`.
    trig: Box<[f32]>,
}

impl Mdct {
    /// Instantiate an MDCT producing `n2` coefficients per block.
    ///
    /// `n2` must be divisible by 4 and its half must factor into powers of 2, 3, and 5.
    pub fn new(n2: usize) -> Mdct {
        assert!(n2 % 4 == 0, "mdct block length must be divisible by 4");

        let n4 = n2 >> 1;
        let n = 2 * n2;

        let mut trig = vec![0f32; 2 * n4].into_boxed_slice();

        for i in 0..n4 {
            let angle = 2.0 * std::f64::consts::PI * (i as f64 + 0.125) / n as f64;
            trig[i] = angle.cos() as f32;
            trig[n4 + i] = angle.sin() as f32;
        }

        Mdct { n2, fft: Fft::new(n4), trig }
    }

    /// Number of coefficients per block.
    pub fn coeffs(&self) -> usize {
        self.n2
    }

    /// Length of the FFT scratch slice required by both transform directions.
    pub fn scratch_len(&self) -> usize {
        self.n2 >> 1
    }

    /// Forward MDCT with windowed fold.
    ///
    /// `input` holds `n2 + overlap` time samples where `overlap` is the length of `window`. The
    /// `n2` output coefficients are written to `output[stride * k]`; an interleaved layout for
    /// sub-block transforms is obtained by passing the sub-block index as the slice offset and
    /// the sub-block count as `stride`.
    pub fn forward(
        &self,
        input: &[f32],
        window: &[f32],
        output: &mut [f32],
        stride: usize,
        scratch: &mut [Complex],
    ) {
        let n2 = self.n2;
        let n4 = n2 >> 1;
        let ov = window.len();
        let o = ov >> 1;

        assert!(ov <= n2 && ov % 2 == 0);
        assert_eq!(input.len(), n2 + ov);
        assert!(output.len() > stride * (n2 - 1));
        assert_eq!(scratch.len(), n4);

        // Windowed fold of the `n2 + overlap` input into `n2` samples. The interior of the block
        // is a plain (negated, reversed) copy; the tapers fold the aliased edges in.
        let fold = |m: usize| -> f32 {
            if m < o {
                -window[o + m] * input[n2 + o - 1 - m] - window[o - 1 - m] * input[n2 + o + m]
            }
            else if m < n2 - o {
                -input[n2 + o - 1 - m]
            }
            else {
                let t = m - (n2 - o);
                window[t] * input[t] - window[ov - 1 - t] * input[ov - 1 - t]
            }
        };

        // Pre-rotation. The 1/(n/4) transform scaling is folded into this pass. The rotated
        // values are scattered into digit-reversed order for the in-place FFT.
        let scale = 1.0 / n4 as f32;
        let digit_rev = self.fft.digit_rev();

        for i in 0..n4 {
            let re = fold(2 * i);
            let im = fold(n2 - 1 - 2 * i);

            let c = self.trig[i];
            let s = self.trig[n4 + i];

            let yr = scale * (re * c + im * s);
            let yi = scale * (im * c - re * s);

            scratch[usize::from(digit_rev[i])] = Complex::new(yr, yi);
        }

        self.fft.transform_inplace(scratch);

        // Post-rotation, writing the two coefficient fans from both ends of the block.
        for i in 0..n4 {
            let g = scratch[i];

            let c = self.trig[i];
            let s = self.trig[n4 + i];

            output[stride * 2 * i] = g.re * c + g.im * s;
            output[stride * (n2 - 1 - 2 * i)] = -(g.im * c - g.re * s);
        }
    }

    /// Inverse MDCT with windowed unfold.
    ///
    /// Reads `n2` coefficients from `input[stride * k]` and accumulates `n2 + overlap` time
    /// samples into `output`, which the caller must have cleared (or pre-loaded with the
    /// overlapping tail of the preceding block). Accumulation makes the aliasing terms of
    /// transforms overlap-added at a hop of `n2` samples cancel.
    pub fn inverse(
        &self,
        input: &[f32],
        stride: usize,
        window: &[f32],
        output: &mut [f32],
        scratch: &mut [Complex],
    ) {
        let n2 = self.n2;
        let n4 = n2 >> 1;
        let ov = window.len();
        let o = ov >> 1;

        assert!(ov <= n2 && ov % 2 == 0);
        assert!(input.len() > stride * (n2 - 1));
        assert_eq!(output.len(), n2 + ov);
        assert_eq!(scratch.len(), n4);

        let digit_rev = self.fft.digit_rev();

        // Inverse of the forward post-rotation, conjugated and scattered into digit-reversed
        // order so the forward FFT below computes the unscaled inverse FFT.
        for i in 0..n4 {
            let yr = input[stride * 2 * i];
            let yi = input[stride * (n2 - 1 - 2 * i)];

            let c = self.trig[i];
            let s = self.trig[n4 + i];

            let g = Complex::new(yr * c + yi * s, yr * s - yi * c);

            scratch[usize::from(digit_rev[i])] = g.conj();
        }

        self.fft.transform_inplace(scratch);

        // Inverse of the forward pre-rotation (the conjugate completes the inverse FFT), then
        // unfold each recovered interior sample to its time position, applying the window taper
        // over the overlapped edges.
        for i in 0..n4 {
            let v = scratch[i].conj();

            let c = self.trig[i];
            let s = self.trig[n4 + i];

            let re = v.re * c - v.im * s;
            let im = v.re * s + v.im * c;

            let mut unfold = |m: usize, u: f32| {
                if m < o {
                    output[n2 + o - 1 - m] -= window[o + m] * u;
                    output[n2 + o + m] -= window[o - 1 - m] * u;
                }
                else if m < n2 - o {
                    output[n2 + o - 1 - m] -= u;
                }
                else {
                    let t = m - (n2 - o);
                    output[t] += window[t] * u;
                    output[ov - 1 - t] -= window[ov - 1 - t] * u;
                }
            };

            unfold(2 * i, re);
            unfold(n2 - 1 - 2 * i, im);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    /// Evaluate the MDCT directly from its definition, in double precision.
    ///
    /// The conceptual input frame of length `2 * n2` is the `n2 + overlap` samples of `x`,
    /// windowed at both ends, centred in a zero-padded frame.
    fn mdct_naive(x: &[f32], window: &[f32], y: &mut [f32]) {
        let n2 = y.len();
        let ov = window.len();
        let n = 2 * n2;

        assert_eq!(x.len(), n2 + ov);

        let pad = (n2 - ov) / 2;

        let mut z = vec![0f64; n];

        for j in 0..ov {
            z[pad + j] = f64::from(window[j]) * f64::from(x[j]);
            z[pad + ov + (n2 - ov) + j] = f64::from(window[ov - 1 - j]) * f64::from(x[n2 + j]);
        }
        for j in 0..n2 - ov {
            z[pad + ov + j] = f64::from(x[ov + j]);
        }

        let alpha = std::f64::consts::PI / n2 as f64;
        let scale = 1.0 / (n2 / 2) as f64;

        for (k, y) in y.iter_mut().enumerate() {
            let mut accum = 0f64;

            for (nn, &z) in z.iter().enumerate() {
                accum += z * (alpha * (nn as f64 + 0.5 + n2 as f64 / 2.0) * (k as f64 + 0.5)).cos();
            }

            *y = (scale * accum) as f32;
        }
    }

    fn vorbis_window(overlap: usize) -> Vec<f32> {
        (0..overlap)
            .map(|i| {
                let f = std::f64::consts::FRAC_PI_2 * (i as f64 + 0.5) / overlap as f64;
                (std::f64::consts::FRAC_PI_2 * f.sin().powi(2)).sin() as f32
            })
            .collect()
    }

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
    fn verify_forward_against_naive() {
        let mut rng = SmallRng::seed_from_u64(0x3d07);

        for &n2 in &[120usize, 240, 480] {
            let ov = 120;
            let window = vorbis_window(ov);

            let x: Vec<f32> = (0..n2 + ov).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();

            let mut expected = vec![0f32; n2];
            mdct_naive(&x, &window, &mut expected);

            let mdct = Mdct::new(n2);
            let mut actual = vec![0f32; n2];
            let mut scratch = vec![Complex::default(); mdct.scratch_len()];
            mdct.forward(&x, &window, &mut actual, 1, &mut scratch);

            assert!(snr(&expected, &actual) >= 60.0, "mdct snr too low for n2={}", n2);
        }
    }

    #[test]
    fn verify_round_trip_middle() {
        for &n2 in &[120usize, 240, 480, 960] {
            let ov = 120;
            let window = vorbis_window(ov);

            // A sinusoid, amplitude 1.
            let x: Vec<f32> = (0..n2 + ov)
                .map(|i| (2.0 * std::f64::consts::PI * 1000.0 * i as f64 / 48000.0).sin() as f32)
                .collect();

            let mdct = Mdct::new(n2);
            let mut scratch = vec![Complex::default(); mdct.scratch_len()];

            let mut coeffs = vec![0f32; n2];
            mdct.forward(&x, &window, &mut coeffs, 1, &mut scratch);

            let mut rt = vec![0f32; n2 + ov];
            mdct.inverse(&coeffs, 1, &window, &mut rt, &mut scratch);

            // Only the unwindowed interior of a single block reconstructs exactly; the tapered
            // edges need the aliasing contribution of the adjacent blocks.
            for i in ov..n2 {
                assert!(
                    (rt[i] - x[i]).abs() <= 1e-3,
                    "round-trip error at {} for n2={}: {} vs {}",
                    i,
                    n2,
                    rt[i],
                    x[i]
                );
            }
        }
    }

    #[test]
    fn verify_overlap_add_chain() {
        let mut rng = SmallRng::seed_from_u64(0x0add);

        let n2 = 240;
        let ov = 120;
        let window = vorbis_window(ov);

        let n_blocks = 4;
        let total = n2 * n_blocks + ov;

        let x: Vec<f32> = (0..total).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();

        let mdct = Mdct::new(n2);
        let mut scratch = vec![Complex::default(); mdct.scratch_len()];

        // Overlap-add the inverse transforms of consecutive blocks at a hop of n2 samples.
        let mut out = vec![0f32; total];

        for b in 0..n_blocks {
            let mut coeffs = vec![0f32; n2];
            mdct.forward(&x[b * n2..b * n2 + n2 + ov], &window, &mut coeffs, 1, &mut scratch);

            let mut block = vec![0f32; n2 + ov];
            mdct.inverse(&coeffs, 1, &window, &mut block, &mut scratch);

            for (o, &s) in out[b * n2..b * n2 + n2 + ov].iter_mut().zip(block.iter()) {
                *o += s;
            }
        }

        // Every sample interior to the first and last overlap region is fully reconstructed.
        for i in ov..total - ov {
            assert!(
                (out[i] - x[i]).abs() <= 1e-3,
                "overlap-add error at {}: {} vs {}",
                i,
                out[i],
                x[i]
            );
        }
    }
}
