// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `fft` module implements the Fast Fourier Transform (FFT).
//!
//! The complex (I)FFT in this module supports any size whose prime factors are 2, 3, or 5. It is
//! implemented as a mixed-radix decimation-in-time transform with radix-2/3/4/5 butterflies,
//! which covers every sub-size required by a modified discrete cosine transform over the audio
//! block sizes of interest.

use super::complex::Complex;

/// Factor `n` into the radix schedule of the transform.
///
/// Radix-4 is preferred, then 2, 3 and 5. The final schedule is ordered smallest radix first.
/// Returns `None` if `n` has a prime factor larger than 5.
fn factorize(mut n: usize) -> Option<Vec<usize>> {
    let mut radices = Vec::new();

    for &p in &[4, 2, 3, 5] {
        while n % p == 0 {
            radices.push(p);
            n /= p;
        }
    }

    if n != 1 {
        return None;
    }

    radices.sort_unstable();

    Some(radices)
}

/// Compute the digit-reverse permutation for the given radix schedule by a recursive factor walk.
/// The leaf of the recursion writes `p` consecutive working-buffer positions.
///
/// `table[i]` is the working-buffer position input `i` must be scattered to so that the butterfly
/// passes, applied innermost stage first, produce the transform in natural order.
fn compute_digit_rev(
    table: &mut [u16],
    pos: usize,
    input: usize,
    fstride: usize,
    stages: &[(usize, usize)],
) {
    let (p, m) = stages[0];

    if m == 1 {
        for j in 0..p {
            table[input + j * fstride] = (pos + j) as u16;
        }
    }
    else {
        for j in 0..p {
            compute_digit_rev(table, pos + j * m, input + j * fstride, fstride * p, &stages[1..]);
        }
    }
}

/// The complex Fast Fourier Transform (FFT).
pub struct Fft {
    /// Radix and sub-length of each stage, outermost first.
    stages: Vec<(usize, usize)>,
    /// Digit-reverse permutation. `perm[i]` is the working-buffer position of input `i`.
    perm: Box<[u16]>,
    /// Twiddle factors `exp(-2 pi j k / n)` for `k` in `[0, n)`.
    twiddles: Box<[Complex]>,
}

impl Fft {
    /// The maximum FFT size.
    pub const MAX_SIZE: usize = 1 << 16;

    /// Instantiate an `n`-point FFT. The prime factors of `n` must all be in {2, 3, 5}.
    pub fn new(n: usize) -> Self {
        assert!(n > 1, "fft size must be > 1");
        assert!(n <= Fft::MAX_SIZE, "fft size too large");

        let radices = factorize(n).expect("fft size must factor into powers of 2, 3, and 5");

        // Record (radix, sub-length) per stage. The sub-length of the final stage is 1.
        let mut stages = Vec::with_capacity(radices.len());
        let mut m = n;

        for &p in &radices {
            m /= p;
            stages.push((p, m));
        }

        let mut perm = vec![0u16; n].into_boxed_slice();
        compute_digit_rev(&mut perm, 0, 0, 1, &stages);

        let theta = -2.0 * std::f64::consts::PI / n as f64;

        let twiddles = (0..n)
            .map(|k| {
                let angle = theta * k as f64;
                Complex::new(angle.cos() as f32, angle.sin() as f32)
            })
            .collect();

        Self { stages, perm, twiddles }
    }

    /// Get the size of the FFT.
    pub fn size(&self) -> usize {
        self.perm.len()
    }

    /// Get the digit-reverse permutation table.
    ///
    /// Callers that pre-process their input (e.g. an MDCT pre-rotation) scatter directly into the
    /// permuted order and then run [`Fft::transform_inplace`], avoiding a separate copy pass.
    pub fn digit_rev(&self) -> &[u16] {
        &self.perm
    }

    /// Run the butterfly passes over `x`, which must already be in digit-reversed order.
    pub fn transform_inplace(&self, x: &mut [Complex]) {
        let n = self.perm.len();
        assert_eq!(n, x.len());

        // Stage strides: the number of sub-transforms each stage operates on.
        let mut fstride = Vec::with_capacity(self.stages.len() + 1);
        fstride.push(1);

        for (i, &(p, _)) in self.stages.iter().enumerate() {
            fstride.push(fstride[i] * p);
        }

        // Apply stages from the innermost (smallest sub-transform) outward.
        for (i, &(p, m)) in self.stages.iter().enumerate().rev() {
            let blocks = fstride[i];
            let stride = fstride[i];

            match p {
                2 => self.bfly2(x, m, blocks, stride),
                3 => self.bfly3(x, m, blocks, stride),
                4 => self.bfly4(x, m, blocks, stride),
                5 => self.bfly5(x, m, blocks, stride),
                _ => unreachable!(),
            }
        }
    }

    /// Calculate the forward FFT, scaling the output by `1/n`.
    pub fn fft(&self, x: &[Complex], y: &mut [Complex]) {
        let n = x.len();
        assert_eq!(n, y.len());
        assert_eq!(n, self.perm.len());

        let c = 1.0 / n as f32;

        for (&x, &i) in x.iter().zip(self.perm.iter()) {
            y[usize::from(i)] = x.scale(c);
        }

        self.transform_inplace(y);
    }

    /// Calculate the inverse FFT. No scaling is applied.
    pub fn ifft(&self, x: &[Complex], y: &mut [Complex]) {
        let n = x.len();
        assert_eq!(n, y.len());
        assert_eq!(n, self.perm.len());

        // Conjugate into digit-reversed order, forward transform, then conjugate the output.
        for (&x, &i) in x.iter().zip(self.perm.iter()) {
            y[usize::from(i)] = x.conj();
        }

        self.transform_inplace(y);

        for y in y.iter_mut() {
            *y = y.conj();
        }
    }

    fn bfly2(&self, x: &mut [Complex], m: usize, blocks: usize, stride: usize) {
        for b in 0..blocks {
            let base = b * 2 * m;

            for j in 0..m {
                let t = x[base + m + j] * self.twiddles[j * stride];
                x[base + m + j] = x[base + j] - t;
                x[base + j] += t;
            }
        }
    }

    fn bfly3(&self, x: &mut [Complex], m: usize, blocks: usize, stride: usize) {
        // Only the imaginary part (the sine) of the 1/3-turn twiddle is needed.
        let epi3 = self.twiddles[stride * m].im;

        for b in 0..blocks {
            let base = b * 3 * m;

            for j in 0..m {
                let s1 = x[base + m + j] * self.twiddles[j * stride];
                let s2 = x[base + 2 * m + j] * self.twiddles[2 * j * stride];

                let sum = s1 + s2;
                let diff = (s1 - s2) * epi3;

                let x0 = x[base + j];

                let mid = Complex::new(x0.re - 0.5 * sum.re, x0.im - 0.5 * sum.im);

                x[base + j] = x0 + sum;
                x[base + m + j] = Complex::new(mid.re - diff.im, mid.im + diff.re);
                x[base + 2 * m + j] = Complex::new(mid.re + diff.im, mid.im - diff.re);
            }
        }
    }

    fn bfly4(&self, x: &mut [Complex], m: usize, blocks: usize, stride: usize) {
        for b in 0..blocks {
            let base = b * 4 * m;

            for j in 0..m {
                let s0 = x[base + m + j] * self.twiddles[j * stride];
                let s1 = x[base + 2 * m + j] * self.twiddles[2 * j * stride];
                let s2 = x[base + 3 * m + j] * self.twiddles[3 * j * stride];

                let x0 = x[base + j];

                let p0 = x0 + s1;
                let p1 = x0 - s1;
                let q0 = s0 + s2;
                let q1 = s0 - s2;

                x[base + j] = p0 + q0;
                x[base + 2 * m + j] = p0 - q0;
                x[base + m + j] = Complex::new(p1.re + q1.im, p1.im - q1.re);
                x[base + 3 * m + j] = Complex::new(p1.re - q1.im, p1.im + q1.re);
            }
        }
    }

    fn bfly5(&self, x: &mut [Complex], m: usize, blocks: usize, stride: usize) {
        let ya = self.twiddles[stride * m];
        let yb = self.twiddles[stride * 2 * m];

        for b in 0..blocks {
            let base = b * 5 * m;

            for j in 0..m {
                let s0 = x[base + j];
                let s1 = x[base + m + j] * self.twiddles[j * stride];
                let s2 = x[base + 2 * m + j] * self.twiddles[2 * j * stride];
                let s3 = x[base + 3 * m + j] * self.twiddles[3 * j * stride];
                let s4 = x[base + 4 * m + j] * self.twiddles[4 * j * stride];

                let p14 = s1 + s4;
                let m14 = s1 - s4;
                let p23 = s2 + s3;
                let m23 = s2 - s3;

                x[base + j] = s0 + p14 + p23;

                let a = Complex::new(
                    s0.re + ya.re * p14.re + yb.re * p23.re,
                    s0.im + ya.re * p14.im + yb.re * p23.im,
                );
                let b5 = Complex::new(
                    ya.im * m14.im + yb.im * m23.im,
                    -(ya.im * m14.re + yb.im * m23.re),
                );

                x[base + m + j] = a - b5;
                x[base + 4 * m + j] = a + b5;

                let c = Complex::new(
                    s0.re + yb.re * p14.re + ya.re * p23.re,
                    s0.im + yb.re * p14.im + ya.re * p23.im,
                );
                let d = Complex::new(
                    ya.im * m23.im - yb.im * m14.im,
                    yb.im * m14.re - ya.im * m23.re,
                );

                x[base + 2 * m + j] = c + d;
                x[base + 3 * m + j] = c - d;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    /// Compute a naive DFT.
    fn dft_naive(x: &[Complex], y: &mut [Complex]) {
        assert_eq!(x.len(), y.len());

        let n = x.len();

        let theta = 2.0 * std::f64::consts::PI / n as f64;

        for (i, y) in y.iter_mut().enumerate() {
            let mut re = 0f64;
            let mut im = 0f64;

            for (j, &x) in x.iter().enumerate() {
                let xre = f64::from(x.re);
                let xim = f64::from(x.im);

                let angle = theta * ((i * j) % n) as f64;

                let wre = angle.cos();
                let wim = -angle.sin();

                re += (xre * wre) - (xim * wim);
                im += (xre * wim) + (xim * wre);
            }

            *y = Complex { re: re as f32, im: im as f32 };
        }
    }

    fn random_vector(rng: &mut SmallRng, n: usize) -> Vec<Complex> {
        (0..n)
            .map(|_| {
                Complex::new(2.0 * rng.random::<f32>() - 1.0, 2.0 * rng.random::<f32>() - 1.0)
            })
            .collect()
    }

    /// Compute the signal-to-noise ratio, in dB, of `actual` against `expected`.
    fn snr(expected: &[Complex], actual: &[Complex]) -> f64 {
        let mut sig = 0f64;
        let mut err = 0f64;

        for (e, a) in expected.iter().zip(actual) {
            sig += f64::from(e.re) * f64::from(e.re) + f64::from(e.im) * f64::from(e.im);
            err += (f64::from(e.re) - f64::from(a.re)).powi(2)
                + (f64::from(e.im) - f64::from(a.im)).powi(2);
        }

        10.0 * (sig / err).log10()
    }

    const TEST_SIZES: [usize; 8] = [32, 36, 50, 60, 120, 240, 256, 480];

    #[test]
    fn verify_fft_against_dft() {
        let mut rng = SmallRng::seed_from_u64(0x5eed);

        for &n in TEST_SIZES.iter() {
            let x = random_vector(&mut rng, n);

            let mut expected = vec![Complex::default(); n];
            dft_naive(&x, &mut expected);

            // The forward FFT scales by 1/n; undo it for comparison.
            let mut actual = vec![Complex::default(); n];
            Fft::new(n).fft(&x, &mut actual);

            for a in actual.iter_mut() {
                *a = a.scale(n as f32);
            }

            assert!(snr(&expected, &actual) >= 60.0, "fft snr too low for n={}", n);
        }
    }

    #[test]
    fn verify_fft_reversible() {
        let mut rng = SmallRng::seed_from_u64(0xfade);

        for &n in TEST_SIZES.iter() {
            let x = random_vector(&mut rng, n);

            let fft = Fft::new(n);

            let mut fwd = vec![Complex::default(); n];
            let mut rt = vec![Complex::default(); n];

            fft.fft(&x, &mut fwd);
            fft.ifft(&fwd, &mut rt);

            assert!(snr(&x, &rt) >= 60.0, "fft round-trip snr too low for n={}", n);
        }
    }

    #[test]
    fn verify_digit_rev_is_permutation() {
        for &n in TEST_SIZES.iter() {
            let fft = Fft::new(n);

            let mut seen = vec![false; n];
            for &i in fft.digit_rev() {
                assert!(!seen[usize::from(i)]);
                seen[usize::from(i)] = true;
            }
        }
    }
}
