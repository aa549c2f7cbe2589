// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `complex` module implements the single-precision complex number used by the transforms.
//!
//! The butterfly kernels and the MDCT rotations only ever need a small set of operations:
//! ring arithmetic, conjugation, and scalar weighting. Anything beyond that set (division,
//! assigning multiplication, and so on) is deliberately absent so the kernels stay auditable
//! against their signal-flow graphs.

/// A complex number with `f32` components.
#[derive(Copy, Clone, Default, Debug, PartialEq)]
pub struct Complex {
    /// Real part.
    pub re: f32,
    /// Imaginary part.
    pub im: f32,
}

impl Complex {
    #[inline(always)]
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    /// Mirror across the real axis. Applying a transform kernel to conjugated input and
    /// conjugating the result runs that kernel backwards; the inverse FFT is built on exactly
    /// this identity.
    #[inline(always)]
    pub fn conj(&self) -> Self {
        Self::new(self.re, -self.im)
    }

    /// Weight both components by `g`.
    #[inline(always)]
    pub fn scale(&self, g: f32) -> Self {
        Self::new(g * self.re, g * self.im)
    }
}

impl core::ops::Add for Complex {
    type Output = Complex;

    #[inline(always)]
    fn add(self, other: Self) -> Complex {
        Complex::new(self.re + other.re, self.im + other.im)
    }
}

impl core::ops::AddAssign for Complex {
    #[inline(always)]
    fn add_assign(&mut self, other: Self) {
        self.re += other.re;
        self.im += other.im;
    }
}

impl core::ops::Sub for Complex {
    type Output = Complex;

    #[inline(always)]
    fn sub(self, other: Self) -> Complex {
        Complex::new(self.re - other.re, self.im - other.im)
    }
}

impl core::ops::Mul for Complex {
    type Output = Complex;

    /// Full complex product; with a unit-magnitude right operand this is the twiddle rotation
    /// at the heart of every butterfly.
    #[inline(always)]
    fn mul(self, other: Self) -> Complex {
        Complex::new(
            self.re * other.re - self.im * other.im,
            self.re * other.im + self.im * other.re,
        )
    }
}

impl core::ops::Mul<f32> for Complex {
    type Output = Complex;

    #[inline(always)]
    fn mul(self, g: f32) -> Complex {
        self.scale(g)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn twiddle(turns: f32) -> Complex {
        let angle = 2.0 * std::f32::consts::PI * turns;
        Complex::new(angle.cos(), -angle.sin())
    }

    fn magnitude(z: Complex) -> f32 {
        (z.re * z.re + z.im * z.im).sqrt()
    }

    #[test]
    fn product_matches_hand_computation() {
        // (2 - j) * (1 + 3j) = 5 + 5j
        let p = Complex::new(2.0, -1.0) * Complex::new(1.0, 3.0);
        assert_eq!(p, Complex::new(5.0, 5.0));

        // Scalar weighting distributes over both parts.
        assert_eq!(Complex::new(2.0, -1.0) * 0.5, Complex::new(1.0, -0.5));
        assert_eq!(Complex::new(2.0, -1.0).scale(-2.0), Complex::new(-4.0, 2.0));
    }

    #[test]
    fn twiddles_rotate_without_growing() {
        let z = Complex::new(0.6, -0.8);

        // A quarter-turn twiddle applied four times is the identity, and no step changes the
        // magnitude.
        let w = twiddle(0.25);
        let mut r = z;
        for _ in 0..4 {
            r = r * w;
            assert!((magnitude(r) - 1.0).abs() < 1e-6);
        }
        assert!((r.re - z.re).abs() < 1e-6 && (r.im - z.im).abs() < 1e-6);
    }

    #[test]
    fn conjugation_reverses_rotation() {
        let z = Complex::new(0.3, 0.7);
        let w = twiddle(0.15);

        // conj is an involution...
        assert_eq!(z.conj().conj(), z);

        // ...and conjugating a twiddle turns it the other way.
        let back = (z * w) * w.conj();
        assert!((back.re - z.re * magnitude(w).powi(2)).abs() < 1e-6);
        assert!((back.im - z.im * magnitude(w).powi(2)).abs() < 1e-6);
    }

    #[test]
    fn sums_accumulate() {
        let mut acc = Complex::default();
        acc += Complex::new(1.5, -2.0);
        acc += Complex::new(-0.5, 0.5);

        assert_eq!(acc, Complex::new(1.0, -1.5));
        assert_eq!(acc - Complex::new(1.0, 0.0), Complex::new(0.0, -1.5));
    }
}
