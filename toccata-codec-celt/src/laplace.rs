// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `laplace` module codes signed integers under a two-sided geometric distribution.
//!
//! The coarse energy residuals are well modelled by a Laplace distribution whose sharpness
//! varies per band. A context is described by `fs`, the scaled probability of zero, and `decay`,
//! the Q15 ratio between the probabilities of successive magnitudes.

use crate::entropy::{RangeDecoder, RangeEncoder};

/// The minimum probability of an energy delta, out of 32768.
const LAPLACE_LOG_MINP: u32 = 0;
const LAPLACE_MINP: u32 = 1 << LAPLACE_LOG_MINP;
/// The minimum number of guaranteed representable energy deltas in one direction.
const LAPLACE_NMIN: u32 = 16;

/// Probability of the first non-zero magnitude given the probability of zero.
fn laplace_get_freq1(fs0: u32, decay: i32) -> u32 {
    let ft = 32768 - LAPLACE_MINP * (2 * LAPLACE_NMIN) - fs0;
    (ft * (16384 - decay) as u32) >> 15
}

/// Encode `value` with the Laplace context `(fs, decay)`.
///
/// The value actually encoded is clamped to the representable range and written back through
/// `value` so the caller's prediction state tracks the decoder.
pub fn laplace_encode(enc: &mut RangeEncoder<'_>, value: &mut i32, mut fs: u32, decay: i32) {
    let mut fl = 0u32;
    let mut val = *value;

    if val != 0 {
        let s = if val < 0 { -1 } else { 0 };
        val = (val + s) ^ s;

        fl = fs;
        fs = laplace_get_freq1(fs, decay);

        // Walk down the decaying part of the PDF.
        let mut i = 1;
        while fs > 0 && i < val {
            fs *= 2;
            fl += fs + 2 * LAPLACE_MINP;
            fs = (fs * decay as u32) >> 15;
            i += 1;
        }

        if fs == 0 {
            // Everything beyond this point has probability LAPLACE_MINP.
            let mut ndi_max = ((32768 - fl + LAPLACE_MINP - 1) >> LAPLACE_LOG_MINP) as i32;
            ndi_max = (ndi_max - s) >> 1;

            let di = (val - i).min(ndi_max - 1);

            fl += ((2 * di + 1 + s) as u32) * LAPLACE_MINP;
            fs = LAPLACE_MINP.min(32768 - fl);

            *value = ((i + di) + s) ^ s;
        }
        else {
            fs += LAPLACE_MINP;
            if s == 0 {
                fl += fs;
            }
        }

        debug_assert!(fl + fs <= 32768);
        debug_assert!(fs > 0);
    }

    enc.encode_bin(fl, fl + fs, 15);
}

/// Decode a value with the Laplace context `(fs, decay)`.
pub fn laplace_decode(dec: &mut RangeDecoder<'_>, mut fs: u32, decay: i32) -> i32 {
    let mut val = 0i32;
    let mut fl = 0u32;

    let fm = dec.decode_bin(15);

    if fm >= fs {
        val += 1;
        fl = fs;
        fs = laplace_get_freq1(fs, decay) + LAPLACE_MINP;

        // Walk down the decaying part of the PDF.
        while fs > LAPLACE_MINP && fm >= fl + 2 * fs {
            fs *= 2;
            fl += fs;
            fs = ((fs - 2 * LAPLACE_MINP) * decay as u32) >> 15;
            fs += LAPLACE_MINP;
            val += 1;
        }

        if fs <= LAPLACE_MINP {
            let di = ((fm - fl) >> (LAPLACE_LOG_MINP + 1)) as i32;
            val += di;
            fl += 2 * di as u32 * LAPLACE_MINP;
        }

        if fm < fl + fs {
            val = -val;
        }
        else {
            fl += fs;
        }
    }

    debug_assert!(fl < 32768);
    debug_assert!(fs > 0);
    debug_assert!(fl <= fm);
    debug_assert!(fm < (fl + fs).min(32768));

    dec.update(fl, (fl + fs).min(32768), 32768);

    val
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_laplace_round_trip() {
        // Exercise a sweep of contexts and magnitudes, including values that clamp.
        let contexts = [(10000u32, 8000i32), (128 << 7, 100 << 6), (9000, 12000), (30000, 100)];

        let mut buf = vec![0u8; 4096];
        let mut enc = RangeEncoder::new(&mut buf);

        let mut expect = Vec::new();

        for &(fs, decay) in &contexts {
            for v in -24i32..=24 {
                let mut coded = v;
                laplace_encode(&mut enc, &mut coded, fs, decay);
                expect.push(coded);
            }
        }
        assert!(!enc.error());
        enc.done();

        let mut dec = RangeDecoder::new(&buf);
        let mut it = expect.iter();

        for &(fs, decay) in &contexts {
            for _ in -24i32..=24 {
                assert_eq!(laplace_decode(&mut dec, fs, decay), *it.next().unwrap());
            }
        }
    }

    #[test]
    fn verify_laplace_zero_is_cheap() {
        let mut buf = vec![0u8; 64];
        let mut enc = RangeEncoder::new(&mut buf);

        let before = enc.tell_frac();
        let mut v = 0;
        laplace_encode(&mut enc, &mut v, 20000, 6000);
        let zero_cost = enc.tell_frac() - before;

        let before = enc.tell_frac();
        let mut v = 8;
        laplace_encode(&mut enc, &mut v, 20000, 6000);
        let big_cost = enc.tell_frac() - before;

        assert!(zero_cost < big_cost);
    }
}
