// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `tables` module collects the constant tables of the 48 kHz mode.
//!
//! All values in this module are normative. An encoder and decoder only interoperate when they
//! agree on every entry, so the tables are reproduced verbatim rather than derived at runtime.

/// The number of frequency bands.
pub const NB_BANDS: usize = 21;

/// Band boundaries, in units of MDCT bins at the shortest (2.5 ms) block size. Band `b` of a
/// frame with time-resolution multiplier `M` spans bins `M * E_BANDS[b] .. M * E_BANDS[b + 1]`.
#[rustfmt::skip]
pub const E_BANDS: [i16; NB_BANDS + 1] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 12, 14, 16, 20, 24, 28, 34, 40, 48, 60, 78, 100,
];

/// Q8 base-2 logarithm of each band's width at the shortest block size.
#[rustfmt::skip]
pub const LOG_N: [i16; NB_BANDS] = [
    0, 0, 0, 0, 0, 0, 0, 0, 8, 8, 8, 8, 16, 16, 16, 21, 21, 24, 29, 34, 36,
];

/// The number of static allocation quality vectors.
pub const NB_ALLOC_VECTORS: usize = 11;

/// Static bit allocation curves, in 1/32 bit per MDCT bin, for eleven quality levels. The
/// allocator interpolates between the two rows bracketing the target rate.
#[rustfmt::skip]
pub const BAND_ALLOCATION: [[u8; NB_BANDS]; NB_ALLOC_VECTORS] = [
    [  0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0,   0],
    [ 90,  80,  75,  69,  63,  56,  49,  40,  34,  29,  20,  18,  10,   0,   0,   0,   0,   0,   0,   0,   0],
    [110, 100,  90,  84,  78,  71,  65,  58,  51,  45,  39,  32,  26,  20,  12,   0,   0,   0,   0,   0,   0],
    [118, 110, 103,  93,  86,  80,  75,  70,  65,  59,  53,  47,  40,  31,  23,  15,   4,   0,   0,   0,   0],
    [126, 119, 112, 104,  95,  89,  83,  78,  72,  66,  60,  54,  47,  39,  32,  25,  17,  12,   1,   0,   0],
    [134, 127, 120, 114, 103,  97,  91,  85,  78,  72,  66,  60,  54,  47,  41,  35,  29,  23,  16,  10,   1],
    [144, 137, 130, 124, 113, 107, 101,  95,  88,  82,  76,  70,  64,  57,  51,  45,  39,  33,  26,  15,   1],
    [152, 145, 138, 132, 123, 117, 111, 105,  98,  92,  86,  80,  74,  67,  61,  55,  49,  43,  36,  20,   1],
    [162, 155, 148, 142, 133, 127, 121, 115, 108, 102,  96,  90,  84,  77,  71,  65,  59,  53,  46,  30,   1],
    [172, 165, 158, 152, 143, 137, 131, 125, 118, 112, 106, 100,  94,  87,  81,  75,  69,  63,  56,  45,  20],
    [200, 200, 200, 200, 200, 200, 200, 200, 198, 193, 188, 183, 178, 173, 168, 163, 158, 153, 148, 129, 104],
];

/// Maximum number of 1/8 bits usable by a band, indexed by `[2 * LM + channels - 1][band]`.
/// `init_caps` rescales an entry to `(cap + 64) * channels * N / 4` eighth-bits.
#[rustfmt::skip]
pub const CACHE_CAPS: [u8; 4 * 2 * NB_BANDS] = [
    // 2.5 ms, mono
    224, 224, 224, 224, 224, 224, 224, 224, 160, 160, 160, 160, 185, 185, 185, 178, 178, 168, 134,  61,  37,
    // 2.5 ms, stereo
    224, 224, 224, 224, 224, 224, 224, 224, 240, 240, 240, 240, 207, 207, 207, 198, 198, 183, 144,  66,  40,
    // 5 ms, mono
    160, 160, 160, 160, 160, 160, 160, 160, 185, 185, 185, 185, 193, 193, 193, 183, 183, 172, 138,  64,  38,
    // 5 ms, stereo
    240, 240, 240, 240, 240, 240, 240, 240, 207, 207, 207, 207, 204, 204, 204, 193, 193, 180, 143,  66,  40,
    // 10 ms, mono
    185, 185, 185, 185, 185, 185, 185, 185, 193, 193, 193, 193, 193, 193, 193, 183, 183, 172, 138,  65,  39,
    // 10 ms, stereo
    207, 207, 207, 207, 207, 207, 207, 207, 204, 204, 204, 204, 201, 201, 201, 188, 188, 176, 141,  66,  40,
    // 20 ms, mono
    193, 193, 193, 193, 193, 193, 193, 193, 193, 193, 193, 193, 194, 194, 194, 184, 184, 173, 139,  65,  39,
    // 20 ms, stereo
    204, 204, 204, 204, 204, 204, 204, 204, 201, 201, 201, 201, 198, 198, 198, 187, 187, 175, 140,  66,  40,
];

/// Mean band log-energies, in dB/6 units, subtracted before envelope quantization and added back
/// on reconstruction.
#[rustfmt::skip]
pub const E_MEANS: [f32; 25] = [
    6.437500, 6.250000, 5.750000, 5.312500, 5.062500,
    4.812500, 4.500000, 4.375000, 4.875000, 4.687500,
    4.562500, 4.437500, 4.875000, 4.625000, 4.312500,
    4.500000, 4.375000, 4.625000, 4.750000, 4.437500,
    3.750000, 3.750000, 3.750000, 3.750000, 3.750000,
];

/// Inter-frame energy prediction coefficient per block size (Q15 rationals).
pub const PRED_COEF: [f32; 4] =
    [29440.0 / 32768.0, 26112.0 / 32768.0, 21248.0 / 32768.0, 16384.0 / 32768.0];

/// Inter-frame in-band prediction feedback per block size (Q15 rationals).
pub const BETA_COEF: [f32; 4] =
    [30147.0 / 32768.0, 22282.0 / 32768.0, 12124.0 / 32768.0, 6554.0 / 32768.0];

/// In-band prediction feedback for intra frames.
pub const BETA_INTRA: f32 = 4915.0 / 32768.0;

/// Laplace probability model for coarse energy, indexed by `[LM][intra]`. Each band `b` reads
/// the pair at `[2 * b]`: the scaled probability of zero and the decay rate.
#[rustfmt::skip]
pub const E_PROB_MODEL: [[[u8; 42]; 2]; 4] = [
    // 2.5 ms frames
    [
        // Inter
        [
             72, 127,  65, 129,  66, 128,  65, 128,  64, 128,  62, 128,  64, 128,
             64, 128,  92,  78,  92,  79,  92,  78,  90,  79, 116,  41, 115,  40,
            114,  40, 132,  26, 132,  26, 145,  17, 161,  12, 176,  10, 177,  11,
        ],
        // Intra
        [
             24, 179,  48, 138,  54, 135,  54, 132,  53, 134,  56, 133,  55, 132,
             55, 132,  61, 114,  70,  96,  74,  88,  75,  88,  87,  74,  89,  66,
             91,  67, 100,  59, 108,  50, 120,  40, 122,  37,  97,  43,  78,  50,
        ],
    ],
    // 5 ms frames
    [
        // Inter
        [
             83,  78,  84,  81,  88,  75,  86,  74,  87,  71,  90,  73,  93,  74,
             93,  74, 109,  40, 114,  36, 117,  34, 117,  34, 143,  17, 145,  18,
            146,  19, 162,  12, 165,  10, 178,   7, 189,   6, 190,   8, 177,   9,
        ],
        // Intra
        [
             23, 178,  54, 115,  63, 102,  66,  98,  69,  99,  74,  89,  71,  91,
             73,  91,  78,  89,  86,  80,  92,  66,  93,  64, 102,  59, 103,  60,
            104,  60, 117,  52, 123,  44, 138,  35, 133,  31,  97,  38,  77,  45,
        ],
    ],
    // 10 ms frames
    [
        // Inter
        [
             61,  90,  93,  60, 105,  42, 107,  41, 110,  45, 116,  38, 113,  38,
            112,  38, 124,  26, 132,  27, 136,  19, 140,  20, 155,  14, 159,  16,
            158,  18, 170,  13, 177,  10, 187,   8, 192,   6, 175,   9, 159,  10,
        ],
        // Intra
        [
             21, 178,  59, 110,  71,  86,  75,  85,  84,  83,  91,  66,  88,  73,
             87,  72,  92,  75,  98,  72, 105,  58, 107,  54, 115,  52, 114,  55,
            112,  56, 129,  51, 132,  40, 150,  33, 140,  29,  98,  35,  77,  42,
        ],
    ],
    // 20 ms frames
    [
        // Inter
        [
             42, 121,  96,  66, 108,  43, 111,  40, 117,  44, 123,  32, 120,  36,
            119,  33, 127,  33, 134,  34, 139,  21, 147,  23, 152,  20, 158,  25,
            154,  26, 166,  21, 173,  16, 184,  13, 184,  10, 150,  13, 139,  15,
        ],
        // Intra
        [
             22, 178,  63, 114,  74,  82,  84,  83,  92,  82, 103,  62,  96,  72,
             96,  67, 101,  73, 107,  72, 113,  55, 118,  52, 125,  52, 118,  52,
            117,  55, 135,  49, 137,  39, 157,  32, 145,  29,  97,  33,  77,  40,
        ],
    ],
];

/// Fallback distribution for coarse energy when fewer than fifteen bits remain.
pub const SMALL_ENERGY_ICDF: [u8; 3] = [2, 1, 0];

/// Distribution of the spread decision.
pub const SPREAD_ICDF: [u8; 4] = [25, 23, 2, 0];

/// Distribution of the post-filter tapset.
pub const TAPSET_ICDF: [u8; 3] = [2, 1, 0];

/// Distribution of the allocation trim.
pub const TRIM_ICDF: [u8; 11] = [126, 124, 119, 109, 87, 41, 19, 9, 4, 2, 0];

/// Per-band time-frequency resolution change, indexed by `[LM][4 * transient + 2 * tf_select +
/// tf_changed]`. Positive values trade frequency resolution for time resolution.
#[rustfmt::skip]
pub const TF_SELECT_TABLE: [[i8; 8]; 4] = [
    [0, -1, 0, -1,    0, -1, 0, -1],
    [0, -1, 0, -2,    1,  0, 1, -1],
    [0, -2, 0, -3,    2,  0, 1, -1],
    [0, -2, 0, -3,    3,  0, 1, -1],
];

/// Q3 fractional log2 of the first 24 integers, used to size the intensity stereo field.
#[rustfmt::skip]
pub const LOG2_FRAC_TABLE: [u8; 24] = [
     0,  8, 13, 16, 19, 21, 23, 24, 26, 27, 28, 29,
    30, 31, 32, 32, 33, 34, 34, 35, 36, 36, 37, 37,
];

/// Comb filter taps of the three post-filter tapsets.
#[rustfmt::skip]
pub const COMB_FILTER_TAPS: [[f32; 3]; 3] = [
    [0.3066406250, 0.2170410156, 0.1296386719],
    [0.4638671875, 0.2680664062, 0.0],
    [0.7998046875, 0.1000976562, 0.0],
];

/// Sub-harmonic verification thresholds used when removing period-doubling in pitch analysis.
#[rustfmt::skip]
pub const SECOND_CHECK: [usize; 16] = [0, 0, 3, 2, 3, 2, 5, 2, 3, 2, 3, 2, 5, 2, 3, 2];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_band_layout() {
        // Band ranges must not overlap and must fit the largest frame.
        for b in 0..NB_BANDS {
            assert!(E_BANDS[b] < E_BANDS[b + 1]);
        }
        assert!(8 * E_BANDS[NB_BANDS] as usize <= 960);
    }

    #[test]
    fn verify_icdf_tables_descend() {
        for t in
            [&SMALL_ENERGY_ICDF[..], &SPREAD_ICDF[..], &TAPSET_ICDF[..], &TRIM_ICDF[..]].iter()
        {
            for w in t.windows(2) {
                assert!(w[0] > w[1], "icdf tables must strictly descend");
            }
            assert_eq!(*t.last().unwrap(), 0);
        }
    }

    #[test]
    fn verify_prob_model_shape() {
        // Each band's probability pair must leave room for the minimum Laplace frequency.
        for lm in 0..4 {
            for intra in 0..2 {
                for b in 0..NB_BANDS {
                    let fs = u32::from(E_PROB_MODEL[lm][intra][2 * b]) << 7;
                    assert!(fs > 0 && fs < 32768);
                }
            }
        }
    }

    #[test]
    fn verify_allocation_rows_monotonic() {
        // Higher quality rows never allocate less to a band than lower quality rows.
        for q in 1..NB_ALLOC_VECTORS {
            for b in 0..NB_BANDS {
                assert!(BAND_ALLOCATION[q][b] >= BAND_ALLOCATION[q - 1][b]);
            }
        }
    }
}
