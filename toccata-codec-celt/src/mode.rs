// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `mode` module ties the frame configuration to its tables and transforms.
//!
//! There is a single operating mode: 48 kHz, 21 bands, a 120-sample overlap, and block sizes of
//! 120 to 960 samples. A `Mode` owns everything immutable that encoding and decoding share: the
//! analysis window, one MDCT per block size, and the pulse cache. Modes and MDCTs are built
//! lazily and shared process-wide; encoder and decoder objects hold a reference apiece.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;
use once_cell::sync::Lazy;

use toccata_core::dsp::mdct::Mdct;

use crate::rate::PulseCache;
use crate::tables::{E_BANDS, NB_BANDS};

/// The only supported sample rate.
pub const SAMPLE_RATE: u32 = 48000;

/// Window taper length, in samples.
pub const OVERLAP: usize = 120;

/// The shortest block size; all other block sizes are power-of-two multiples.
pub const SHORT_MDCT_SIZE: usize = 120;

/// Log2 of the largest block size over the shortest.
pub const MAX_LM: usize = 3;

/// Process-wide cache of MDCT lookups keyed by block size. Safe for concurrent first use; the
/// mutex only guards insertion.
static MDCT_CACHE: Lazy<Mutex<HashMap<usize, Arc<Mdct>>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Get (building if needed) the MDCT for blocks of `n2` coefficients.
fn mdct_for(n2: usize) -> Arc<Mdct> {
    let mut cache = MDCT_CACHE.lock().unwrap();
    Arc::clone(cache.entry(n2).or_insert_with(|| Arc::new(Mdct::new(n2))))
}

/// Left half of the power-complementary analysis/synthesis window.
///
/// Evaluated in double precision; the complementarity identity holds to the last bit there and
/// the stored single-precision table inherits it to within rounding.
pub fn vorbis_window(overlap: usize) -> Vec<f32> {
    vorbis_window_f64(overlap).into_iter().map(|w| w as f32).collect()
}

pub(crate) fn vorbis_window_f64(overlap: usize) -> Vec<f64> {
    (0..overlap)
        .map(|i| {
            let f = std::f64::consts::FRAC_PI_2 * (i as f64 + 0.5) / overlap as f64;
            (std::f64::consts::FRAC_PI_2 * f.sin().powi(2)).sin()
        })
        .collect()
}

/// The operating mode: frame geometry, tables, transforms.
pub struct Mode {
    /// Window taper, `OVERLAP` samples.
    pub window: Box<[f32]>,
    /// MDCT lookups indexed by shift; `mdct[s]` transforms blocks of `960 >> s` coefficients.
    pub mdct: [Arc<Mdct>; MAX_LM + 1],
    /// Pulse count/bit cost cache.
    pub cache: PulseCache,
}

static MODE48000: Lazy<Arc<Mode>> = Lazy::new(|| {
    Arc::new(Mode {
        window: vorbis_window(OVERLAP).into_boxed_slice(),
        mdct: [mdct_for(960), mdct_for(480), mdct_for(240), mdct_for(120)],
        cache: PulseCache::new(),
    })
});

impl Mode {
    /// The shared 48 kHz mode.
    pub fn get() -> Arc<Mode> {
        Arc::clone(&MODE48000)
    }

    /// Log2 of `frame_size / 120`, or `None` for an unsupported frame size.
    pub fn lm_for_frame_size(frame_size: usize) -> Option<usize> {
        match frame_size {
            120 => Some(0),
            240 => Some(1),
            480 => Some(2),
            960 => Some(3),
            _ => None,
        }
    }

    /// Number of MDCT bins in band `band` of a frame with time multiplier `1 << lm`.
    pub fn band_width(band: usize, lm: usize) -> usize {
        ((E_BANDS[band + 1] - E_BANDS[band]) as usize) << lm
    }

    /// The last band whose bins fall inside the frame, i.e. the effective band count.
    pub fn effective_end(lm: usize) -> usize {
        // All 21 bands fit every supported frame size at 48 kHz.
        let _ = lm;
        NB_BANDS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_window_power_complementary() {
        let w = vorbis_window_f64(OVERLAP);

        for i in 0..OVERLAP {
            let sum = w[i] * w[i] + w[OVERLAP - 1 - i] * w[OVERLAP - 1 - i];
            assert!((sum - 1.0).abs() <= 1e-14, "window complementarity broken at {}", i);
        }
    }

    #[test]
    fn verify_window_monotone_rising() {
        let w = vorbis_window(OVERLAP);

        for i in 1..OVERLAP {
            assert!(w[i] > w[i - 1]);
        }
        assert!(w[0] > 0.0 && w[OVERLAP - 1] < 1.0);
    }

    #[test]
    fn verify_mode_geometry() {
        let mode = Mode::get();

        for s in 0..=MAX_LM {
            assert_eq!(mode.mdct[s].coeffs(), 960 >> s);
        }

        assert_eq!(Mode::lm_for_frame_size(960), Some(3));
        assert_eq!(Mode::lm_for_frame_size(480), Some(2));
        assert_eq!(Mode::lm_for_frame_size(100), None);

        // The widest frame exactly covers the band plan.
        assert_eq!(Mode::band_width(NB_BANDS - 1, 3), (100 - 78) << 3);
        assert!(8 * E_BANDS[NB_BANDS] as usize <= 960);
    }
}
