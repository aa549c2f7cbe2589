// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `decoder` module reconstructs PCM from a packet.
//!
//! The decode is the mirror of the encode: parse the signalling flags, decode the energy
//! envelope, run the band dequantizer, refill collapsed sub-blocks, synthesize with the inverse
//! MDCT and overlap-add, run the post-filter with a cross-fade from the previous frame's
//! parameters, and de-emphasize back to PCM. A lost packet is concealed by resynthesizing noise
//! under the decayed previous envelope.

use std::sync::Arc;

use log::warn;

use toccata_core::dsp::complex::Complex;
use toccata_core::errors::{bad_argument_error, Error, Result};

use crate::bands::{self, lcg_rand, BandScratch};
use crate::celt::{comb_filter_inplace, deemphasis, COMBFILTER_MINPERIOD};
use crate::energy;
use crate::entropy::{Coder, RangeDecoder, BITRES};
use crate::mode::{Mode, MAX_LM, OVERLAP, SHORT_MDCT_SIZE};
use crate::rate::{self, init_caps};
use crate::tables::{E_BANDS, NB_BANDS, SPREAD_ICDF, TAPSET_ICDF, TF_SELECT_TABLE, TRIM_ICDF};
use crate::vq;
use crate::vq::SPREAD_NORMAL;

/// Post-filter and synthesis history per channel.
const DECODE_BUFFER_SIZE: usize = 2048;

/// State carried between frames, cloneable so a failed frame rolls back atomically.
#[derive(Clone)]
struct DecoderFrameState {
    /// Synthesis history plus the pending overlap tail, per channel.
    decode_mem: Vec<f32>,
    preemph_mem: [f32; 2],
    old_band_e: [f32; 2 * NB_BANDS],
    old_log_e: [f32; 2 * NB_BANDS],
    old_log_e2: [f32; 2 * NB_BANDS],
    background_log_e: [f32; 2 * NB_BANDS],
    rng: u32,
    postfilter_period: usize,
    postfilter_gain: f32,
    postfilter_tapset: usize,
    postfilter_period_old: usize,
    postfilter_gain_old: f32,
    postfilter_tapset_old: usize,
    loss_duration: i32,
}

impl DecoderFrameState {
    fn new(channels: usize) -> Self {
        DecoderFrameState {
            decode_mem: vec![0.0; channels * (DECODE_BUFFER_SIZE + OVERLAP)],
            preemph_mem: [0.0; 2],
            old_band_e: [0.0; 2 * NB_BANDS],
            old_log_e: [-28.0; 2 * NB_BANDS],
            old_log_e2: [-28.0; 2 * NB_BANDS],
            background_log_e: [-28.0; 2 * NB_BANDS],
            rng: 0,
            postfilter_period: 0,
            postfilter_gain: 0.0,
            postfilter_tapset: 0,
            postfilter_period_old: 0,
            postfilter_gain_old: 0.0,
            postfilter_tapset_old: 0,
            loss_duration: 0,
        }
    }
}

/// The CELT decoder.
pub struct Decoder {
    mode: Arc<Mode>,
    channels: usize,
    state: DecoderFrameState,
    scratch: BandScratch,
    fft_scratch: Vec<Complex>,
    final_range: u32,
}

impl Decoder {
    pub fn try_new(channels: usize) -> Result<Decoder> {
        if channels != 1 && channels != 2 {
            return bad_argument_error("celt: channel count must be 1 or 2");
        }

        Ok(Decoder {
            mode: Mode::get(),
            channels,
            state: DecoderFrameState::new(channels),
            scratch: BandScratch::new(),
            fft_scratch: vec![Complex::default(); 480],
            final_range: 0,
        })
    }

    /// Restore the freshly-constructed state.
    pub fn reset(&mut self) {
        self.state = DecoderFrameState::new(self.channels);
        self.final_range = 0;
    }

    /// The entropy coder range at the end of the last frame, for bitstream parity testing.
    pub fn final_range(&self) -> u32 {
        self.final_range
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Decode one frame into interleaved PCM in `[-1, 1]`. Passing `None` conceals a lost
    /// packet. Returns the number of samples produced per channel.
    ///
    /// On error, the cross-frame state is left exactly as it was.
    pub fn decode(
        &mut self,
        data: Option<&[u8]>,
        frame_size: usize,
        pcm: &mut [f32],
    ) -> Result<usize> {
        let lm = match Mode::lm_for_frame_size(frame_size) {
            Some(lm) => lm,
            None => return bad_argument_error("celt: frame size must be 120, 240, 480 or 960"),
        };
        if pcm.len() != self.channels * frame_size {
            return bad_argument_error("celt: pcm length must be channels * frame_size");
        }

        if let Some(data) = data {
            if data.len() < 2 {
                return bad_argument_error("celt: packet too short");
            }

            let saved = self.state.clone();
            match self.decode_frame(data, lm, pcm) {
                // An exhausted stream still produced (concealed) audio and advanced the state;
                // the error is informational only.
                Ok(true) => Err(Error::BitstreamExhausted("celt: packet ended mid-symbol")),
                Ok(false) => Ok(frame_size),
                Err(err) => {
                    self.state = saved;
                    Err(err)
                }
            }
        }
        else {
            self.conceal_frame(lm, pcm);
            Ok(frame_size)
        }
    }

    fn decode_frame(&mut self, data: &[u8], lm: usize, pcm: &mut [f32]) -> Result<bool> {
        let mode = Arc::clone(&self.mode);
        let st = &mut self.state;

        let m = 1usize << lm;
        let n = m * SHORT_MDCT_SIZE;
        let c = self.channels;
        let overlap = OVERLAP;
        let start = 0usize;
        let end = NB_BANDS;
        let eff_end = Mode::effective_end(lm);

        let len = data.len().min(1275);
        let mut dec = RangeDecoder::new(&data[..len]);

        let total_bits = len as i32 * 8;

        if c == 1 {
            for i in 0..NB_BANDS {
                st.old_band_e[i] = st.old_band_e[i].max(st.old_band_e[NB_BANDS + i]);
            }
        }

        let tell = dec.tell() as i32;
        let silence = if tell >= total_bits {
            true
        }
        else if tell == 1 {
            dec.decode_bit_logp(15)
        }
        else {
            false
        };

        if silence {
            // Pretend every remaining bit has been read.
            dec.pad_to_tell(total_bits as u32);
        }

        // Post-filter parameters.
        let mut postfilter_gain = 0.0f32;
        let mut postfilter_pitch = 0usize;
        let mut postfilter_tapset = 0usize;

        if start == 0 && dec.tell() + 16 <= total_bits as u32 {
            if dec.decode_bit_logp(1) {
                let octave = dec.decode_uint(6);
                postfilter_pitch =
                    ((16u32 << octave) + dec.decode_raw_bits(4 + octave) - 1) as usize;
                let qg = dec.decode_raw_bits(3);
                if dec.tell() + 2 <= total_bits as u32 {
                    postfilter_tapset = dec.decode_icdf(&TAPSET_ICDF, 2);
                }
                postfilter_gain = 0.09375 * (qg + 1) as f32;
            }
        }

        let is_transient = if lm > 0 && dec.tell() + 3 <= total_bits as u32 {
            dec.decode_bit_logp(3)
        }
        else {
            false
        };

        let short_blocks = if is_transient { m } else { 0 };

        let intra_ener = if dec.tell() + 3 <= total_bits as u32 {
            dec.decode_bit_logp(3)
        }
        else {
            false
        };

        energy::unquant_coarse_energy(start, end, &mut st.old_band_e, intra_ener, &mut dec, c, lm);

        let mut tf_res = [0i32; NB_BANDS];
        tf_decode(start, end, is_transient, &mut tf_res, lm, &mut dec);

        let spread_decision = if dec.tell() + 4 <= total_bits as u32 {
            dec.decode_icdf(&SPREAD_ICDF, 5) as i32
        }
        else {
            SPREAD_NORMAL
        };

        let mut cap = [0i32; NB_BANDS];
        init_caps(&mut cap, lm, c);

        // Per-band boosts.
        let mut offsets = [0i32; NB_BANDS];
        let mut dynalloc_logp = 6i32;
        let mut total_bits_frac = total_bits << BITRES;
        let mut tell_frac = dec.tell_frac() as i32;

        for i in start..end {
            let width = (c as i32) * ((E_BANDS[i + 1] - E_BANDS[i]) as i32) << lm;
            let quanta = (width << BITRES).min((6 << BITRES).max(width));

            let mut dynalloc_loop_logp = dynalloc_logp;
            let mut boost = 0i32;

            while tell_frac + (dynalloc_loop_logp << BITRES) < total_bits_frac && boost < cap[i] {
                let flag = dec.decode_bit_logp(dynalloc_loop_logp as u32);
                tell_frac = dec.tell_frac() as i32;
                if !flag {
                    break;
                }
                boost += quanta;
                total_bits_frac -= quanta;
                dynalloc_loop_logp = 1;
            }

            offsets[i] = boost;
            if boost > 0 {
                dynalloc_logp = 2.max(dynalloc_logp - 1);
            }
        }

        let alloc_trim = if tell_frac + (6 << BITRES) <= total_bits_frac {
            dec.decode_icdf(&TRIM_ICDF, 7) as i32
        }
        else {
            5
        };

        let mut bits_frac = ((len as i32 * 8) << BITRES) - dec.tell_frac() as i32 - 1;
        let anti_collapse_rsv =
            if is_transient && lm >= 2 && bits_frac >= ((lm as i32 + 2) << BITRES) {
                1 << BITRES
            }
            else {
                0
            };
        bits_frac -= anti_collapse_rsv;

        let alloc = {
            let mut ec = Coder::Decoder(&mut dec);
            rate::compute_allocation(
                start,
                end,
                &offsets,
                &cap,
                alloc_trim,
                0,
                false,
                bits_frac,
                c,
                lm,
                &mut ec,
                0,
                0,
            )
        };

        energy::unquant_fine_energy(start, end, &mut st.old_band_e, &alloc.fine_bits, &mut dec, c);

        // Make room for the new frame in the synthesis history.
        for ch in 0..c {
            let base = ch * (DECODE_BUFFER_SIZE + OVERLAP);
            st.decode_mem.copy_within(base + n..base + DECODE_BUFFER_SIZE + OVERLAP, base);
        }

        // Decode the band shapes.
        let mut x = vec![0.0f32; c * n];
        let mut collapse_masks = vec![0u8; c * NB_BANDS];
        let band_e_unused = [0.0f32; 2 * NB_BANDS];

        {
            let (xs, ys) = if c == 2 {
                let (a, b) = x.split_at_mut(n);
                (a, Some(b))
            }
            else {
                (&mut x[..], None)
            };

            let mut ec = Coder::Decoder(&mut dec);
            bands::quant_all_bands(
                start,
                end,
                xs,
                ys,
                &mut collapse_masks,
                &band_e_unused,
                &alloc.pulses,
                short_blocks != 0,
                spread_decision,
                alloc.dual_stereo,
                alloc.intensity,
                &tf_res,
                (len as i32 * (8 << BITRES)) - anti_collapse_rsv,
                alloc.balance,
                &mut ec,
                lm,
                alloc.coded_bands,
                &mut st.rng,
                0,
                false,
                &mode.cache,
                &mut self.scratch,
            );
        }

        let anti_collapse_on = anti_collapse_rsv > 0 && dec.decode_raw_bits(1) != 0;

        energy::unquant_energy_finalise(
            start,
            end,
            &mut st.old_band_e,
            &alloc.fine_bits,
            &alloc.fine_priority,
            len as i32 * 8 - dec.tell() as i32,
            &mut dec,
            c,
        );

        if anti_collapse_on {
            bands::anti_collapse(
                &mut x,
                &collapse_masks,
                lm,
                c,
                n,
                start,
                end,
                &st.old_band_e,
                &st.old_log_e,
                &st.old_log_e2,
                &alloc.pulses,
                st.rng,
            );
        }

        if silence {
            for v in st.old_band_e.iter_mut().take(c * NB_BANDS) {
                *v = -28.0;
            }
        }

        if dec.error() {
            warn!("celt: bitstream ended early; tail bands were concealed");
        }

        // Synthesis.
        synthesize(
            &mode,
            &x,
            &mut st.decode_mem,
            &st.old_band_e,
            start,
            eff_end,
            c,
            is_transient,
            lm,
            silence,
            &mut self.fft_scratch,
        );

        // Post-filter with cross-fade from the previous parameters.
        let out_base = DECODE_BUFFER_SIZE - n;
        for ch in 0..c {
            let base = ch * (DECODE_BUFFER_SIZE + OVERLAP);

            st.postfilter_period = st.postfilter_period.max(COMBFILTER_MINPERIOD);
            st.postfilter_period_old = st.postfilter_period_old.max(COMBFILTER_MINPERIOD);

            let buf = &mut st.decode_mem[base..base + DECODE_BUFFER_SIZE + OVERLAP];

            comb_filter_inplace(
                buf,
                out_base,
                st.postfilter_period_old,
                st.postfilter_period,
                SHORT_MDCT_SIZE,
                st.postfilter_gain_old,
                st.postfilter_gain,
                st.postfilter_tapset_old,
                st.postfilter_tapset,
                &mode.window,
                overlap,
            );

            if lm != 0 {
                comb_filter_inplace(
                    buf,
                    out_base + SHORT_MDCT_SIZE,
                    st.postfilter_period,
                    postfilter_pitch,
                    n - SHORT_MDCT_SIZE,
                    st.postfilter_gain,
                    postfilter_gain,
                    st.postfilter_tapset,
                    postfilter_tapset,
                    &mode.window,
                    overlap,
                );
            }
        }

        st.postfilter_period_old = st.postfilter_period;
        st.postfilter_gain_old = st.postfilter_gain;
        st.postfilter_tapset_old = st.postfilter_tapset;
        st.postfilter_period = postfilter_pitch;
        st.postfilter_gain = postfilter_gain;
        st.postfilter_tapset = postfilter_tapset;
        if lm != 0 {
            st.postfilter_period_old = st.postfilter_period;
            st.postfilter_gain_old = st.postfilter_gain;
            st.postfilter_tapset_old = st.postfilter_tapset;
        }

        if c == 1 {
            let (lo, hi) = st.old_band_e.split_at_mut(NB_BANDS);
            hi.copy_from_slice(lo);
        }

        if !is_transient {
            st.old_log_e2 = st.old_log_e;
            st.old_log_e = st.old_band_e;

            // The noise floor may rise only slowly between updates.
            let max_background_increase =
                if st.loss_duration == 0 { m as f32 * 0.001 } else { 1.0 };

            for i in 0..2 * NB_BANDS {
                st.background_log_e[i] =
                    (st.background_log_e[i] + max_background_increase).min(st.old_band_e[i]);
            }
        }
        else {
            for i in 0..2 * NB_BANDS {
                st.old_log_e[i] = st.old_log_e[i].min(st.old_band_e[i]);
            }
        }

        st.rng = dec.range();
        self.final_range = dec.range();
        st.loss_duration = 0;

        // De-emphasize straight out of the history buffer.
        for ch in 0..c {
            let base = ch * (DECODE_BUFFER_SIZE + OVERLAP);
            let mut mem = st.preemph_mem[ch];
            deemphasis(
                &st.decode_mem[base + out_base..base + out_base + n],
                &mut pcm[ch..],
                c,
                0.85,
                &mut mem,
            );
            st.preemph_mem[ch] = mem;
        }

        Ok(dec.error())
    }

    /// Conceal a lost frame: noise under the decayed previous envelope.
    fn conceal_frame(&mut self, lm: usize, pcm: &mut [f32]) {
        let mode = Arc::clone(&self.mode);
        let st = &mut self.state;

        let m = 1usize << lm;
        let n = m * SHORT_MDCT_SIZE;
        let c = self.channels;
        let start = 0usize;
        let end = NB_BANDS;
        let eff_end = Mode::effective_end(lm);

        for ch in 0..c {
            let base = ch * (DECODE_BUFFER_SIZE + OVERLAP);
            st.decode_mem.copy_within(base + n..base + DECODE_BUFFER_SIZE + OVERLAP, base);
        }

        // Decay the envelope towards the background noise floor.
        let decay = if st.loss_duration == 0 { 1.5 } else { 0.5 };
        for ch in 0..c {
            for i in start..end {
                let idx = ch * NB_BANDS + i;
                st.old_band_e[idx] = st.background_log_e[idx].max(st.old_band_e[idx] - decay);
            }
        }

        // Fill every band with unit-norm noise.
        let mut x = vec![0.0f32; c * n];
        let mut seed = st.rng;

        for ch in 0..c {
            for i in start..eff_end {
                let lo = ch * n + ((E_BANDS[i] as usize) << lm);
                let hi = ch * n + ((E_BANDS[i + 1] as usize) << lm);

                for v in x[lo..hi].iter_mut() {
                    seed = lcg_rand(seed);
                    *v = (seed as i32 >> 20) as f32;
                }
                vq::renormalise_vector(&mut x[lo..hi], 1.0);
            }
        }
        st.rng = seed;

        synthesize(
            &mode,
            &x,
            &mut st.decode_mem,
            &st.old_band_e,
            start,
            eff_end,
            c,
            false,
            lm,
            false,
            &mut self.fft_scratch,
        );

        // Keep the post-filter state advancing through the loss.
        let out_base = DECODE_BUFFER_SIZE - n;
        for ch in 0..c {
            let base = ch * (DECODE_BUFFER_SIZE + OVERLAP);

            st.postfilter_period = st.postfilter_period.max(COMBFILTER_MINPERIOD);
            st.postfilter_period_old = st.postfilter_period_old.max(COMBFILTER_MINPERIOD);

            let buf = &mut st.decode_mem[base..base + DECODE_BUFFER_SIZE + OVERLAP];

            comb_filter_inplace(
                buf,
                out_base,
                st.postfilter_period_old,
                st.postfilter_period,
                n,
                st.postfilter_gain_old,
                st.postfilter_gain,
                st.postfilter_tapset_old,
                st.postfilter_tapset,
                &mode.window,
                OVERLAP,
            );
        }
        st.postfilter_period_old = st.postfilter_period;
        st.postfilter_gain_old = st.postfilter_gain;
        st.postfilter_tapset_old = st.postfilter_tapset;

        for ch in 0..c {
            let base = ch * (DECODE_BUFFER_SIZE + OVERLAP);
            let mut mem = st.preemph_mem[ch];
            deemphasis(
                &st.decode_mem[base + out_base..base + out_base + n],
                &mut pcm[ch..],
                c,
                0.85,
                &mut mem,
            );
            st.preemph_mem[ch] = mem;
        }

        st.loss_duration = 10000.min(st.loss_duration + (1 << lm));
    }
}

/// Denormalize and inverse-transform every channel, overlap-adding into the synthesis history.
#[allow(clippy::too_many_arguments)]
fn synthesize(
    mode: &Mode,
    x: &[f32],
    decode_mem: &mut [f32],
    band_log_e: &[f32],
    start: usize,
    eff_end: usize,
    channels: usize,
    is_transient: bool,
    lm: usize,
    silence: bool,
    fft_scratch: &mut [Complex],
) {
    let m = 1usize << lm;
    let n = m * SHORT_MDCT_SIZE;
    let overlap = OVERLAP;
    let out_base = DECODE_BUFFER_SIZE - n;

    let (b, nb, shift) = if is_transient {
        (m, SHORT_MDCT_SIZE, MAX_LM)
    }
    else {
        (1, SHORT_MDCT_SIZE << lm, MAX_LM - lm)
    };

    let mdct = &mode.mdct[shift];
    let scratch = &mut fft_scratch[..mdct.scratch_len()];

    let mut freq = vec![0.0f32; n];

    for c in 0..channels {
        bands::denormalise_bands(
            &x[c * n..(c + 1) * n],
            &mut freq,
            &band_log_e[c * NB_BANDS..],
            start,
            eff_end,
            lm,
            silence,
        );

        let base = c * (DECODE_BUFFER_SIZE + OVERLAP);
        let out = &mut decode_mem[base + out_base..base + DECODE_BUFFER_SIZE + OVERLAP];

        // The overlap tail of the previous frame is already in place; clear only the region
        // the new blocks accumulate into beyond it.
        for v in out[overlap..].iter_mut() {
            *v = 0.0;
        }

        for blk in 0..b {
            mdct.inverse(
                &freq[blk..],
                b,
                &mode.window,
                &mut out[blk * nb..blk * nb + nb + overlap],
                scratch,
            );
        }
    }
}

fn tf_decode(
    start: usize,
    end: usize,
    is_transient: bool,
    tf_res: &mut [i32; NB_BANDS],
    lm: usize,
    dec: &mut RangeDecoder<'_>,
) {
    let mut budget = dec.storage() * 8;
    let mut tell = dec.tell();
    let mut logp: u32 = if is_transient { 2 } else { 4 };

    let tf_select_rsv = lm > 0 && tell + logp + 1 <= budget;
    budget -= u32::from(tf_select_rsv);

    let mut curr = 0i32;
    let mut tf_changed = 0i32;

    for i in start..end {
        if tell + logp <= budget {
            curr ^= i32::from(dec.decode_bit_logp(logp));
            tell = dec.tell();
            tf_changed |= curr;
        }
        tf_res[i] = curr;
        logp = if is_transient { 4 } else { 5 };
    }

    let ti = usize::from(is_transient);
    let tf_select = if tf_select_rsv
        && TF_SELECT_TABLE[lm][4 * ti + tf_changed as usize]
            != TF_SELECT_TABLE[lm][4 * ti + 2 + tf_changed as usize]
    {
        i32::from(dec.decode_bit_logp(1))
    }
    else {
        0
    };

    for i in start..end {
        tf_res[i] =
            i32::from(TF_SELECT_TABLE[lm][4 * ti + 2 * tf_select as usize + tf_res[i] as usize]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_arguments() {
        assert!(Decoder::try_new(1).is_ok());
        assert!(Decoder::try_new(2).is_ok());
        assert!(Decoder::try_new(3).is_err());

        let mut dec = Decoder::try_new(1).unwrap();
        let mut pcm = vec![0.0f32; 960];

        assert!(dec.decode(Some(&[0u8; 1]), 960, &mut pcm).is_err());
        assert!(dec.decode(None, 961, &mut pcm).is_err());
    }

    #[test]
    fn verify_concealment_produces_audio() {
        let mut dec = Decoder::try_new(1).unwrap();
        let mut pcm = vec![0.0f32; 960];

        // Concealment with no history yields near-silence, but must be finite and advance.
        assert_eq!(dec.decode(None, 960, &mut pcm).unwrap(), 960);
        for &v in &pcm {
            assert!(v.is_finite());
        }
    }
}
