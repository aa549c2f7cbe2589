// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `encoder` module drives a full frame encode.
//!
//! Per frame: DC rejection and pre-emphasis, the pitch pre-filter, transient and tone analysis,
//! the (possibly short-block) MDCT, envelope quantization, time-frequency and spreading
//! decisions, dynamic allocation, the band quantizer, and bitstream finalization. Cross-frame
//! state commits only when the whole frame succeeded.

use std::sync::Arc;

use log::debug;

use toccata_core::dsp::complex::Complex;
use toccata_core::errors::{bad_argument_error, buffer_overflow_error, Result};

use crate::bands::{self, BandScratch};
use crate::celt::{
    comb_filter, dc_reject, preemphasis, COMBFILTER_MAXPERIOD, COMBFILTER_MINPERIOD,
};
use crate::energy;
use crate::entropy::{Coder, RangeEncoder, BITRES};
use crate::math::{celt_exp2, celt_inner_prod, ilog};
use crate::mode::{Mode, MAX_LM, OVERLAP, SHORT_MDCT_SIZE};
use crate::pitch::{pitch_downsample, pitch_search, remove_doubling};
use crate::rate::{self, init_caps};
use crate::tables::{
    E_MEANS, LOG_N, NB_BANDS, SPREAD_ICDF, TAPSET_ICDF, TF_SELECT_TABLE, TRIM_ICDF,
};
use crate::vq::{SPREAD_NONE, SPREAD_NORMAL};

/// Hard ceiling on the packet size, in bytes.
pub const MAX_PACKET_BYTES: usize = 1275;

/// Encoder configuration.
///
/// Every field has a reasonable default; construct with `..Default::default()` and override
/// what the application cares about.
#[derive(Clone, Debug)]
pub struct EncoderOptions {
    /// 1 or 2.
    pub channels: usize,
    /// Samples per channel per frame: 120, 240, 480 or 960.
    pub frame_size: usize,
    /// Target rate in bits per second.
    pub bitrate: i32,
    /// Variable bitrate operation.
    pub vbr: bool,
    /// Constrain VBR drift with a bit reservoir.
    pub constrained_vbr: bool,
    /// 0 to 10; lower settings disable the expensive analysis passes.
    pub complexity: i32,
    /// The stream is a low-frequency effects channel.
    pub lfe: bool,
    /// Disable inter-frame energy prediction.
    pub force_intra: bool,
    /// Expected packet loss, in percent; biases the intra decision.
    pub packet_loss_rate: i32,
    /// Significant bits of the source signal (8 to 24); sets the dynalloc noise floor.
    pub lsb_depth: i32,
    /// Forbid the signed-side stereo inversion.
    pub disable_inv_stereo: bool,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        EncoderOptions {
            channels: 1,
            frame_size: 960,
            bitrate: 64000,
            vbr: false,
            constrained_vbr: true,
            complexity: 10,
            lfe: false,
            force_intra: false,
            packet_loss_rate: 0,
            lsb_depth: 24,
            disable_inv_stereo: false,
        }
    }
}

/// State carried between frames. Kept in one cloneable struct so a failed frame can roll back
/// atomically.
#[derive(Clone)]
struct EncoderFrameState {
    /// Pre-MDCT input tail, `overlap` samples per channel.
    in_mem: Vec<f32>,
    /// Unfiltered history for the pre-filter, `COMBFILTER_MAXPERIOD` samples per channel.
    prefilter_mem: Vec<f32>,
    preemph_mem: [f32; 2],
    hp_mem: [f32; 2],
    old_band_e: [f32; 2 * NB_BANDS],
    old_log_e: [f32; 2 * NB_BANDS],
    old_log_e2: [f32; 2 * NB_BANDS],
    energy_error: [f32; 2 * NB_BANDS],
    rng: u32,
    spread_decision: i32,
    delayed_intra: f32,
    tonal_average: i32,
    hf_average: i32,
    tapset_decision: i32,
    prefilter_period: usize,
    prefilter_gain: f32,
    prefilter_tapset: usize,
    consec_transient: i32,
    vbr_reservoir: i32,
    vbr_drift: i32,
    vbr_offset: i32,
    vbr_count: i32,
    intensity: usize,
    last_coded_bands: usize,
    spec_avg: f32,
    overlap_max: f32,
    stereo_saving: f32,
}

impl EncoderFrameState {
    fn new(channels: usize) -> Self {
        EncoderFrameState {
            in_mem: vec![0.0; channels * OVERLAP],
            prefilter_mem: vec![0.0; channels * COMBFILTER_MAXPERIOD],
            preemph_mem: [0.0; 2],
            hp_mem: [0.0; 2],
            old_band_e: [0.0; 2 * NB_BANDS],
            old_log_e: [-28.0; 2 * NB_BANDS],
            old_log_e2: [-28.0; 2 * NB_BANDS],
            energy_error: [0.0; 2 * NB_BANDS],
            rng: 0,
            spread_decision: SPREAD_NORMAL,
            delayed_intra: 1.0,
            tonal_average: 256,
            hf_average: 0,
            tapset_decision: 0,
            prefilter_period: 0,
            prefilter_gain: 0.0,
            prefilter_tapset: 0,
            consec_transient: 0,
            vbr_reservoir: 0,
            vbr_drift: 0,
            vbr_offset: 0,
            vbr_count: 0,
            intensity: 0,
            last_coded_bands: 0,
            spec_avg: 0.0,
            overlap_max: 0.0,
            stereo_saving: 0.0,
        }
    }
}

/// The CELT encoder.
pub struct Encoder {
    mode: Arc<Mode>,
    opts: EncoderOptions,
    lm: usize,
    state: EncoderFrameState,
    scratch: BandScratch,
    fft_scratch: Vec<Complex>,
    final_range: u32,
}

impl Encoder {
    pub fn try_new(opts: EncoderOptions) -> Result<Encoder> {
        if opts.channels != 1 && opts.channels != 2 {
            return bad_argument_error("celt: channel count must be 1 or 2");
        }
        let lm = match Mode::lm_for_frame_size(opts.frame_size) {
            Some(lm) => lm,
            None => return bad_argument_error("celt: frame size must be 120, 240, 480 or 960"),
        };
        if opts.complexity < 0 || opts.complexity > 10 {
            return bad_argument_error("celt: complexity must be 0 to 10");
        }
        if opts.lsb_depth < 8 || opts.lsb_depth > 24 {
            return bad_argument_error("celt: lsb depth must be 8 to 24");
        }
        if opts.packet_loss_rate < 0 || opts.packet_loss_rate > 100 {
            return bad_argument_error("celt: loss rate must be 0 to 100");
        }
        if opts.bitrate < 500 {
            return bad_argument_error("celt: bitrate too low");
        }

        let channels = opts.channels;

        Ok(Encoder {
            mode: Mode::get(),
            opts,
            lm,
            state: EncoderFrameState::new(channels),
            scratch: BandScratch::new(),
            fft_scratch: vec![Complex::default(); 480],
            final_range: 0,
        })
    }

    /// Restore the freshly-constructed state.
    pub fn reset(&mut self) {
        self.state = EncoderFrameState::new(self.opts.channels);
        self.final_range = 0;
    }

    /// The entropy coder range at the end of the last frame, for bitstream parity testing.
    pub fn final_range(&self) -> u32 {
        self.final_range
    }

    pub fn channels(&self) -> usize {
        self.opts.channels
    }

    pub fn frame_size(&self) -> usize {
        self.opts.frame_size
    }

    /// Encode one frame of interleaved PCM in `[-1, 1]` into `output`. Returns the number of
    /// bytes written.
    ///
    /// On error, the cross-frame state is left exactly as it was so the next frame can still
    /// be attempted.
    pub fn encode(&mut self, pcm: &[f32], output: &mut [u8]) -> Result<usize> {
        let frame = self.opts.frame_size;
        let channels = self.opts.channels;

        if pcm.len() != channels * frame {
            return bad_argument_error("celt: pcm length must be channels * frame_size");
        }
        if output.len() < 2 {
            return bad_argument_error("celt: output buffer must hold at least two bytes");
        }

        let saved = self.state.clone();

        match self.encode_frame(pcm, output) {
            Ok(bytes) => Ok(bytes),
            Err(err) => {
                self.state = saved;
                Err(err)
            }
        }
    }

    #[allow(clippy::needless_range_loop)]
    fn encode_frame(&mut self, pcm: &[f32], output: &mut [u8]) -> Result<usize> {
        let mode = Arc::clone(&self.mode);
        let opts = self.opts.clone();
        let st = &mut self.state;

        let lm = self.lm;
        let m = 1usize << lm;
        let n = m * SHORT_MDCT_SIZE;
        let c = opts.channels;
        let overlap = OVERLAP;
        let start = 0usize;
        let end = NB_BANDS;
        let eff_end = Mode::effective_end(lm);

        let mut nb_compressed_bytes = output.len().min(MAX_PACKET_BYTES);

        // Rate bookkeeping, everything in whole bits unless noted.
        let vbr_rate: i32;
        let mut effective_bytes: i32;

        if opts.vbr {
            let den = 48000 >> BITRES;
            vbr_rate = (opts.bitrate * frame_len_i32(n) + (den >> 1)) / den;
            effective_bytes = vbr_rate >> (3 + BITRES);
        }
        else {
            vbr_rate = 0;
            let tmp = opts.bitrate * frame_len_i32(n);
            nb_compressed_bytes = nb_compressed_bytes
                .min(2.max((tmp + 4 * 48000) as usize / (8 * 48000)));
            effective_bytes = nb_compressed_bytes as i32;
        }

        let mut equiv_rate = ((nb_compressed_bytes as i32 * 8 * 50) >> (3 - lm))
            - (40 * c as i32 + 20) * ((400 >> lm) - 50);
        equiv_rate = equiv_rate.min(opts.bitrate - (40 * c as i32 + 20) * ((400 >> lm) - 50));

        let mut enc = RangeEncoder::new(&mut output[..nb_compressed_bytes]);
        let mut total_bits = nb_compressed_bytes as i32 * 8;

        let mut nb_available_bytes = nb_compressed_bytes as i32;

        // Silence detection on the raw input.
        let mut sample_max = st.overlap_max;
        for &v in &pcm[..c * (n - overlap)] {
            sample_max = sample_max.max(v.abs());
        }
        st.overlap_max = 0.0;
        for &v in &pcm[c * (n - overlap)..] {
            st.overlap_max = st.overlap_max.max(v.abs());
        }
        sample_max = sample_max.max(st.overlap_max);

        let mut silence = sample_max == 0.0;

        let tell = enc.tell();
        if tell == 1 {
            enc.encode_bit_logp(silence, 15);
        }
        else {
            silence = false;
        }

        if silence {
            if vbr_rate > 0 {
                nb_compressed_bytes = nb_compressed_bytes.min(2);
                effective_bytes = nb_compressed_bytes as i32;
                total_bits = nb_compressed_bytes as i32 * 8;
                nb_available_bytes = 2;
                enc.shrink(nb_compressed_bytes as u32);
            }
            // Pretend the remaining bits are already consumed.
            enc.pad_to_tell(nb_compressed_bytes as u32 * 8);
        }

        // DC rejection then pre-emphasis into the per-channel analysis buffer.
        let mut input = vec![0.0f32; c * (n + overlap)];
        {
            let mut dc_buf = vec![0.0f32; n];
            for ch in 0..c {
                for (i, v) in dc_buf.iter_mut().enumerate() {
                    *v = pcm[c * i + ch];
                }
                let mut hp = st.hp_mem[ch];
                let mut rejected = vec![0.0f32; n];
                dc_reject(&dc_buf, 1, &mut rejected, 3.0, &mut hp);
                st.hp_mem[ch] = hp;

                let mut mem = st.preemph_mem[ch];
                preemphasis(
                    &rejected,
                    1,
                    &mut input[ch * (n + overlap) + overlap..(ch + 1) * (n + overlap)],
                    0.85,
                    &mut mem,
                );
                st.preemph_mem[ch] = mem;
            }
        }

        // Tone analysis guards the transient detector and the pre-filter.
        let (tone_freq, toneishness) = tone_detect(&input, c, n + overlap, overlap);

        // Pitch pre-filter.
        let enabled = ((opts.lfe && nb_available_bytes > 3)
            || nb_available_bytes > 12 * c as i32)
            && !silence
            && opts.complexity >= 5;

        let prefilter_tapset = st.tapset_decision as usize;
        let (pf_on, pitch_index, gain1, qg) =
            run_prefilter(st, &mode, &mut input, c, n, prefilter_tapset, enabled,
                nb_available_bytes, opts.packet_loss_rate, toneishness);

        let pitch_change = (gain1 > 0.4 || st.prefilter_gain > 0.4)
            && ((pitch_index as f32) > 1.26 * st.prefilter_period as f32
                || (pitch_index as f32) < 0.79 * st.prefilter_period as f32);

        if pf_on {
            let octave = ilog(pitch_index as u32 + 1) as i32 - 5;
            enc.encode_bit_logp(true, 1);
            enc.encode_uint(octave as u32, 6);
            enc.encode_raw_bits((pitch_index + 1 - (16 << octave)) as u32, (4 + octave) as u32);
            enc.encode_raw_bits(qg as u32, 3);
            enc.encode_icdf(prefilter_tapset, &TAPSET_ICDF, 2);
        }
        else if enc.tell() + 16 <= total_bits as u32 {
            enc.encode_bit_logp(false, 1);
        }

        // Transient analysis.
        let mut is_transient = false;
        let mut tf_estimate = 0.0f32;
        let mut tf_chan = 0usize;
        let mut transient_got_disabled = false;

        if opts.complexity >= 1 && !opts.lfe {
            let (t, est, chan) =
                transient_analysis(&input, n + overlap, c, tone_freq, toneishness);
            is_transient = t;
            tf_estimate = est;
            tf_chan = chan;
        }

        let mut short_blocks = 0usize;
        if lm > 0 && enc.tell() + 3 <= total_bits as u32 {
            if is_transient {
                short_blocks = m;
            }
        }
        else {
            is_transient = false;
            transient_got_disabled = true;
        }

        let mut freq = vec![0.0f32; c * n];
        let mut band_e = [0.0f32; 2 * NB_BANDS];
        let mut band_log_e = [0.0f32; 2 * NB_BANDS];
        let mut band_log_e2 = [0.0f32; 2 * NB_BANDS];

        // For transients at high complexity, measure the long-block energies first; the
        // dynalloc analysis is more stable against them.
        let second_mdct = short_blocks != 0 && opts.complexity >= 8;
        if second_mdct {
            compute_mdcts(&mode, 0, &input, &mut freq, c, lm, &mut self.fft_scratch);
            bands::compute_band_energies(&freq, &mut band_e, eff_end, c, lm);
            energy::amp2_log2(eff_end, end, &band_e, &mut band_log_e2, c);
            for ch in 0..c {
                for i in 0..end {
                    band_log_e2[NB_BANDS * ch + i] += 0.5 * lm as f32;
                }
            }
        }

        compute_mdcts(&mode, short_blocks, &input, &mut freq, c, lm, &mut self.fft_scratch);
        bands::compute_band_energies(&freq, &mut band_e, eff_end, c, lm);

        if opts.lfe {
            for i in 2..end {
                band_e[i] = band_e[i].min(1e-4 * band_e[0]).max(1e-15);
            }
        }

        energy::amp2_log2(eff_end, end, &band_e, &mut band_log_e, c);

        if silence {
            for v in band_log_e.iter_mut().take(c * NB_BANDS) {
                *v = -14.0;
            }
        }

        // Temporal VBR: compare the frame's envelope to the running average.
        let mut temporal_vbr = 0.0f32;
        if !is_transient {
            let mut follow = -10.0f32;
            let mut frame_avg = 0.0f32;
            for i in start..end {
                follow = (follow - 1.0).max(band_log_e[i]);
                if c == 2 {
                    follow = follow.max(band_log_e[i + NB_BANDS]);
                }
                frame_avg += follow;
            }
            frame_avg /= (end - start) as f32;
            temporal_vbr = (frame_avg - st.spec_avg).clamp(-1.5, 3.0);
            st.spec_avg += 0.02 * temporal_vbr;
        }

        if !second_mdct {
            band_log_e2[..c * NB_BANDS].copy_from_slice(&band_log_e[..c * NB_BANDS]);
        }

        // Last chance to catch a transient missed by the time-domain analysis.
        if lm > 0
            && enc.tell() + 3 <= total_bits as u32
            && !is_transient
            && opts.complexity >= 5
            && !opts.lfe
            && patch_transient_decision(&band_log_e, &st.old_band_e, start, end, c)
        {
            is_transient = true;
            short_blocks = m;
            compute_mdcts(&mode, short_blocks, &input, &mut freq, c, lm, &mut self.fft_scratch);
            bands::compute_band_energies(&freq, &mut band_e, eff_end, c, lm);
            energy::amp2_log2(eff_end, end, &band_e, &mut band_log_e, c);
            for ch in 0..c {
                for i in 0..end {
                    band_log_e2[NB_BANDS * ch + i] += 0.5 * lm as f32;
                }
            }
            tf_estimate = 0.2;
        }

        if lm > 0 && enc.tell() + 3 <= total_bits as u32 {
            enc.encode_bit_logp(is_transient, 3);
        }

        // Band normalization.
        let mut x = vec![0.0f32; c * n];
        bands::normalise_bands(&freq, &mut x, &band_e, eff_end, c, lm);

        // Dynamic allocation analysis.
        let mut offsets = [0i32; NB_BANDS];
        let mut importance = [13i32; NB_BANDS];
        let mut spread_weight = [32i32; NB_BANDS];
        let mut tot_boost = 0i32;

        let max_depth = dynalloc_analysis(
            &band_log_e,
            &band_log_e2,
            start,
            end,
            c,
            &mut offsets,
            opts.lsb_depth,
            is_transient,
            opts.vbr,
            opts.constrained_vbr,
            lm,
            effective_bytes,
            &mut tot_boost,
            opts.lfe,
            &mut importance,
            &mut spread_weight,
        );

        // Time-frequency resolution analysis.
        let mut tf_res = [0i32; NB_BANDS];
        let mut tf_select = 0i32;

        if opts.complexity >= 2 && !opts.lfe && effective_bytes >= 15 * c as i32 {
            let lambda = 80.max(20480 / effective_bytes + 2);
            tf_select = tf_analysis(
                eff_end,
                is_transient,
                &mut tf_res,
                lambda,
                &x,
                n,
                lm,
                tf_estimate,
                tf_chan,
                &importance,
            );
            for i in eff_end..end {
                tf_res[i] = tf_res[eff_end - 1];
            }
        }
        else {
            for v in tf_res.iter_mut() {
                *v = i32::from(is_transient);
            }
        }

        // Bias the envelope towards the previous frame's quantization error when stable.
        for ch in 0..c {
            for i in start..end {
                let idx = i + ch * NB_BANDS;
                if (band_log_e[idx] - st.old_band_e[idx]).abs() < 2.0 {
                    band_log_e[idx] -= 0.25 * st.energy_error[idx];
                }
            }
        }

        let mut error = [0.0f32; 2 * NB_BANDS];

        energy::quant_coarse_energy(
            start,
            end,
            eff_end,
            &band_log_e,
            &mut st.old_band_e,
            total_bits as u32,
            &mut error,
            &mut enc,
            c,
            lm,
            nb_available_bytes,
            opts.force_intra,
            &mut st.delayed_intra,
            opts.complexity >= 4,
            opts.packet_loss_rate,
            opts.lfe,
        );

        tf_encode(start, end, is_transient, &mut tf_res, lm, tf_select, &mut enc);

        if enc.tell() + 4 <= total_bits as u32 {
            if opts.lfe {
                st.tapset_decision = 0;
                st.spread_decision = SPREAD_NORMAL;
            }
            else if short_blocks != 0 || opts.complexity < 3 || nb_available_bytes < 10 * c as i32
            {
                st.spread_decision =
                    if opts.complexity == 0 { SPREAD_NONE } else { SPREAD_NORMAL };
            }
            else {
                st.spread_decision = bands::spreading_decision(
                    &x,
                    &mut st.tonal_average,
                    st.spread_decision,
                    &mut st.hf_average,
                    &mut st.tapset_decision,
                    pf_on && short_blocks == 0,
                    eff_end,
                    c,
                    lm,
                    &spread_weight,
                );
            }
            enc.encode_icdf(st.spread_decision as usize, &SPREAD_ICDF, 5);
        }

        if opts.lfe {
            offsets[0] = 8.min(effective_bytes / 3);
        }

        let mut cap = [0i32; NB_BANDS];
        init_caps(&mut cap, lm, c);

        // Signal the per-band boosts.
        let mut dynalloc_logp = 6i32;
        let total_bits_frac = total_bits << BITRES;
        let mut total_boost = 0i32;
        let mut tell_frac = enc.tell_frac() as i32;

        for i in start..end {
            let width = (c as i32) * ((crate::tables::E_BANDS[i + 1]
                - crate::tables::E_BANDS[i]) as i32)
                << lm;
            // One quanta is 6 bits, but no more than 1 bit/sample and no less than 1/8
            // bit/sample.
            let quanta = (width << BITRES).min((6 << BITRES).max(width));

            let mut dynalloc_loop_logp = dynalloc_logp;
            let mut boost = 0i32;
            let mut j = 0i32;

            while tell_frac + (dynalloc_loop_logp << BITRES) < total_bits_frac - total_boost
                && boost < cap[i]
            {
                let flag = j < offsets[i];
                enc.encode_bit_logp(flag, dynalloc_loop_logp as u32);
                tell_frac = enc.tell_frac() as i32;
                if !flag {
                    break;
                }
                boost += quanta;
                total_boost += quanta;
                dynalloc_loop_logp = 1;
                j += 1;
            }

            if j > 0 {
                dynalloc_logp = 2.max(dynalloc_logp - 1);
            }
            offsets[i] = boost;
        }

        // Stereo coding mode decisions.
        let mut dual_stereo = false;
        if c == 2 {
            #[rustfmt::skip]
            const INTENSITY_THRESHOLDS: [i32; 21] =
                [1, 2, 3, 4, 5, 6, 7, 8, 16, 24, 36, 44, 50, 56, 62, 67, 72, 79, 88, 106, 134];
            #[rustfmt::skip]
            const INTENSITY_HISTERESIS: [i32; 21] =
                [1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 4, 5, 6, 8, 8, 8, 8];

            // Always use mid/side for 2.5 ms frames.
            if lm != 0 {
                dual_stereo = stereo_analysis(&x, lm, n);
            }

            st.intensity = hysteresis_decision(
                equiv_rate / 1000,
                &INTENSITY_THRESHOLDS,
                &INTENSITY_HISTERESIS,
                st.intensity,
            );
            st.intensity = end.min(start.max(st.intensity));
        }

        let mut alloc_trim = 5i32;
        if tell_frac + (6 << BITRES) <= total_bits_frac - total_boost {
            if opts.lfe {
                st.stereo_saving = 0.0;
                alloc_trim = 5;
            }
            else {
                alloc_trim = alloc_trim_analysis(
                    &x,
                    &band_log_e,
                    end,
                    lm,
                    c,
                    n,
                    &mut st.stereo_saving,
                    tf_estimate,
                    st.intensity,
                    equiv_rate,
                );
            }
            enc.encode_icdf(alloc_trim as usize, &TRIM_ICDF, 7);
            tell_frac = enc.tell_frac() as i32;
        }

        // Variable bitrate target.
        if vbr_rate > 0 {
            let lm_diff = (MAX_LM - lm) as i32;
            nb_compressed_bytes = nb_compressed_bytes.min(1275 >> (3 - lm));

            let mut base_target = vbr_rate - ((40 * c as i32 + 20) << BITRES);
            if opts.constrained_vbr {
                base_target += st.vbr_offset >> lm_diff;
            }

            let mut target = compute_vbr(
                base_target,
                lm,
                equiv_rate,
                st.last_coded_bands,
                c,
                st.intensity,
                opts.constrained_vbr,
                st.stereo_saving,
                tot_boost,
                tf_estimate,
                pitch_change,
                max_depth,
                opts.lfe,
                temporal_vbr,
            );

            target += tell_frac;

            // Never shrink the frame so far the bust-prevention logic would have fired.
            let min_allowed =
                ((tell_frac + total_boost + (1 << (BITRES + 3)) - 1) >> (BITRES + 3)) + 2;

            nb_available_bytes = (target + (1 << (BITRES + 2))) >> (BITRES + 3);
            nb_available_bytes = min_allowed.max(nb_available_bytes);
            nb_available_bytes = (nb_compressed_bytes as i32).min(nb_available_bytes);

            let mut delta = target - vbr_rate;

            if silence {
                nb_available_bytes = 2;
                delta = 0;
            }

            let target_bytes_frac = nb_available_bytes << (BITRES + 3);

            let alpha = if st.vbr_count < 970 {
                st.vbr_count += 1;
                1.0 / (st.vbr_count + 20) as f32
            }
            else {
                0.001
            };

            if opts.constrained_vbr {
                st.vbr_reservoir += target_bytes_frac - vbr_rate;
            }

            if opts.constrained_vbr {
                st.vbr_drift += (alpha
                    * ((delta * (1 << lm_diff)) - st.vbr_offset - st.vbr_drift) as f32)
                    as i32;
                st.vbr_offset = -st.vbr_drift;
            }

            if opts.constrained_vbr && st.vbr_reservoir < 0 {
                // Under the minimum: increase the rate.
                let adjust = -st.vbr_reservoir / (8 << BITRES);
                nb_available_bytes += if silence { 0 } else { adjust };
                st.vbr_reservoir = 0;
                debug!("celt: vbr reservoir empty, boosting by {} bytes", adjust);
            }

            nb_compressed_bytes = nb_compressed_bytes.min(nb_available_bytes.max(2) as usize);
            enc.shrink(nb_compressed_bytes as u32);
        }

        // Bit allocation.
        let bits_frac =
            ((nb_compressed_bytes as i32 * 8) << BITRES) - enc.tell_frac() as i32 - 1;
        let anti_collapse_rsv =
            if is_transient && lm >= 2 && bits_frac >= ((lm as i32 + 2) << BITRES) {
                1 << BITRES
            }
            else {
                0
            };
        let bits_frac = bits_frac - anti_collapse_rsv;

        let signal_bandwidth = if opts.lfe { 0 } else { end - 1 };

        let alloc = {
            let mut ec = Coder::Encoder(&mut enc);
            rate::compute_allocation(
                start,
                end,
                &offsets,
                &cap,
                alloc_trim,
                st.intensity,
                dual_stereo,
                bits_frac,
                c,
                lm,
                &mut ec,
                st.last_coded_bands,
                signal_bandwidth,
            )
        };

        st.intensity = alloc.intensity;
        dual_stereo = alloc.dual_stereo;

        if st.last_coded_bands != 0 {
            st.last_coded_bands = (st.last_coded_bands + 1)
                .min((st.last_coded_bands - 1).max(alloc.coded_bands));
        }
        else {
            st.last_coded_bands = alloc.coded_bands;
        }

        energy::quant_fine_energy(
            start,
            end,
            &mut st.old_band_e,
            &mut error,
            &alloc.fine_bits,
            &mut enc,
            c,
        );

        // Residual quantization.
        let mut collapse_masks = vec![0u8; c * NB_BANDS];
        {
            let (xs, ys) = if c == 2 {
                let (a, b) = x.split_at_mut(n);
                (a, Some(b))
            }
            else {
                (&mut x[..], None)
            };

            let mut ec = Coder::Encoder(&mut enc);
            bands::quant_all_bands(
                start,
                end,
                xs,
                ys,
                &mut collapse_masks,
                &band_e,
                &alloc.pulses,
                short_blocks != 0,
                st.spread_decision,
                dual_stereo,
                st.intensity,
                &tf_res,
                (nb_compressed_bytes as i32 * (8 << BITRES)) - anti_collapse_rsv,
                alloc.balance,
                &mut ec,
                lm,
                alloc.coded_bands,
                &mut st.rng,
                opts.complexity,
                opts.disable_inv_stereo,
                &mode.cache,
                &mut self.scratch,
            );
        }

        if anti_collapse_rsv > 0 {
            let anti_collapse_on = st.consec_transient < 2;
            enc.encode_raw_bits(u32::from(anti_collapse_on), 1);
        }

        energy::quant_energy_finalise(
            start,
            end,
            &mut st.old_band_e,
            &mut error,
            &alloc.fine_bits,
            &alloc.fine_priority,
            nb_compressed_bytes as i32 * 8 - enc.tell() as i32,
            &mut enc,
            c,
        );

        for v in st.energy_error.iter_mut() {
            *v = 0.0;
        }
        for ch in 0..c {
            for i in start..end {
                st.energy_error[i + ch * NB_BANDS] = error[i + ch * NB_BANDS].clamp(-0.5, 0.5);
            }
        }

        if silence {
            for v in st.old_band_e.iter_mut().take(c * NB_BANDS) {
                *v = -28.0;
            }
        }

        st.prefilter_period = pitch_index;
        st.prefilter_gain = gain1;
        st.prefilter_tapset = prefilter_tapset;

        if c == 1 {
            let (lo, hi) = st.old_band_e.split_at_mut(NB_BANDS);
            hi.copy_from_slice(lo);
        }

        if !is_transient {
            st.old_log_e2 = st.old_log_e;
            st.old_log_e = st.old_band_e;
        }
        else {
            for i in 0..2 * NB_BANDS {
                st.old_log_e[i] = st.old_log_e[i].min(st.old_band_e[i]);
            }
        }

        if is_transient || transient_got_disabled {
            st.consec_transient += 1;
        }
        else {
            st.consec_transient = 0;
        }

        enc.done();

        if enc.error() {
            return buffer_overflow_error("celt: frame did not fit the output buffer");
        }

        st.rng = enc.range();
        self.final_range = enc.range();

        Ok(nb_compressed_bytes)
    }
}

#[inline]
fn frame_len_i32(n: usize) -> i32 {
    n as i32
}

/// Run the forward MDCT(s) for the frame, interleaving short-block coefficients.
pub(crate) fn compute_mdcts(
    mode: &Mode,
    short_blocks: usize,
    input: &[f32],
    freq: &mut [f32],
    channels: usize,
    lm: usize,
    fft_scratch: &mut [Complex],
) {
    let overlap = OVERLAP;
    let n = SHORT_MDCT_SIZE << lm;

    let (b, nb, shift) = if short_blocks != 0 {
        (short_blocks, SHORT_MDCT_SIZE, MAX_LM)
    }
    else {
        (1, SHORT_MDCT_SIZE << lm, MAX_LM - lm)
    };

    let mdct = &mode.mdct[shift];
    let scratch = &mut fft_scratch[..mdct.scratch_len()];

    for c in 0..channels {
        let in_ch = &input[c * (n + overlap)..(c + 1) * (n + overlap)];
        let out_ch = &mut freq[c * n..(c + 1) * n];

        for blk in 0..b {
            mdct.forward(
                &in_ch[blk * nb..blk * nb + nb + overlap],
                &mode.window,
                &mut out_ch[blk..],
                b,
                scratch,
            );
        }
    }
}

/// Inverse of the per-pair energy ramp used by the transient metric.
#[rustfmt::skip]
const INV_TABLE: [u8; 128] = [
    255, 255, 156, 110,  86,  70,  59,  51,  45,  40,  37,  33,  31,  28,  26,  25,
     23,  22,  21,  20,  19,  18,  17,  16,  16,  15,  15,  14,  13,  13,  12,  12,
     12,  12,  11,  11,  11,  10,  10,  10,   9,   9,   9,   9,   9,   8,   8,   8,
      8,   8,   7,   7,   7,   7,   7,   7,   6,   6,   6,   6,   6,   6,   6,   6,
      6,   5,   5,   5,   5,   5,   5,   5,   5,   5,   4,   4,   4,   4,   4,   4,
      4,   4,   4,   4,   4,   4,   4,   4,   4,   4,   4,   4,   4,   4,   3,   3,
      3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,
      3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   3,   2,
];

/// Detect sharp energy onsets in the time domain.
///
/// Returns `(is_transient, tf_estimate, tf_chan)`.
fn transient_analysis(
    input: &[f32],
    len: usize,
    channels: usize,
    tone_freq: f32,
    toneishness: f32,
) -> (bool, f32, usize) {
    let forward_decay = 0.0625f32;
    let len2 = len / 2;

    let mut tmp = vec![0.0f32; len];
    let mut mask_metric = 0i32;
    let mut tf_chan = 0usize;

    for c in 0..channels {
        let x = &input[c * len..(c + 1) * len];

        // High-pass filter: (1 - 2z^-1 + z^-2) / (1 - z^-1 + .5 z^-2).
        let mut mem0 = 0.0f32;
        let mut mem1 = 0.0f32;
        for i in 0..len {
            let xi = x[i];
            let y = mem0 + xi;
            mem0 = mem1 + y - 2.0 * xi;
            mem1 = xi - 0.5 * y;
            tmp[i] = 0.25 * y;
        }
        // The first few samples are bad because the memory starts cold.
        for v in tmp.iter_mut().take(12) {
            *v = 0.0;
        }

        // Per-pair energy, smoothed by a forward-masking follower.
        let mut mean = 0.0f32;
        let mut fwd = 0.0f32;
        for i in 0..len2 {
            let x2 =
                (tmp[2 * i] * tmp[2 * i] + tmp[2 * i + 1] * tmp[2 * i + 1]) * (1.0 / 65536.0);
            mean += x2;
            fwd += forward_decay * (x2 - fwd);
            tmp[i] = fwd;
        }

        // Backward masking pass.
        let mut bwd = 0.0f32;
        let mut max_e = 0.0f32;
        for i in (0..len2).rev() {
            bwd += 0.125 * (tmp[i] - bwd);
            tmp[i] = bwd;
            max_e = max_e.max(bwd);
        }

        // The frame energy is the geometric mean of the mean energy and half the peak; the
        // metric below is a bitrate-normalized temporal noise-to-mask ratio.
        let mean = (mean.sqrt()) * (max_e * (len2 >> 1) as f32).sqrt();
        let norm = len2 as f32 / (1e-15 + mean);

        let mut unmask = 0i32;
        let mut i = 12;
        while i < len2 - 5 {
            let id = (64.0 * norm * (tmp[i] + 1e-15)).floor().clamp(0.0, 127.0) as usize;
            unmask += i32::from(INV_TABLE[id]);
            i += 4;
        }

        // Normalize for the subsampling and the factor 6 in the inverse table.
        let unmask = 64 * unmask * 4 / (6 * (len2 as i32 - 17));
        if unmask > mask_metric {
            tf_chan = c;
            mask_metric = unmask;
        }
    }

    let mut is_transient = mask_metric > 200;

    // A partial cycle of a very low frequency tone is not a transient.
    if toneishness > 0.98 && tone_freq < 0.026 {
        is_transient = false;
    }

    // Arbitrary metric for the VBR boost.
    let tf_max = ((27 * mask_metric) as f32).sqrt() - 42.0;
    let tf_max = tf_max.max(0.0);
    let tf_estimate = (0.0069 * tf_max.min(163.0) - 0.139).max(0.0).sqrt();

    (is_transient, tf_estimate, tf_chan)
}

/// Probe for a dominant tone with a two-tap predictor, downsampling by doubling the tap delay
/// until the predictor resonates. Returns `(frequency in radians, toneishness)`, or `(-1, 0)`
/// when no resonance is found.
fn tone_detect(input: &[f32], channels: usize, len: usize, skip: usize) -> (f32, f32) {
    // Sum the channels; the tone of interest is common to both.
    let mut x = vec![0.0f32; len - skip];
    for (i, v) in x.iter_mut().enumerate() {
        *v = input[skip + i];
        if channels == 2 {
            *v = 0.5 * (*v + input[len + skip + i]);
        }
    }

    let n = x.len();
    let mut delay = 1usize;

    while delay <= 64 && 4 * delay < n {
        let mut r0 = 1e-15f32;
        let mut r1 = 0.0f32;
        let mut r2 = 0.0f32;
        for i in 2 * delay..n {
            r0 += x[i] * x[i];
            r1 += x[i] * x[i - delay];
            r2 += x[i] * x[i - 2 * delay];
        }
        // Two-tap normal equations.
        let den = r0 * r0 - r1 * r1;
        if den > 1e-15 {
            let a1 = r1 * (r0 - r2) / den;
            let a2 = (r0 * r2 - r1 * r1) / den;

            // Resonance: complex pole pair.
            if a1 * a1 + 3.999999 * a2 < 0.0 {
                let toneishness = ((a1 * r1 + a2 * r2) / r0).clamp(0.0, 1.0);
                let freq = (a1 / (2.0 * (-a2).sqrt())).clamp(-1.0, 1.0).acos()
                    / delay as f32;
                return (freq, toneishness);
            }
        }

        delay *= 2;
    }

    (-1.0, 0.0)
}

/// Catch transients the time-domain detector missed by comparing the new envelope against an
/// aggressively spread copy of the previous one.
fn patch_transient_decision(
    new_e: &[f32],
    old_e: &[f32],
    start: usize,
    end: usize,
    channels: usize,
) -> bool {
    let mut spread_old = [0.0f32; NB_BANDS];

    if channels == 1 {
        spread_old[start] = old_e[start];
        for i in start + 1..end {
            spread_old[i] = (spread_old[i - 1] - 1.0).max(old_e[i]);
        }
    }
    else {
        spread_old[start] = old_e[start].max(old_e[start + NB_BANDS]);
        for i in start + 1..end {
            spread_old[i] = (spread_old[i - 1] - 1.0).max(old_e[i].max(old_e[i + NB_BANDS]));
        }
    }

    for i in (start..end - 1).rev() {
        spread_old[i] = spread_old[i].max(spread_old[i + 1] - 1.0);
    }

    // Mean energy increase over the spread old envelope.
    let mut mean_diff = 0.0f32;
    for c in 0..channels {
        for i in 2.max(start)..end - 1 {
            let x1 = new_e[i + c * NB_BANDS].max(0.0);
            let x2 = spread_old[i].max(0.0);
            mean_diff += (x1 - x2).max(0.0);
        }
    }
    mean_diff /= (channels * (end - 1 - 2.max(start))) as f32;

    mean_diff > 1.0
}

fn median_of_5(x: &[f32]) -> f32 {
    let (t0, t1) = if x[0] > x[1] { (x[1], x[0]) } else { (x[0], x[1]) };
    let t2 = x[2];
    let (t3, t4) = if x[3] > x[4] { (x[4], x[3]) } else { (x[3], x[4]) };

    // Only the larger pair and the pivot matter from here on.
    let (_, t1, t3, t4) = if t0 > t3 { (t3, t4, t0, t1) } else { (t0, t1, t3, t4) };

    if t2 > t1 {
        if t1 < t3 {
            t2.min(t3)
        }
        else {
            t4.min(t1)
        }
    }
    else if t2 < t3 {
        t1.min(t3)
    }
    else {
        t2.min(t4)
    }
}

fn median_of_3(x: &[f32]) -> f32 {
    let (t0, t1) = if x[0] > x[1] { (x[1], x[0]) } else { (x[0], x[1]) };
    let t2 = x[2];

    if t1 < t2 {
        t1
    }
    else if t0 < t2 {
        t2
    }
    else {
        t0
    }
}

/// Per-band boost analysis: a masking follower over the band envelope decides which bands need
/// bits beyond the static allocation, plus per-band importance and spreading weights.
///
/// Returns the maximum signal depth above the noise floor.
#[allow(clippy::too_many_arguments)]
fn dynalloc_analysis(
    band_log_e: &[f32],
    band_log_e2: &[f32],
    start: usize,
    end: usize,
    channels: usize,
    offsets: &mut [i32; NB_BANDS],
    lsb_depth: i32,
    is_transient: bool,
    vbr: bool,
    constrained_vbr: bool,
    lm: usize,
    effective_bytes: i32,
    tot_boost_out: &mut i32,
    lfe: bool,
    importance: &mut [i32; NB_BANDS],
    spread_weight: &mut [i32; NB_BANDS],
) -> f32 {
    let mut follower = [0.0f32; 2 * NB_BANDS];
    let mut noise_floor = [0.0f32; NB_BANDS];
    let mut tot_boost = 0i32;

    for v in offsets.iter_mut() {
        *v = 0;
    }

    for i in 0..end {
        // The noise floor accounts for the band width, the source depth, the mean removal and
        // the pre-emphasis tilt (roughly quadratic in the bark band index).
        noise_floor[i] = 0.0625 * LOG_N[i] as f32 + 0.5 + (9 - lsb_depth) as f32 - E_MEANS[i]
            + 0.0062 * ((i + 5) * (i + 5)) as f32;
    }

    let mut max_depth = -31.9f32;
    for c in 0..channels {
        for i in 0..end {
            max_depth = max_depth.max(band_log_e[c * NB_BANDS + i] - noise_floor[i]);
        }
    }

    // Simple masking model for the spreading decision only: which bands are near-masked.
    {
        let mut mask = [0.0f32; NB_BANDS];
        let mut sig = [0.0f32; NB_BANDS];

        for i in 0..end {
            mask[i] = band_log_e[i] - noise_floor[i];
        }
        if channels == 2 {
            for i in 0..end {
                mask[i] = mask[i].max(band_log_e[NB_BANDS + i] - noise_floor[i]);
            }
        }
        sig[..end].copy_from_slice(&mask[..end]);

        for i in 1..end {
            mask[i] = mask[i].max(mask[i - 1] - 2.0);
        }
        for i in (0..end - 1).rev() {
            mask[i] = mask[i].max(mask[i + 1] - 3.0);
        }

        for i in 0..end {
            // Signal-to-mask ratio: the mask is never more than 72 dB below the peak and
            // never below the noise floor.
            let smr = sig[i] - (mask[i].max(0.0f32.max(max_depth - 12.0)));
            let shift = (-(0.5 + smr).floor()).clamp(0.0, 5.0) as i32;
            spread_weight[i] = 1.max(32 >> shift);
        }
    }

    if effective_bytes >= 30 + 5 * lm as i32 && !lfe {
        let mut last = 0usize;

        for c in 0..channels {
            let e2 = &band_log_e2[c * NB_BANDS..];
            let f = &mut follower[c * NB_BANDS..c * NB_BANDS + NB_BANDS];

            f[0] = e2[0];
            for i in 1..end {
                // The last band at least 3 dB above its neighbour is the last considered;
                // beyond it, band-limited signals trip the follower for nothing.
                if e2[i] > e2[i - 1] + 0.5 {
                    last = i;
                }
                f[i] = (f[i - 1] + 1.5).min(e2[i]);
            }
            for i in (0..last).rev() {
                f[i] = f[i].min((f[i + 1] + 2.0).min(e2[i]));
            }

            // A median filter keeps lone spikes from triggering the boost.
            let offset = 1.0f32;
            for i in 2..end - 2 {
                f[i] = f[i].max(median_of_5(&e2[i - 2..i + 3]) - offset);
            }
            let tmp = median_of_3(&e2[0..3]) - offset;
            f[0] = f[0].max(tmp);
            f[1] = f[1].max(tmp);
            let tmp = median_of_3(&e2[end - 3..end]) - offset;
            f[end - 2] = f[end - 2].max(tmp);
            f[end - 1] = f[end - 1].max(tmp);

            for i in 0..end {
                f[i] = f[i].max(noise_floor[i]);
            }
        }

        if channels == 2 {
            for i in start..end {
                // Consider 24 dB of cross-talk.
                follower[NB_BANDS + i] = follower[NB_BANDS + i].max(follower[i] - 4.0);
                follower[i] = follower[i].max(follower[NB_BANDS + i] - 4.0);
                follower[i] = 0.5
                    * ((band_log_e[i] - follower[i]).max(0.0)
                        + (band_log_e[NB_BANDS + i] - follower[NB_BANDS + i]).max(0.0));
            }
        }
        else {
            for i in start..end {
                follower[i] = (band_log_e[i] - follower[i]).max(0.0);
            }
        }

        for i in start..end {
            importance[i] = (0.5 + 13.0 * celt_exp2(follower[i].min(4.0))).floor() as i32;
        }

        // For CBR and non-transient constrained-VBR frames, halve the contribution.
        if !vbr || (constrained_vbr && !is_transient) {
            for v in follower.iter_mut().take(end) {
                *v *= 0.5;
            }
        }

        for i in start..end {
            if i < 8 {
                follower[i] *= 2.0;
            }
            if i >= 12 {
                follower[i] *= 0.5;
            }
        }

        for i in start..end {
            let f = follower[i].min(4.0);

            let width = (channels as i32)
                * ((crate::tables::E_BANDS[i + 1] - crate::tables::E_BANDS[i]) as i32)
                << lm;

            let (boost, boost_bits);
            if width < 6 {
                boost = f as i32;
                boost_bits = boost * width << BITRES;
            }
            else if width > 48 {
                boost = (f * 8.0) as i32;
                boost_bits = (boost * width << BITRES) / 8;
            }
            else {
                boost = (f * width as f32 / 6.0) as i32;
                boost_bits = boost * 6 << BITRES;
            }

            // CBR and non-transient constrained-VBR frames cap dynalloc at 2/3 of the bits.
            if (!vbr || (constrained_vbr && !is_transient))
                && (tot_boost + boost_bits) >> BITRES >> 3 > 2 * effective_bytes / 3
            {
                let cap = (2 * effective_bytes / 3) << BITRES << 3;
                offsets[i] = cap - tot_boost;
                tot_boost = cap;
                break;
            }
            else {
                offsets[i] = boost;
                tot_boost += boost_bits;
            }
        }
    }
    else {
        for v in importance.iter_mut().take(end) {
            *v = 13;
        }
    }

    *tot_boost_out = tot_boost;

    max_depth
}

fn l1_metric(tmp: &[f32], lm: i32, bias: f32) -> f32 {
    let l1: f32 = tmp.iter().map(|v| v.abs()).sum();
    // When in doubt, prefer better frequency resolution.
    l1 + lm as f32 * bias * l1
}

/// Per-band time-frequency tradeoff: measure the L1 cost of each Haar split depth and run a
/// two-state Viterbi over the bands to settle the flags. Returns `tf_select`.
#[allow(clippy::too_many_arguments)]
fn tf_analysis(
    len: usize,
    is_transient: bool,
    tf_res: &mut [i32; NB_BANDS],
    lambda: i32,
    x: &[f32],
    n0: usize,
    lm: usize,
    tf_estimate: f32,
    tf_chan: usize,
    importance: &[i32; NB_BANDS],
) -> i32 {
    use crate::tables::E_BANDS;

    let bias = 0.04 * (0.5 - tf_estimate).max(-0.25);

    let mut metric = [0i32; NB_BANDS];
    let mut path0 = [0i32; NB_BANDS];
    let mut path1 = [0i32; NB_BANDS];

    let max_band = ((E_BANDS[NB_BANDS] - E_BANDS[NB_BANDS - 1]) as usize) << lm;
    let mut tmp = vec![0.0f32; max_band];
    let mut tmp_1 = vec![0.0f32; max_band];

    for i in 0..len {
        let band_n = ((E_BANDS[i + 1] - E_BANDS[i]) as usize) << lm;
        let narrow = (E_BANDS[i + 1] - E_BANDS[i]) == 1;

        let lo = ((E_BANDS[i] as usize) << lm) + tf_chan * n0;
        tmp[..band_n].copy_from_slice(&x[lo..lo + band_n]);

        let mut best_l1 = l1_metric(&tmp[..band_n], if is_transient { lm as i32 } else { 0 }, bias);
        let mut best_level = 0i32;

        // The -1 level (frequency recombine) only exists for transients.
        if is_transient && !narrow {
            tmp_1[..band_n].copy_from_slice(&tmp[..band_n]);
            bands::haar1(&mut tmp_1[..band_n], band_n >> lm, 1 << lm);
            let l1 = l1_metric(&tmp_1[..band_n], lm as i32 + 1, bias);
            if l1 < best_l1 {
                best_l1 = l1;
                best_level = -1;
            }
        }

        let extra = usize::from(!(is_transient || narrow));
        for k in 0..lm + extra {
            let b = if is_transient { lm as i32 - k as i32 - 1 } else { k as i32 + 1 };

            bands::haar1(&mut tmp[..band_n], band_n >> k, 1 << k);

            let l1 = l1_metric(&tmp[..band_n], b, bias);
            if l1 < best_l1 {
                best_l1 = l1;
                best_level = k as i32 + 1;
            }
        }

        // Metric in Q1 so the mid-point is representable for narrow bands.
        metric[i] = if is_transient { 2 * best_level } else { -2 * best_level };

        // Bands that can't be halved to -1 get the half-way metric to avoid biasing.
        if narrow && (metric[i] == 0 || metric[i] == -2 * lm as i32) {
            metric[i] -= 1;
        }
    }

    // Try both tf_select values.
    let mut selcost = [0i32; 2];
    for sel in 0..2usize {
        let t0 = 2 * i32::from(
            TF_SELECT_TABLE[lm][4 * usize::from(is_transient) + 2 * sel],
        );
        let t1 = 2 * i32::from(
            TF_SELECT_TABLE[lm][4 * usize::from(is_transient) + 2 * sel + 1],
        );

        let mut cost0 = importance[0] * (metric[0] - t0).abs();
        let mut cost1 = importance[0] * (metric[0] - t1).abs()
            + if is_transient { 0 } else { lambda };

        for i in 1..len {
            let curr0 = cost0.min(cost1 + lambda);
            let curr1 = (cost0 + lambda).min(cost1);
            cost0 = curr0 + importance[i] * (metric[i] - t0).abs();
            cost1 = curr1 + importance[i] * (metric[i] - t1).abs();
        }

        selcost[sel] = cost0.min(cost1);
    }

    // tf_select is only allowed to matter on transients.
    let tf_select = i32::from(selcost[1] < selcost[0] && is_transient);

    let t0 = 2 * i32::from(
        TF_SELECT_TABLE[lm][4 * usize::from(is_transient) + 2 * tf_select as usize],
    );
    let t1 = 2 * i32::from(
        TF_SELECT_TABLE[lm][4 * usize::from(is_transient) + 2 * tf_select as usize + 1],
    );

    let mut cost0 = importance[0] * (metric[0] - t0).abs();
    let mut cost1 =
        importance[0] * (metric[0] - t1).abs() + if is_transient { 0 } else { lambda };

    // Viterbi forward pass.
    for i in 1..len {
        let (curr0, p0) =
            if cost0 < cost1 + lambda { (cost0, 0) } else { (cost1 + lambda, 1) };
        let (curr1, p1) =
            if cost0 + lambda < cost1 { (cost0 + lambda, 0) } else { (cost1, 1) };

        path0[i] = p0;
        path1[i] = p1;
        cost0 = curr0 + importance[i] * (metric[i] - t0).abs();
        cost1 = curr1 + importance[i] * (metric[i] - t1).abs();
    }

    tf_res[len - 1] = i32::from(cost0 >= cost1);

    // Backward pass reads the decisions out.
    for i in (0..len - 1).rev() {
        tf_res[i] = if tf_res[i + 1] == 1 { path1[i + 1] } else { path0[i + 1] };
    }

    tf_select
}

/// Write the per-band tf flags (delta-coded) and the tf_select bit when it matters.
fn tf_encode(
    start: usize,
    end: usize,
    is_transient: bool,
    tf_res: &mut [i32; NB_BANDS],
    lm: usize,
    mut tf_select: i32,
    enc: &mut RangeEncoder<'_>,
) {
    let mut budget = enc.storage() * 8;
    let mut tell = enc.tell();
    let mut logp: u32 = if is_transient { 2 } else { 4 };

    // Reserve a bit for the tf_select decision.
    let tf_select_rsv = lm > 0 && tell + logp + 1 <= budget;
    budget -= u32::from(tf_select_rsv);

    let mut curr = 0i32;
    let mut tf_changed = 0i32;

    for i in start..end {
        if tell + logp <= budget {
            enc.encode_bit_logp((tf_res[i] ^ curr) != 0, logp);
            tell = enc.tell();
            curr = tf_res[i];
            tf_changed |= curr;
        }
        else {
            tf_res[i] = curr;
        }
        logp = if is_transient { 4 } else { 5 };
    }

    let ti = usize::from(is_transient);
    if tf_select_rsv
        && TF_SELECT_TABLE[lm][4 * ti + tf_changed as usize]
            != TF_SELECT_TABLE[lm][4 * ti + 2 + tf_changed as usize]
    {
        enc.encode_bit_logp(tf_select != 0, 1);
    }
    else {
        tf_select = 0;
    }

    for i in start..end {
        tf_res[i] =
            i32::from(TF_SELECT_TABLE[lm][4 * ti + 2 * tf_select as usize + tf_res[i] as usize]);
    }
}

/// L1-norm entropy model deciding between dual (L/R) and mid/side stereo.
fn stereo_analysis(x: &[f32], lm: usize, n0: usize) -> bool {
    use crate::tables::E_BANDS;

    let mut sum_lr = 1e-15f32;
    let mut sum_ms = 1e-15f32;

    for i in 0..13 {
        for j in (E_BANDS[i] as usize) << lm..(E_BANDS[i + 1] as usize) << lm {
            let l = x[j];
            let r = x[n0 + j];
            sum_lr += l.abs() + r.abs();
            sum_ms += (l + r).abs() + (l - r).abs();
        }
    }

    let sum_ms = 0.707107 * sum_ms;

    let mut thetas = 13;
    // The lower bands don't need the angles at short frame sizes.
    if lm <= 1 {
        thetas -= 8;
    }

    (((E_BANDS[13] as i32) << (lm + 1)) + thetas) as f32 * sum_ms
        > (((E_BANDS[13] as i32) << (lm + 1)) as f32) * sum_lr
}

fn hysteresis_decision(val: i32, thresholds: &[i32; 21], hysteresis: &[i32; 21], prev: usize) -> usize {
    let mut i = 0;
    while i < 21 {
        if val < thresholds[i] {
            break;
        }
        i += 1;
    }

    if i > prev && prev < 21 && val < thresholds[prev] + hysteresis[prev] {
        i = prev;
    }
    if i < prev && prev >= 1 && val > thresholds[prev - 1] - hysteresis[prev - 1] {
        i = prev;
    }

    i
}

/// Decide the allocation trim from the stereo correlation, the spectral tilt, and the transient
/// estimate.
#[allow(clippy::too_many_arguments)]
fn alloc_trim_analysis(
    x: &[f32],
    band_log_e: &[f32],
    end: usize,
    lm: usize,
    channels: usize,
    n0: usize,
    stereo_saving: &mut f32,
    tf_estimate: f32,
    intensity: usize,
    equiv_rate: i32,
) -> i32 {
    use crate::tables::E_BANDS;

    let mut trim = 5.0f32;

    // Reducing the trim helps at low rates.
    if equiv_rate < 64000 {
        trim = 4.0;
    }
    else if equiv_rate < 80000 {
        let frac = ((equiv_rate - 64000) >> 10) as f32;
        trim = 4.0 + frac / 16.0;
    }

    if channels == 2 {
        // Inter-channel correlation over the low bands.
        let mut sum = 0.0f32;
        for i in 0..8 {
            let lo = (E_BANDS[i] as usize) << lm;
            let hi = (E_BANDS[i + 1] as usize) << lm;
            sum += celt_inner_prod(&x[lo..hi], &x[n0 + lo..n0 + hi]);
        }
        sum = (sum / 8.0).abs().min(1.0);

        let mut min_xc = sum;
        for i in 8..intensity.min(end) {
            let lo = (E_BANDS[i] as usize) << lm;
            let hi = (E_BANDS[i + 1] as usize) << lm;
            min_xc = min_xc.min(celt_inner_prod(&x[lo..hi], &x[n0 + lo..n0 + hi]).abs());
        }
        let min_xc = min_xc.min(1.0);

        // Mid/side savings estimate from the LF average correlation.
        let log_xc = crate::math::celt_log2(1.001 - sum * sum);
        let log_xc2 = (0.5 * log_xc).max(crate::math::celt_log2(1.001 - min_xc * min_xc));

        trim += (0.75 * log_xc).max(-4.0);
        *stereo_saving = (*stereo_saving + 0.25).min(-0.5 * log_xc2);
    }

    // Spectral tilt.
    let mut diff = 0.0f32;
    for c in 0..channels {
        for i in 0..end - 1 {
            diff += band_log_e[i + c * NB_BANDS] * (2 + 2 * i as i32 - end as i32) as f32;
        }
    }
    diff /= (channels * (end - 1)) as f32;

    trim -= ((diff + 1.0) / 6.0).clamp(-2.0, 2.0);
    trim -= 2.0 * tf_estimate;

    (0.5 + trim).floor().clamp(0.0, 10.0) as i32
}

/// VBR rate control: adjust the base target for stereo savings, dynalloc, transients and
/// temporal masking.
#[allow(clippy::too_many_arguments)]
fn compute_vbr(
    base_target: i32,
    lm: usize,
    bitrate: i32,
    last_coded_bands: usize,
    channels: usize,
    intensity: usize,
    constrained_vbr: bool,
    mut stereo_saving: f32,
    tot_boost: i32,
    tf_estimate: f32,
    _pitch_change: bool,
    max_depth: f32,
    lfe: bool,
    temporal_vbr: f32,
) -> i32 {
    use crate::tables::E_BANDS;

    let coded_bands = if last_coded_bands != 0 { last_coded_bands } else { NB_BANDS };
    let mut coded_bins = (E_BANDS[coded_bands] as i32) << lm;
    if channels == 2 {
        coded_bins += (E_BANDS[intensity.min(coded_bands)] as i32) << lm;
    }

    let mut target = base_target;

    if channels == 2 {
        let coded_stereo_bands = intensity.min(coded_bands);
        let coded_stereo_dof =
            ((E_BANDS[coded_stereo_bands] as i32) << lm) - coded_stereo_bands as i32;
        // The most we can save if the signal turns out to be mono.
        let max_frac = 0.8 * coded_stereo_dof as f32 / coded_bins as f32;
        stereo_saving = stereo_saving.min(1.0);

        target -= ((max_frac * target as f32)
            .min((stereo_saving - 0.1) * (coded_stereo_dof << BITRES) as f32))
            as i32;
    }

    // Boost according to dynalloc, minus its average for calibration.
    target += tot_boost - (19 << lm);

    // Transient boost, compensating for the average.
    let tf_calibration = 0.044;
    target += (2.0 * (tf_estimate - tf_calibration) * target as f32) as i32;

    // Cap the depth of the coded noise floor.
    let bins = (E_BANDS[NB_BANDS - 2] as i32) << lm;
    let floor_depth = ((channels as i32 * bins << BITRES) as f32 * max_depth) as i32;
    let floor_depth = floor_depth.max(target >> 2);
    target = target.min(floor_depth);

    // Constrained VBR can't sustain a higher rate for long; be less aggressive.
    if constrained_vbr {
        target = base_target + (0.67 * (target - base_target) as f32) as i32;
    }

    if !lfe {
        let amount = 0.0000031 * (0.max(32000.min(96000 - bitrate))) as f32;
        let tvbr_factor = temporal_vbr * amount;
        target += (tvbr_factor * target as f32) as i32;
    }
    else {
        target = target.min(base_target);
    }

    // Never more than double the base rate.
    target.min(2 * base_target)
}

/// Pitch analysis and the pre-filter comb. Mutates the analysis buffer in place and saves the
/// filter history for the next frame. Returns `(pf_on, pitch_index, gain, qg)`.
#[allow(clippy::too_many_arguments)]
fn run_prefilter(
    st: &mut EncoderFrameState,
    mode: &Mode,
    input: &mut [f32],
    channels: usize,
    n: usize,
    prefilter_tapset: usize,
    enabled: bool,
    nb_available_bytes: i32,
    loss_rate: i32,
    toneishness: f32,
) -> (bool, usize, f32, i32) {
    let overlap = OVERLAP;

    // The unfiltered signal with its history.
    let mut pre = vec![0.0f32; channels * (n + COMBFILTER_MAXPERIOD)];
    for c in 0..channels {
        pre[c * (n + COMBFILTER_MAXPERIOD)..c * (n + COMBFILTER_MAXPERIOD) + COMBFILTER_MAXPERIOD]
            .copy_from_slice(
                &st.prefilter_mem[c * COMBFILTER_MAXPERIOD..(c + 1) * COMBFILTER_MAXPERIOD],
            );
        pre[c * (n + COMBFILTER_MAXPERIOD) + COMBFILTER_MAXPERIOD
            ..(c + 1) * (n + COMBFILTER_MAXPERIOD)]
            .copy_from_slice(&input[c * (n + overlap) + overlap..(c + 1) * (n + overlap)]);
    }

    let mut gain1;
    let mut pitch_index;

    if enabled {
        let mut pitch_buf = vec![0.0f32; (COMBFILTER_MAXPERIOD + n) >> 1];

        {
            let chans: Vec<&[f32]> = (0..channels)
                .map(|c| &pre[c * (n + COMBFILTER_MAXPERIOD)..(c + 1) * (n + COMBFILTER_MAXPERIOD)])
                .collect();
            pitch_downsample(&chans, &mut pitch_buf);
        }

        // Skip the lowest 1.5 octaves of lag; short-term correlation is full of
        // false positives there.
        let pitch = pitch_search(
            &pitch_buf[COMBFILTER_MAXPERIOD >> 1..],
            &pitch_buf,
            n,
            COMBFILTER_MAXPERIOD - 3 * COMBFILTER_MINPERIOD,
        );
        pitch_index = COMBFILTER_MAXPERIOD - pitch;

        gain1 = remove_doubling(
            &pitch_buf,
            COMBFILTER_MAXPERIOD,
            COMBFILTER_MINPERIOD,
            n,
            &mut pitch_index,
            st.prefilter_period,
            st.prefilter_gain,
        );

        if pitch_index > COMBFILTER_MAXPERIOD - 2 {
            pitch_index = COMBFILTER_MAXPERIOD - 2;
        }
        gain1 *= 0.7;

        if loss_rate > 2 {
            gain1 *= 0.5;
        }
        if loss_rate > 4 {
            gain1 *= 0.5;
        }
        if loss_rate > 8 {
            gain1 = 0.0;
        }
    }
    else {
        gain1 = 0.0;
        pitch_index = COMBFILTER_MINPERIOD;
    }

    // The pre-filter causes artifacts on pure tones.
    if toneishness > 0.99 {
        gain1 = 0.0;
    }

    // Gain threshold for enabling the filter, adjusted for rate and continuity.
    let mut pf_threshold = 0.2f32;

    if (pitch_index as i32 - st.prefilter_period as i32).abs() * 10 > pitch_index as i32 {
        pf_threshold += 0.2;
    }
    if nb_available_bytes < 25 {
        pf_threshold += 0.1;
    }
    if nb_available_bytes < 35 {
        pf_threshold += 0.1;
    }
    if st.prefilter_gain > 0.4 {
        pf_threshold -= 0.1;
    }
    if st.prefilter_gain > 0.55 {
        pf_threshold -= 0.1;
    }

    let pf_threshold = pf_threshold.max(0.2);

    let (pf_on, qg) = if gain1 < pf_threshold {
        gain1 = 0.0;
        (false, 0)
    }
    else {
        if (gain1 - st.prefilter_gain).abs() < 0.1 {
            gain1 = st.prefilter_gain;
        }

        let qg = ((0.5 + gain1 * 32.0 / 3.0).floor() as i32 - 1).clamp(0, 7);
        gain1 = 0.09375 * (qg + 1) as f32;
        (true, qg)
    };

    // The filter parameters change at a short-block boundary; with a full-length taper the
    // cross-fade starts immediately.
    let offset = SHORT_MDCT_SIZE - overlap;

    st.prefilter_period = st.prefilter_period.max(COMBFILTER_MINPERIOD);

    for c in 0..channels {
        let in_base = c * (n + overlap);
        let pre_base = c * (n + COMBFILTER_MAXPERIOD);

        // Carry the analysis tail from the previous frame.
        input[in_base..in_base + overlap]
            .copy_from_slice(&st.in_mem[c * overlap..(c + 1) * overlap]);

        if offset > 0 {
            comb_filter(
                &mut input[in_base + overlap..in_base + overlap + offset],
                &pre[pre_base..],
                COMBFILTER_MAXPERIOD,
                st.prefilter_period,
                st.prefilter_period,
                offset,
                -st.prefilter_gain,
                -st.prefilter_gain,
                st.prefilter_tapset,
                st.prefilter_tapset,
                &[],
                0,
            );
        }

        comb_filter(
            &mut input[in_base + overlap + offset..in_base + overlap + n],
            &pre[pre_base..],
            COMBFILTER_MAXPERIOD + offset,
            st.prefilter_period,
            pitch_index,
            n - offset,
            -st.prefilter_gain,
            -gain1,
            st.prefilter_tapset,
            prefilter_tapset,
            &mode.window,
            overlap,
        );

        st.in_mem[c * overlap..(c + 1) * overlap]
            .copy_from_slice(&input[in_base + n..in_base + n + overlap]);

        // Keep COMBFILTER_MAXPERIOD samples of unfiltered history.
        if n >= COMBFILTER_MAXPERIOD {
            st.prefilter_mem[c * COMBFILTER_MAXPERIOD..(c + 1) * COMBFILTER_MAXPERIOD]
                .copy_from_slice(&pre[pre_base + n..pre_base + n + COMBFILTER_MAXPERIOD]);
        }
        else {
            let mem =
                &mut st.prefilter_mem[c * COMBFILTER_MAXPERIOD..(c + 1) * COMBFILTER_MAXPERIOD];
            mem.copy_within(n..COMBFILTER_MAXPERIOD, 0);
            mem[COMBFILTER_MAXPERIOD - n..].copy_from_slice(
                &pre[pre_base + COMBFILTER_MAXPERIOD..pre_base + COMBFILTER_MAXPERIOD + n],
            );
        }
    }

    (pf_on, pitch_index, gain1, qg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_options_validation() {
        assert!(Encoder::try_new(EncoderOptions::default()).is_ok());

        let bad_channels = EncoderOptions { channels: 3, ..Default::default() };
        assert!(Encoder::try_new(bad_channels).is_err());

        let bad_frame = EncoderOptions { frame_size: 1000, ..Default::default() };
        assert!(Encoder::try_new(bad_frame).is_err());

        let bad_depth = EncoderOptions { lsb_depth: 4, ..Default::default() };
        assert!(Encoder::try_new(bad_depth).is_err());
    }

    #[test]
    fn verify_transient_detector_fires_on_impulse() {
        let len = 960 + OVERLAP;
        let mut input = vec![0.0f32; len];
        for (i, v) in input.iter_mut().enumerate() {
            *v = if i >= 320 && i < 330 { 20000.0 } else { 1.0 };
        }

        let (is_transient, tf_estimate, _) = transient_analysis(&input, len, 1, -1.0, 0.0);

        assert!(is_transient);
        assert!(tf_estimate >= 0.0);
    }

    #[test]
    fn verify_transient_detector_quiet_on_stationary() {
        let len = 960 + OVERLAP;
        let input: Vec<f32> = (0..len)
            .map(|i| 8192.0 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 48000.0).sin())
            .collect();

        let (is_transient, _, _) = transient_analysis(&input, len, 1, -1.0, 0.0);

        assert!(!is_transient);
    }

    #[test]
    fn verify_tone_detect_finds_pure_tone() {
        let len = 960 + OVERLAP;
        let input: Vec<f32> = (0..len)
            .map(|i| 8192.0 * (2.0 * std::f32::consts::PI * 1000.0 * i as f32 / 48000.0).sin())
            .collect();

        let (freq, toneishness) = tone_detect(&input, 1, len, OVERLAP);

        let expected = 2.0 * std::f32::consts::PI * 1000.0 / 48000.0;
        assert!((freq - expected).abs() < 0.01, "freq {} vs {}", freq, expected);
        assert!(toneishness >= 0.85, "toneishness {}", toneishness);
    }

    #[test]
    fn verify_tone_detect_rejects_noise() {
        use rand::rngs::SmallRng;
        use rand::{Rng, SeedableRng};

        let mut rng = SmallRng::seed_from_u64(0xd1ce);
        let len = 960 + OVERLAP;
        let input: Vec<f32> =
            (0..len).map(|_| 16384.0 * (2.0 * rng.random::<f32>() - 1.0)).collect();

        let (_, toneishness) = tone_detect(&input, 1, len, OVERLAP);

        assert!(toneishness < 0.85, "noise scored {}", toneishness);
    }

    #[test]
    fn verify_hysteresis_decision_sticks() {
        const T: [i32; 21] =
            [1, 2, 3, 4, 5, 6, 7, 8, 16, 24, 36, 44, 50, 56, 62, 67, 72, 79, 88, 106, 134];
        const H: [i32; 21] =
            [1, 1, 1, 1, 1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 4, 5, 6, 8, 8, 8, 8];

        // Crossing a threshold barely from below keeps the previous decision.
        assert_eq!(hysteresis_decision(25, &T, &H, 9), 9);
        // A clear crossing moves.
        assert_eq!(hysteresis_decision(40, &T, &H, 9), 10);
    }
}
