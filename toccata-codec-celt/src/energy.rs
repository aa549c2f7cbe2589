// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `energy` module quantizes the band energy envelope.
//!
//! Coarse quantization codes each band's log-energy at 6 dB resolution with a per-band Laplace
//! model, predicted from the previous frame (inter) or from the previous band only (intra). The
//! encoder tries both and keeps the cheaper one. Fine quantization refines each band by the
//! number of bits the allocator granted it, and the finalise pass spends whatever whole bits are
//! left, one per band and channel, in priority order.

use crate::entropy::{RangeDecoder, RangeEncoder};
use crate::laplace::{laplace_decode, laplace_encode};
use crate::math::celt_log2;
use crate::rate::MAX_FINE_BITS;
use crate::tables::{BETA_COEF, BETA_INTRA, E_MEANS, E_PROB_MODEL, NB_BANDS, PRED_COEF};
use crate::tables::SMALL_ENERGY_ICDF;

/// Convert band amplitudes to mean-removed log2 energies.
pub fn amp2_log2(
    eff_end: usize,
    end: usize,
    band_e: &[f32],
    band_log_e: &mut [f32],
    channels: usize,
) {
    for c in 0..channels {
        for i in 0..eff_end {
            band_log_e[i + c * NB_BANDS] = celt_log2(band_e[i + c * NB_BANDS]) - E_MEANS[i];
        }
        for i in eff_end..end {
            band_log_e[i + c * NB_BANDS] = -14.0;
        }
    }
}

/// Expected concealment distortion if this frame's envelope were predicted from the previous
/// one; drives the delayed-intra decision.
fn loss_distortion(
    band_log_e: &[f32],
    old_e_bands: &[f32],
    start: usize,
    end: usize,
    channels: usize,
) -> f32 {
    let mut dist = 0.0f32;

    for c in 0..channels {
        for i in start..end {
            let d = band_log_e[i + c * NB_BANDS] - old_e_bands[i + c * NB_BANDS];
            dist += d * d;
        }
    }

    dist.min(200.0)
}

#[allow(clippy::too_many_arguments)]
fn quant_coarse_energy_impl(
    start: usize,
    end: usize,
    band_log_e: &[f32],
    old_e_bands: &mut [f32],
    budget: i32,
    mut tell: i32,
    prob_model: &[u8; 42],
    error: &mut [f32],
    enc: &mut RangeEncoder<'_>,
    channels: usize,
    lm: usize,
    intra: bool,
    max_decay: f32,
    lfe: bool,
) -> i32 {
    let mut badness = 0;
    let mut prev = [0.0f32; 2];

    if tell + 3 <= budget {
        enc.encode_bit_logp(intra, 3);
    }

    let (coef, beta) =
        if intra { (0.0, BETA_INTRA) } else { (PRED_COEF[lm], BETA_COEF[lm]) };

    // Encode at a fixed coarse resolution of one bit per 6 dB.
    for i in start..end {
        for c in 0..channels {
            let idx = i + c * NB_BANDS;
            let x = band_log_e[idx];
            let old_e = old_e_bands[idx].max(-9.0);

            let f = x - coef * old_e - prev[c];
            // Rounding to nearest integer here is really important.
            let mut qi = (0.5 + f).floor() as i32;

            let decay_bound = (old_e_bands[idx] - max_decay).max(-28.0);

            // Prevent the energy from dropping faster than the decay bound (e.g. for bands
            // with a single bin).
            if qi < 0 && x < decay_bound {
                qi += (decay_bound - x) as i32;
                if qi > 0 {
                    qi = 0;
                }
            }
            let qi0 = qi;

            // If the bits to code every remaining band aren't there, assume something safe.
            tell = enc.tell() as i32;
            let bits_left = budget - tell - 3 * channels as i32 * (end - i) as i32;

            if i != start && bits_left < 30 {
                if bits_left < 24 {
                    qi = qi.min(1);
                }
                if bits_left < 16 {
                    qi = qi.max(-1);
                }
            }

            if lfe && i >= 2 {
                qi = qi.min(0);
            }

            if budget - tell >= 15 {
                let pi = 2 * i.min(20);
                laplace_encode(
                    enc,
                    &mut qi,
                    u32::from(prob_model[pi]) << 7,
                    i32::from(prob_model[pi + 1]) << 6,
                );
            }
            else if budget - tell >= 2 {
                qi = qi.clamp(-1, 1);
                enc.encode_icdf(((2 * qi) ^ -i32::from(qi < 0)) as usize, &SMALL_ENERGY_ICDF, 2);
            }
            else if budget - tell >= 1 {
                qi = qi.min(0);
                enc.encode_bit_logp(qi == -1, 1);
            }
            else {
                // With zero bits left both endpoints assume a 6 dB drop. Reference-matched
                // behaviour; see the decoder's bit-starved branch.
                qi = -1;
            }

            error[idx] = f - qi as f32;
            badness += (qi0 - qi).abs();

            let q = qi as f32;
            old_e_bands[idx] = coef * old_e + prev[c] + q;
            prev[c] = prev[c] + q - beta * q;
        }
    }

    if lfe {
        0
    }
    else {
        badness
    }
}

/// Coarse energy quantization with a two-pass intra/inter trial.
///
/// Returns whether the frame was coded intra.
#[allow(clippy::too_many_arguments)]
pub fn quant_coarse_energy(
    start: usize,
    end: usize,
    eff_end: usize,
    band_log_e: &[f32],
    old_e_bands: &mut [f32],
    budget: u32,
    error: &mut [f32],
    enc: &mut RangeEncoder<'_>,
    channels: usize,
    lm: usize,
    nb_available_bytes: i32,
    force_intra: bool,
    delayed_intra: &mut f32,
    mut two_pass: bool,
    loss_rate: i32,
    lfe: bool,
) -> bool {
    let budget = budget as i32;

    let mut intra = force_intra
        || (!two_pass
            && *delayed_intra > (2 * channels * (end - start)) as f32
            && nb_available_bytes > ((end - start) * channels) as i32);

    let intra_bias = (budget as f32 * *delayed_intra * loss_rate as f32
        / (channels as f32 * 512.0)) as i32;

    let new_distortion = loss_distortion(band_log_e, old_e_bands, start, eff_end, channels);

    let tell = enc.tell() as i32;
    if tell + 3 > budget {
        two_pass = false;
        intra = false;
    }

    let mut max_decay = 16.0f32;
    if end - start > 10 {
        max_decay = max_decay.min(0.125 * nb_available_bytes as f32);
    }
    if lfe {
        max_decay = 3.0;
    }

    let enc_start_state = enc.save();
    let start_bytes = enc.range_bytes();

    let mut old_intra = [0.0f32; 2 * NB_BANDS];
    let mut error_intra = [0.0f32; 2 * NB_BANDS];
    old_intra[..channels * NB_BANDS].copy_from_slice(&old_e_bands[..channels * NB_BANDS]);

    let mut badness1 = 0;

    if two_pass || intra {
        badness1 = quant_coarse_energy_impl(
            start,
            end,
            band_log_e,
            &mut old_intra,
            budget,
            tell,
            &E_PROB_MODEL[lm][1],
            &mut error_intra,
            enc,
            channels,
            lm,
            true,
            max_decay,
            lfe,
        );
    }

    if !intra {
        let tell_intra = enc.tell_frac() as i32;
        let enc_intra_state = enc.save();
        let intra_bytes = enc.range_bytes();

        // Keep the bytes the intra pass committed; the inter pass will overwrite them.
        let saved: Vec<u8> = enc.get_bytes(start_bytes, intra_bytes).to_vec();

        enc.restore(&enc_start_state);

        let badness2 = quant_coarse_energy_impl(
            start,
            end,
            band_log_e,
            old_e_bands,
            budget,
            tell,
            &E_PROB_MODEL[lm][0],
            error,
            enc,
            channels,
            lm,
            false,
            max_decay,
            lfe,
        );

        if two_pass
            && (badness1 < badness2
                || (badness1 == badness2 && enc.tell_frac() as i32 + intra_bias > tell_intra))
        {
            enc.restore(&enc_intra_state);
            enc.put_bytes(start_bytes, &saved);
            old_e_bands[..channels * NB_BANDS].copy_from_slice(&old_intra[..channels * NB_BANDS]);
            error[..channels * NB_BANDS].copy_from_slice(&error_intra[..channels * NB_BANDS]);
            intra = true;
        }
    }
    else {
        old_e_bands[..channels * NB_BANDS].copy_from_slice(&old_intra[..channels * NB_BANDS]);
        error[..channels * NB_BANDS].copy_from_slice(&error_intra[..channels * NB_BANDS]);
    }

    *delayed_intra = if intra {
        new_distortion
    }
    else {
        PRED_COEF[lm] * PRED_COEF[lm] * *delayed_intra + new_distortion
    };

    intra
}

/// Decode the coarse energy envelope.
pub fn unquant_coarse_energy(
    start: usize,
    end: usize,
    old_e_bands: &mut [f32],
    intra: bool,
    dec: &mut RangeDecoder<'_>,
    channels: usize,
    lm: usize,
) {
    let prob_model = &E_PROB_MODEL[lm][usize::from(intra)];

    let (coef, beta) =
        if intra { (0.0, BETA_INTRA) } else { (PRED_COEF[lm], BETA_COEF[lm]) };

    let mut prev = [0.0f32; 2];
    let budget = dec.storage() as i32 * 8;

    for i in start..end {
        for c in 0..channels {
            let idx = i + c * NB_BANDS;

            let tell = dec.tell() as i32;

            let qi = if budget - tell >= 15 {
                let pi = 2 * i.min(20);
                laplace_decode(
                    dec,
                    u32::from(prob_model[pi]) << 7,
                    i32::from(prob_model[pi + 1]) << 6,
                )
            }
            else if budget - tell >= 2 {
                let q = dec.decode_icdf(&SMALL_ENERGY_ICDF, 2) as i32;
                (q >> 1) ^ -(q & 1)
            }
            else if budget - tell >= 1 {
                -i32::from(dec.decode_bit_logp(1))
            }
            else {
                -1
            };

            let old_e = old_e_bands[idx].max(-9.0);
            let q = qi as f32;

            old_e_bands[idx] = coef * old_e + prev[c] + q;
            prev[c] = prev[c] + q - beta * q;
        }
    }
}

/// Fine energy refinement: quantize the coarse residual to `fine_quant[i]` bits per channel.
pub fn quant_fine_energy(
    start: usize,
    end: usize,
    old_e_bands: &mut [f32],
    error: &mut [f32],
    fine_quant: &[i32; NB_BANDS],
    enc: &mut RangeEncoder<'_>,
    channels: usize,
) {
    for i in start..end {
        if fine_quant[i] <= 0 {
            continue;
        }
        let frac = 1 << fine_quant[i];

        for c in 0..channels {
            let idx = i + c * NB_BANDS;

            let q2 = (((error[idx] + 0.5) * frac as f32).floor() as i32).clamp(0, frac - 1);
            enc.encode_raw_bits(q2 as u32, fine_quant[i] as u32);

            let offset = (q2 as f32 + 0.5) / frac as f32 - 0.5;
            old_e_bands[idx] += offset;
            error[idx] -= offset;
        }
    }
}

/// Spend leftover whole bits on the sign of the residual, least-refined bands first.
#[allow(clippy::too_many_arguments)]
pub fn quant_energy_finalise(
    start: usize,
    end: usize,
    old_e_bands: &mut [f32],
    error: &mut [f32],
    fine_quant: &[i32; NB_BANDS],
    fine_priority: &[bool; NB_BANDS],
    mut bits_left: i32,
    enc: &mut RangeEncoder<'_>,
    channels: usize,
) {
    for prio in [false, true] {
        for i in start..end {
            if bits_left < channels as i32 {
                break;
            }
            if fine_quant[i] >= MAX_FINE_BITS || fine_priority[i] != prio {
                continue;
            }

            for c in 0..channels {
                let idx = i + c * NB_BANDS;

                let q2 = i32::from(error[idx] >= 0.0);
                enc.encode_raw_bits(q2 as u32, 1);

                let offset = (q2 as f32 - 0.5) / (1 << (fine_quant[i] + 1)) as f32;
                old_e_bands[idx] += offset;
                error[idx] -= offset;
                bits_left -= 1;
            }
        }
    }
}

/// Decode the fine energy refinement.
pub fn unquant_fine_energy(
    start: usize,
    end: usize,
    old_e_bands: &mut [f32],
    fine_quant: &[i32; NB_BANDS],
    dec: &mut RangeDecoder<'_>,
    channels: usize,
) {
    for i in start..end {
        if fine_quant[i] <= 0 {
            continue;
        }

        for c in 0..channels {
            let idx = i + c * NB_BANDS;

            let q2 = dec.decode_raw_bits(fine_quant[i] as u32) as i32;
            let offset = (q2 as f32 + 0.5) / (1 << fine_quant[i]) as f32 - 0.5;
            old_e_bands[idx] += offset;
        }
    }
}

/// Decode the finalise-pass sign bits.
#[allow(clippy::too_many_arguments)]
pub fn unquant_energy_finalise(
    start: usize,
    end: usize,
    old_e_bands: &mut [f32],
    fine_quant: &[i32; NB_BANDS],
    fine_priority: &[bool; NB_BANDS],
    mut bits_left: i32,
    dec: &mut RangeDecoder<'_>,
    channels: usize,
) {
    for prio in [false, true] {
        for i in start..end {
            if bits_left < channels as i32 {
                break;
            }
            if fine_quant[i] >= MAX_FINE_BITS || fine_priority[i] != prio {
                continue;
            }

            for c in 0..channels {
                let idx = i + c * NB_BANDS;

                let q2 = dec.decode_raw_bits(1) as i32;
                let offset = (q2 as f32 - 0.5) / (1 << (fine_quant[i] + 1)) as f32;
                old_e_bands[idx] += offset;
                bits_left -= 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::{RangeDecoder, RangeEncoder};

    fn round_trip(band_log_e: &[f32], budget_bytes: usize, lm: usize, intra_only: bool) {
        let channels = 1;

        let mut buf = vec![0u8; budget_bytes];
        let mut enc = RangeEncoder::new(&mut buf);

        let mut old_enc = [0.0f32; 2 * NB_BANDS];
        let mut error = [0.0f32; 2 * NB_BANDS];
        let mut delayed_intra = 0.0;

        let intra = quant_coarse_energy(
            0,
            NB_BANDS,
            NB_BANDS,
            band_log_e,
            &mut old_enc,
            budget_bytes as u32 * 8,
            &mut error,
            &mut enc,
            channels,
            lm,
            budget_bytes as i32,
            intra_only,
            &mut delayed_intra,
            true,
            0,
            false,
        );

        // Fine refinement with a fixed two bits everywhere.
        let fine_quant = [2i32; NB_BANDS];
        quant_fine_energy(0, NB_BANDS, &mut old_enc, &mut error, &fine_quant, &mut enc, channels);

        assert!(!enc.error());
        enc.done();

        let mut dec = RangeDecoder::new(&buf);
        let mut old_dec = [0.0f32; 2 * NB_BANDS];

        let dec_intra = dec.decode_bit_logp(3);
        assert_eq!(dec_intra, intra);

        unquant_coarse_energy(0, NB_BANDS, &mut old_dec, dec_intra, &mut dec, channels, lm);
        unquant_fine_energy(0, NB_BANDS, &mut old_dec, &fine_quant, &mut dec, channels);

        // The envelope the bitstream commits to is identical on both endpoints.
        for i in 0..NB_BANDS {
            assert!(
                (old_enc[i] - old_dec[i]).abs() < 1e-4,
                "envelope mismatch at band {}: {} vs {}",
                i,
                old_enc[i],
                old_dec[i]
            );
        }

        // Quantization error stays within half a coarse step after fine refinement.
        for i in 0..NB_BANDS {
            assert!((band_log_e[i] - old_enc[i]).abs() < 1.0);
        }
    }

    #[test]
    fn verify_coarse_fine_round_trip_intra() {
        let mut band_log_e = [0.0f32; 2 * NB_BANDS];
        for (i, e) in band_log_e.iter_mut().enumerate().take(NB_BANDS) {
            *e = 3.0 - 0.4 * i as f32;
        }

        round_trip(&band_log_e, 200, 3, true);
    }

    #[test]
    fn verify_coarse_fine_round_trip_two_pass() {
        let mut band_log_e = [0.0f32; 2 * NB_BANDS];
        for (i, e) in band_log_e.iter_mut().enumerate().take(NB_BANDS) {
            *e = if i % 4 == 0 { 5.0 } else { -2.0 };
        }

        round_trip(&band_log_e, 180, 2, false);
    }

    #[test]
    fn verify_amp2_log2_silence_floor() {
        let band_e = [1e-30f32; 2 * NB_BANDS];
        let mut band_log_e = [0.0f32; 2 * NB_BANDS];

        amp2_log2(NB_BANDS, NB_BANDS, &band_e, &mut band_log_e, 1);

        for i in 0..NB_BANDS {
            assert!(band_log_e[i] < -50.0);
        }

        // Bands beyond the effective end land exactly on the silence floor.
        let mut band_log_e = [0.0f32; 2 * NB_BANDS];
        amp2_log2(17, NB_BANDS, &band_e, &mut band_log_e, 1);
        for i in 17..NB_BANDS {
            assert_eq!(band_log_e[i], -14.0);
        }
    }

    #[test]
    fn verify_finalise_halves_error() {
        let mut old = [0.0f32; NB_BANDS];
        let mut error = [0.3f32; NB_BANDS];
        let fine_quant = [0i32; NB_BANDS];
        let fine_priority = [false; NB_BANDS];

        let mut buf = vec![0u8; 64];
        let mut enc = RangeEncoder::new(&mut buf);

        quant_energy_finalise(
            0,
            NB_BANDS,
            &mut old,
            &mut error,
            &fine_quant,
            &fine_priority,
            NB_BANDS as i32,
            &mut enc,
            1,
        );
        enc.done();

        // A positive residual gains a +0.25 offset at zero fine bits.
        for i in 0..NB_BANDS {
            assert_eq!(old[i], 0.25);
        }

        let mut dec = RangeDecoder::new(&buf);
        let mut old_dec = [0.0f32; NB_BANDS];
        unquant_energy_finalise(
            0,
            NB_BANDS,
            &mut old_dec,
            &fine_quant,
            &fine_priority,
            NB_BANDS as i32,
            &mut dec,
            1,
        );

        assert_eq!(old, old_dec);
    }
}
