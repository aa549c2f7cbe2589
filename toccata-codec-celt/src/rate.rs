// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `rate` module distributes the frame's bit budget over the bands.
//!
//! The static allocation curves give a psychoacoustically reasonable shape at each of eleven
//! quality levels; the allocator bisects them for the largest level that fits the budget,
//! interpolates between the bracketing rows in 1/64 steps, applies the trim tilt and per-band
//! boosts, and finally splits each band's share between the fine energy quantizer and PVQ.
//!
//! Pulse counts and bit costs are related through a cache computed once per mode: for every
//! distinct band size, the 1/8-bit cost of each representable pseudo-pulse count.

use crate::cwrs::{fits_in32, get_required_bits, MAX_PULSES};
use crate::entropy::{Coder, BITRES};
use crate::tables::{CACHE_CAPS, E_BANDS, LOG2_FRAC_TABLE, LOG_N, NB_ALLOC_VECTORS, NB_BANDS};
use crate::tables::BAND_ALLOCATION;

/// Largest pseudo-pulse index cached per band size.
const MAX_PSEUDO: usize = 40;
const LOG_MAX_PSEUDO: usize = 6;

/// The largest number of fine energy bits a band can use.
pub const MAX_FINE_BITS: i32 = 8;

/// Bias of the fine-energy split, in 1/8 bits per coefficient.
const FINE_OFFSET: i32 = 21;

/// Resolution of the allocation interpolation.
const ALLOC_STEPS: i32 = 6;

use crate::mode::MAX_LM;

/// Map a pseudo-pulse index to a pulse count: the first eight are exact, then resolution halves
/// with every doubling.
#[inline]
pub fn get_pulses(i: usize) -> usize {
    if i < 8 {
        i
    }
    else {
        (8 + (i & 7)) << ((i >> 3) - 1)
    }
}

/// Pulse count/bit cost lookup for every distinct band size of the mode.
pub struct PulseCache {
    /// Entry offset per `(LM + 1, band)` cell; -1 marks sizes that collapse to nothing.
    index: Vec<i16>,
    /// Concatenated entries: a length byte, then the 1/8-bit cost (minus one) per pseudo-pulse.
    bits: Vec<u8>,
}

impl PulseCache {
    /// Build the cache by scanning every band size reachable at any block size, including the
    /// half-sizes produced by band splitting (the `lm = -1` row).
    pub fn new() -> PulseCache {
        let rows = MAX_LM + 2;

        let mut index = vec![-1i16; rows * NB_BANDS];
        let mut entries: Vec<(usize, usize, usize)> = Vec::new();
        let mut curr = 0usize;

        for i in 0..rows {
            for j in 0..NB_BANDS {
                let n = (((E_BANDS[j + 1] - E_BANDS[j]) as usize) << i) >> 1;

                // Reuse the entry of any earlier cell with the same size.
                let mut found = None;
                'search: for k in 0..=i {
                    for jj in 0..NB_BANDS {
                        if k == i && jj >= j {
                            break;
                        }
                        let n2 = (((E_BANDS[jj + 1] - E_BANDS[jj]) as usize) << k) >> 1;
                        if n2 == n {
                            found = Some(index[k * NB_BANDS + jj]);
                            break 'search;
                        }
                    }
                }

                if let Some(off) = found {
                    index[i * NB_BANDS + j] = off;
                }
                else if n != 0 {
                    let mut k = 0;
                    while k < MAX_PSEUDO && fits_in32(n, get_pulses(k + 1)) {
                        k += 1;
                    }

                    index[i * NB_BANDS + j] = curr as i16;
                    entries.push((n, k, curr));
                    curr += k + 1;
                }
            }
        }

        let mut bits = vec![0u8; curr];
        let mut tmp = vec![0i32; MAX_PULSES + 1];

        for &(n, k, offset) in &entries {
            get_required_bits(&mut tmp, n, get_pulses(k), BITRES);

            bits[offset] = k as u8;
            for j in 1..=k {
                bits[offset + j] = (tmp[get_pulses(j)] - 1) as u8;
            }
        }

        PulseCache { index, bits }
    }

    fn entry(&self, band: usize, lm: i32) -> &[u8] {
        let row = (lm + 1) as usize;
        let off = self.index[row * NB_BANDS + band];
        debug_assert!(off >= 0);
        &self.bits[off as usize..]
    }

    /// The largest pseudo-pulse count representable in `band` at block size `lm`.
    pub fn max_pseudo(&self, band: usize, lm: i32) -> usize {
        usize::from(self.entry(band, lm)[0])
    }

    /// Find the pseudo-pulse count whose cost is nearest `bits` 1/8 bits.
    pub fn bits2pulses(&self, band: usize, lm: i32, bits: i32) -> usize {
        let cache = self.entry(band, lm);

        let mut lo = 0usize;
        let mut hi = usize::from(cache[0]);
        let bits = bits - 1;

        for _ in 0..LOG_MAX_PSEUDO {
            let mid = (lo + hi + 1) >> 1;
            if i32::from(cache[mid]) >= bits {
                hi = mid;
            }
            else {
                lo = mid;
            }
        }

        let lo_cost = if lo == 0 { -1 } else { i32::from(cache[lo]) };

        if bits - lo_cost <= i32::from(cache[hi]) - bits {
            lo
        }
        else {
            hi
        }
    }

    /// The 1/8-bit cost of `pulses` pseudo-pulses.
    pub fn pulses2bits(&self, band: usize, lm: i32, pulses: usize) -> i32 {
        if pulses == 0 {
            0
        }
        else {
            i32::from(self.entry(band, lm)[pulses]) + 1
        }
    }
}

impl Default for PulseCache {
    fn default() -> Self {
        PulseCache::new()
    }
}

/// Maximum usable 1/8 bits per band for the frame shape, from the normative caps table.
pub fn init_caps(cap: &mut [i32; NB_BANDS], lm: usize, channels: usize) {
    for i in 0..NB_BANDS {
        let n = ((E_BANDS[i + 1] - E_BANDS[i]) as i32) << lm;
        cap[i] = (i32::from(CACHE_CAPS[NB_BANDS * (2 * lm + channels - 1) + i]) + 64)
            * channels as i32
            * n
            >> 2;
    }
}

/// Outputs of the allocator.
pub struct Allocation {
    /// 1/8 bits assigned to PVQ per band.
    pub pulses: [i32; NB_BANDS],
    /// Fine energy bits per band and channel.
    pub fine_bits: [i32; NB_BANDS],
    /// Whether the band is in the first priority class of the final energy pass.
    pub fine_priority: [bool; NB_BANDS],
    /// First band coded with intensity stereo.
    pub intensity: usize,
    /// Whether stereo bands are coded dual rather than mid/side.
    pub dual_stereo: bool,
    /// Bands actually coded; everything at and above this index was skipped.
    pub coded_bands: usize,
    /// 1/8 bits left over for re-balancing inside the band loop.
    pub balance: i32,
}

struct InterpParams<'c> {
    start: usize,
    end: usize,
    skip_start: usize,
    total: i32,
    skip_rsv: i32,
    intensity_rsv: i32,
    dual_stereo_rsv: i32,
    channels: usize,
    lm: usize,
    prev: usize,
    signal_bandwidth: usize,
    cap: &'c [i32; NB_BANDS],
}

/// Distribute the total budget, in 1/8 bits, over the bands.
///
/// Runs identically on both endpoints; the skip flags, intensity band and dual stereo flag are
/// the only symbols exchanged.
#[allow(clippy::too_many_arguments)]
pub fn compute_allocation(
    start: usize,
    end: usize,
    offsets: &[i32; NB_BANDS],
    cap: &[i32; NB_BANDS],
    alloc_trim: i32,
    intensity: usize,
    dual_stereo: bool,
    total: i32,
    channels: usize,
    lm: usize,
    ec: &mut Coder<'_, '_>,
    prev: usize,
    signal_bandwidth: usize,
) -> Allocation {
    let mut total = total.max(0);
    let len = NB_BANDS;
    let mut skip_start = start;

    // Reserve a bit to signal the end of manually skipped bands.
    let skip_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
    total -= skip_rsv;

    // Reserve bits for the intensity and dual stereo parameters.
    let mut intensity_rsv = 0;
    let mut dual_stereo_rsv = 0;

    if channels == 2 {
        intensity_rsv = i32::from(LOG2_FRAC_TABLE[end - start]);
        if intensity_rsv > total {
            intensity_rsv = 0;
        }
        else {
            total -= intensity_rsv;
            dual_stereo_rsv = if total >= 1 << BITRES { 1 << BITRES } else { 0 };
            total -= dual_stereo_rsv;
        }
    }

    let c = channels as i32;
    let mut thresh = [0i32; NB_BANDS];
    let mut trim_offset = [0i32; NB_BANDS];

    for j in start..end {
        let width = (E_BANDS[j + 1] - E_BANDS[j]) as i32;

        // Below this threshold the band is certain to receive no PVQ bits at all.
        thresh[j] = (c << BITRES).max((3 * width << lm << BITRES) >> 4);

        // Tilt of the allocation curve.
        trim_offset[j] = c * width * (alloc_trim - 5 - lm as i32) * (end as i32 - j as i32 - 1)
            * (1 << (lm as i32 + BITRES as i32))
            >> 6;

        // Single-bin bands get less resolution; one coarse value per coefficient serves them.
        if (width << lm) == 1 {
            trim_offset[j] -= c << BITRES;
        }
    }

    // Bisect the quality rows for the largest that fits the budget.
    let mut lo = 1i32;
    let mut hi = NB_ALLOC_VECTORS as i32 - 1;

    while lo <= hi {
        let mut done = false;
        let mut psum = 0;
        let mid = (lo + hi) >> 1;

        for j in (start..end).rev() {
            let width = (E_BANDS[j + 1] - E_BANDS[j]) as i32;
            let mut bitsj = c * width * i32::from(BAND_ALLOCATION[mid as usize][j]) << lm >> 2;

            if bitsj > 0 {
                bitsj = 0.max(bitsj + trim_offset[j]);
            }
            bitsj += offsets[j];

            if bitsj >= thresh[j] || done {
                done = true;
                psum += bitsj.min(cap[j]);
            }
            else if bitsj >= c << BITRES {
                psum += c << BITRES;
            }
        }

        if psum > total {
            hi = mid - 1;
        }
        else {
            lo = mid + 1;
        }
    }

    let hi = lo;
    let lo = lo - 1;

    let mut bits1 = [0i32; NB_BANDS];
    let mut bits2 = [0i32; NB_BANDS];

    for j in start..end {
        let width = (E_BANDS[j + 1] - E_BANDS[j]) as i32;

        let mut bits1j = c * width * i32::from(BAND_ALLOCATION[lo as usize][j]) << lm >> 2;
        let mut bits2j = if hi >= NB_ALLOC_VECTORS as i32 {
            cap[j]
        }
        else {
            c * width * i32::from(BAND_ALLOCATION[hi as usize][j]) << lm >> 2
        };

        if bits1j > 0 {
            bits1j = 0.max(bits1j + trim_offset[j]);
        }
        if bits2j > 0 {
            bits2j = 0.max(bits2j + trim_offset[j]);
        }
        if lo > 0 {
            bits1j += offsets[j];
        }
        bits2j += offsets[j];

        if offsets[j] > 0 {
            skip_start = j;
        }

        bits2j = 0.max(bits2j - bits1j);
        bits1[j] = bits1j;
        bits2[j] = bits2j;
    }

    let params = InterpParams {
        start,
        end,
        skip_start,
        total,
        skip_rsv,
        intensity_rsv,
        dual_stereo_rsv,
        channels,
        lm,
        prev,
        signal_bandwidth,
        cap,
    };

    interp_bits2pulses(&params, &bits1, &bits2, &thresh, intensity, dual_stereo, ec)
}

fn interp_bits2pulses(
    p: &InterpParams<'_>,
    bits1: &[i32; NB_BANDS],
    bits2: &[i32; NB_BANDS],
    thresh: &[i32; NB_BANDS],
    intensity_in: usize,
    dual_stereo_in: bool,
    ec: &mut Coder<'_, '_>,
) -> Allocation {
    let (start, end) = (p.start, p.end);
    let c = p.channels as i32;
    let stereo = p.channels > 1;
    let alloc_floor = c << BITRES;
    let log_m = (p.lm as i32) << BITRES;

    let mut total = p.total;
    let mut intensity_rsv = p.intensity_rsv;
    let mut dual_stereo_rsv = p.dual_stereo_rsv;

    let mut bits = [0i32; NB_BANDS];
    let mut ebits = [0i32; NB_BANDS];
    let mut fine_priority = [false; NB_BANDS];

    // Interpolate between the bracketing quality rows in 1/64 steps.
    let mut lo = 0i32;
    let mut hi = 1i32 << ALLOC_STEPS;

    for _ in 0..ALLOC_STEPS {
        let mid = (lo + hi) >> 1;
        let mut psum = 0;
        let mut done = false;

        for j in (start..end).rev() {
            let tmp = bits1[j] + (mid * bits2[j] >> ALLOC_STEPS);

            if tmp >= thresh[j] || done {
                done = true;
                psum += tmp.min(p.cap[j]);
            }
            else if tmp >= alloc_floor {
                psum += alloc_floor;
            }
        }

        if psum > total {
            hi = mid;
        }
        else {
            lo = mid;
        }
    }

    let mut psum = 0;
    let mut done = false;

    for j in (start..end).rev() {
        let mut tmp = bits1[j] + (lo * bits2[j] >> ALLOC_STEPS);

        if tmp < thresh[j] && !done {
            tmp = if tmp >= alloc_floor { alloc_floor } else { 0 };
        }
        else {
            done = true;
        }

        let tmp = tmp.min(p.cap[j]);
        bits[j] = tmp;
        psum += tmp;
    }

    // Decide which bands to skip, working backwards from the end.
    let mut coded_bands = end;

    loop {
        debug_assert!(coded_bands > start);
        let j = coded_bands - 1;

        // Never skip the first band, nor a band boosted by dynalloc: the skip bit would only
        // redistribute bits the stream just said to concentrate here.
        if j <= p.skip_start {
            total += p.skip_rsv;
            break;
        }

        // Left-over bits this band would absorb, including bits reclaimed from bands above.
        let left = total - psum;
        let denom = (E_BANDS[coded_bands] - E_BANDS[start]) as i32;
        let percoeff = left / denom;
        let left = left - denom * percoeff;
        let rem = 0.max(left - (E_BANDS[j] - E_BANDS[start]) as i32);
        let band_width = (E_BANDS[coded_bands] - E_BANDS[j]) as i32;
        let mut band_bits = bits[j] + percoeff * band_width + rem;

        // Only code a skip decision above the threshold; otherwise the skip is forced and no
        // flag is spent on it.
        if band_bits >= thresh[j].max(alloc_floor + (1 << BITRES)) {
            let stop = match ec {
                Coder::Encoder(_) => {
                    // The encoder-side policy is the only non-normative part: any band skipped
                    // here is explicitly signalled. Hysteresis keeps bands from flickering.
                    let depth_threshold = if coded_bands > 17 {
                        if j < p.prev {
                            7
                        }
                        else {
                            9
                        }
                    }
                    else {
                        0
                    };

                    let keep = coded_bands <= start + 2
                        || (band_bits > (depth_threshold * band_width << p.lm << BITRES) >> 4
                            && j <= p.signal_bandwidth);

                    ec.bit_logp(keep, 1)
                }
                Coder::Decoder(_) => ec.bit_logp(false, 1),
            };

            if stop {
                break;
            }

            // A bit was used to skip this band.
            psum += 1 << BITRES;
            band_bits -= 1 << BITRES;
        }

        // Reclaim the bits originally allocated to this band.
        psum -= bits[j] + intensity_rsv;
        if intensity_rsv > 0 {
            intensity_rsv = i32::from(LOG2_FRAC_TABLE[j - start]);
        }
        psum += intensity_rsv;

        if band_bits >= alloc_floor {
            // Enough for a fine energy bit per channel.
            psum += alloc_floor;
            bits[j] = alloc_floor;
        }
        else {
            bits[j] = 0;
        }

        coded_bands -= 1;
    }

    // Code the intensity and dual stereo parameters.
    let intensity = if intensity_rsv > 0 {
        let enc_val = intensity_in.clamp(start, coded_bands);
        start
            + ec.uint((enc_val - start) as u32, (coded_bands + 1 - start) as u32) as usize
    }
    else {
        0
    };

    if intensity <= start {
        total += dual_stereo_rsv;
        dual_stereo_rsv = 0;
    }

    let dual_stereo = if dual_stereo_rsv > 0 { ec.bit_logp(dual_stereo_in, 1) } else { false };

    // Allocate the remaining bits proportionally to band width.
    let left = total - psum;
    let denom = (E_BANDS[coded_bands] - E_BANDS[start]) as i32;
    let percoeff = left / denom;
    let mut left = left - denom * percoeff;

    for j in start..coded_bands {
        bits[j] += percoeff * (E_BANDS[j + 1] - E_BANDS[j]) as i32;
    }
    for j in start..coded_bands {
        let tmp = left.min((E_BANDS[j + 1] - E_BANDS[j]) as i32);
        bits[j] += tmp;
        left -= tmp;
    }

    // Split each band's share between fine energy and PVQ.
    let mut balance = 0i32;

    for j in start..coded_bands {
        debug_assert!(bits[j] >= 0);

        let n0 = (E_BANDS[j + 1] - E_BANDS[j]) as i32;
        let n = n0 << p.lm;
        let bit = bits[j] + balance;
        let mut excess = 0;

        if n > 1 {
            excess = 0.max(bit - p.cap[j]);
            bits[j] = bit - excess;

            // Compensate for the extra degree of freedom of mid/side stereo.
            let den = c * n
                + if p.channels == 2 && n > 2 && !dual_stereo && j < intensity { 1 } else { 0 };

            let nclogn = den * (i32::from(LOG_N[j]) + log_m);

            // Offset the fine bits by log2(N)/2 + FINE_OFFSET relative to their fair share.
            let mut offset = (nclogn >> 1) - den * FINE_OFFSET;

            // N=2 is the only point that doesn't match the curve.
            if n == 2 {
                offset += den << BITRES >> 2;
            }

            // Bias the second and third fine energy bit thresholds.
            if bits[j] + offset < (den * 2) << BITRES {
                offset += nclogn >> 2;
            }
            else if bits[j] + offset < (den * 3) << BITRES {
                offset += nclogn >> 3;
            }

            // Divide with rounding.
            ebits[j] = 0.max(bits[j] + offset + (den << (BITRES - 1)));
            ebits[j] = (ebits[j] / den) >> BITRES;

            // Make sure not to bust.
            if c * ebits[j] > (bits[j] >> BITRES) {
                ebits[j] = bits[j] >> (stereo as i32) >> BITRES;
            }

            // More is useless: about as far as the envelope resolution can matter.
            ebits[j] = ebits[j].min(MAX_FINE_BITS);

            // A rounded-down or capped band is a candidate for the final fine energy pass.
            fine_priority[j] = ebits[j] * (den << BITRES) >= bits[j] + offset;

            // Remove the fine bits; the remainder goes to PVQ.
            bits[j] -= c * ebits[j] << BITRES;
            debug_assert!(bits[j] >= 0);
        }
        else {
            // For N=1, everything beyond a single sign bit per channel is fine energy.
            excess = 0.max(bit - (c << BITRES));
            bits[j] = bit - excess;
            ebits[j] = 0;
            fine_priority[j] = true;
        }

        // Fine energy can't use the in-loop re-balancing; rebalance it here instead.
        if excess > 0 {
            let extra_fine = (excess >> (stereo as i32 + BITRES as i32))
                .min(MAX_FINE_BITS - ebits[j]);
            ebits[j] += extra_fine;

            let extra_bits = extra_fine * c << BITRES;
            fine_priority[j] = extra_bits >= excess - balance;

            excess -= extra_bits;
        }
        balance = excess;

        debug_assert!(ebits[j] >= 0);
    }

    // The skipped bands use all their bits for fine energy.
    for j in coded_bands..end {
        ebits[j] = bits[j] >> (stereo as i32) >> BITRES;
        debug_assert!(c * ebits[j] << BITRES == bits[j]);
        bits[j] = 0;
        fine_priority[j] = ebits[j] < 1;
    }

    Allocation {
        pulses: bits,
        fine_bits: ebits,
        fine_priority,
        intensity,
        dual_stereo,
        coded_bands,
        balance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cwrs::log2_frac;
    use crate::entropy::{RangeDecoder, RangeEncoder};

    #[test]
    fn verify_pulse_bound_consistency() {
        // The last cached pseudo-pulse index prices exactly the global pulse ceiling, so a
        // codeword beyond MAX_PULSES can never be allocated.
        assert_eq!(get_pulses(MAX_PSEUDO), MAX_PULSES);
    }

    #[test]
    fn verify_get_pulses() {
        for i in 0..8 {
            assert_eq!(get_pulses(i), i);
        }
        assert_eq!(get_pulses(8), 8);
        assert_eq!(get_pulses(15), 15);
        assert_eq!(get_pulses(16), 16);
        assert_eq!(get_pulses(17), 18);
        assert_eq!(get_pulses(24), 32);
        assert_eq!(get_pulses(39), 120);
    }

    #[test]
    fn verify_log2_frac_table_consistency() {
        // The static table is the fractional log2 of 1..24, rounded up.
        for (i, &v) in LOG2_FRAC_TABLE.iter().enumerate() {
            assert_eq!(i32::from(v), log2_frac(i as u32 + 1, BITRES));
        }
    }

    #[test]
    fn verify_pulse_cache_round_trips() {
        let cache = PulseCache::new();

        for band in 0..NB_BANDS {
            for lm in -1i32..=3 {
                let n = (((E_BANDS[band + 1] - E_BANDS[band]) as usize) << (lm + 1)) >> 1;
                if n == 0 {
                    continue;
                }

                let max = cache.max_pseudo(band, lm);
                assert!(max > 0);

                let mut last_cost = 0;
                for p in 1..=max {
                    let cost = cache.pulses2bits(band, lm, p);
                    assert!(cost > last_cost, "bit cost must grow with pulses");
                    last_cost = cost;

                    // Searching for that exact cost returns the same pulse count.
                    assert_eq!(cache.bits2pulses(band, lm, cost), p);
                }
            }
        }
    }

    #[test]
    fn verify_caps_scale() {
        let mut cap = [0i32; NB_BANDS];
        init_caps(&mut cap, 3, 1);

        // A 20 ms mono frame: band 0 has one bin per short block.
        assert_eq!(cap[0], (193 + 64) * 8 >> 2);
        assert!(cap.iter().all(|&c| c > 0));
    }

    fn run_allocation(total: i32, channels: usize, lm: usize) -> (Allocation, Allocation) {
        let offsets = [0i32; NB_BANDS];
        let mut cap = [0i32; NB_BANDS];
        init_caps(&mut cap, lm, channels);

        let mut buf = vec![0u8; 256];

        let mut enc = RangeEncoder::new(&mut buf);
        let alloc_enc = {
            let mut ec = Coder::Encoder(&mut enc);
            compute_allocation(
                0,
                NB_BANDS,
                &offsets,
                &cap,
                5,
                NB_BANDS,
                false,
                total,
                channels,
                lm,
                &mut ec,
                NB_BANDS,
                NB_BANDS,
            )
        };
        enc.done();

        let mut dec = RangeDecoder::new(&buf);
        let alloc_dec = {
            let mut ec = Coder::Decoder(&mut dec);
            compute_allocation(
                0,
                NB_BANDS,
                &offsets,
                &cap,
                5,
                NB_BANDS,
                false,
                total,
                channels,
                lm,
                &mut ec,
                NB_BANDS,
                NB_BANDS,
            )
        };

        (alloc_enc, alloc_dec)
    }

    #[test]
    fn verify_allocation_endpoints_agree() {
        for &(total, channels, lm) in
            &[(1000i32, 1usize, 3usize), (5000, 2, 3), (300, 1, 0), (12000, 2, 2), (64, 1, 1)]
        {
            let (e, d) = run_allocation(total, channels, lm);

            assert_eq!(e.pulses, d.pulses);
            assert_eq!(e.fine_bits, d.fine_bits);
            assert_eq!(e.coded_bands, d.coded_bands);
            assert_eq!(e.intensity, d.intensity);
            assert_eq!(e.dual_stereo, d.dual_stereo);
            assert_eq!(e.balance, d.balance);
        }
    }

    #[test]
    fn verify_allocation_respects_budget() {
        for &total in &[200i32, 1000, 4000, 16000] {
            let (alloc, _) = run_allocation(total, 1, 3);

            let spent: i32 = alloc.pulses[..alloc.coded_bands].iter().sum::<i32>()
                + alloc.fine_bits.iter().map(|&e| e << BITRES).sum::<i32>();

            assert!(spent <= total, "allocated {} of {} eighth-bits", spent, total);
        }
    }
}
