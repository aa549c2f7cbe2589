// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end encode/decode scenarios.
//!
//! The decoded signal lags the input by the window overlap (120 samples); the comparisons below
//! align for it explicitly.

use toccata_codec_celt::{Decoder, Encoder, EncoderOptions, OVERLAP};

const FRAME: usize = 960;

/// Encode and decode a whole stream; returns the packet sizes and the decoded samples.
fn run_codec(
    opts: EncoderOptions,
    pcm: &[f32],
    max_packet: usize,
) -> (Vec<usize>, Vec<f32>) {
    let channels = opts.channels;
    let frame = opts.frame_size;

    let mut encoder = Encoder::try_new(opts).expect("encoder options must be accepted");
    let mut decoder = Decoder::try_new(channels).expect("decoder must construct");

    let mut packet = vec![0u8; max_packet];
    let mut sizes = Vec::new();
    let mut decoded = Vec::new();

    let samples_per_frame = channels * frame;

    for chunk in pcm.chunks_exact(samples_per_frame) {
        let len = encoder.encode(chunk, &mut packet).expect("frame must encode");
        assert!(len > 0);
        sizes.push(len);

        let mut out = vec![0.0f32; samples_per_frame];
        decoder.decode(Some(&packet[..len]), frame, &mut out).expect("frame must decode");

        // The entropy coders of the two endpoints must track bit-exactly.
        assert_eq!(
            encoder.final_range(),
            decoder.final_range(),
            "encoder/decoder range mismatch: the bitstream desynchronized"
        );

        decoded.extend_from_slice(&out);
    }

    (sizes, decoded)
}

fn sine(len: usize, freq: f32, amplitude: f32) -> Vec<f32> {
    (0..len)
        .map(|i| amplitude * (2.0 * std::f32::consts::PI * freq * i as f32 / 48000.0).sin())
        .collect()
}

/// Signal-to-noise ratio of `decoded` against `reference` delayed by `lag`, in dB.
fn snr_at_lag(reference: &[f32], decoded: &[f32], lag: usize, from: usize, to: usize) -> f64 {
    let mut sig = 0f64;
    let mut err = 0f64;

    for i in from..to {
        let r = f64::from(reference[i]);
        let d = f64::from(decoded[i + lag]);
        sig += r * r;
        err += (r - d) * (r - d);
    }

    10.0 * (sig / err.max(1e-30)).log10()
}

#[test]
fn silence_round_trip() {
    let pcm = vec![0.0f32; 10 * FRAME];

    let opts = EncoderOptions { channels: 1, bitrate: 64000, vbr: true, ..Default::default() };
    let (sizes, decoded) = run_codec(opts, &pcm, 200);

    // Silence compresses to the minimum packet, and decodes back to digital silence.
    for &s in &sizes {
        assert!(s <= 3, "silence frame used {} bytes", s);
    }
    for &v in &decoded {
        assert!(v.abs() <= 1e-9, "silence decoded to {}", v);
    }
}

#[test]
fn tone_round_trip() {
    let n_frames = 10;
    let pcm = sine(n_frames * FRAME, 1000.0, 0.5);

    let opts = EncoderOptions { channels: 1, bitrate: 64000, ..Default::default() };
    let (_, decoded) = run_codec(opts, &pcm, 160);

    // Skip the first two frames of startup, compare the rest at the overlap lag.
    let from = 2 * FRAME;
    let to = (n_frames - 1) * FRAME;

    let mut num = 0f64;
    let mut den_r = 0f64;
    let mut den_d = 0f64;

    for i in from..to {
        let r = f64::from(pcm[i]);
        let d = f64::from(decoded[i + OVERLAP]);
        num += r * d;
        den_r += r * r;
        den_d += d * d;
    }

    let corr = num / (den_r * den_d).sqrt().max(1e-30);
    assert!(corr >= 0.95, "tone correlation {} too low", corr);
}

#[test]
fn white_noise_stereo_round_trip() {
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};

    let mut rng = SmallRng::seed_from_u64(0x0123);

    let n_frames = 8;
    let pcm: Vec<f32> =
        (0..2 * n_frames * FRAME).map(|_| 2.0 * rng.random::<f32>() - 1.0).collect();

    let opts =
        EncoderOptions { channels: 2, bitrate: 96000, frame_size: FRAME, ..Default::default() };
    let (_, decoded) = run_codec(opts, &pcm, 2 * 320);

    for &v in &decoded {
        assert!(v.is_finite(), "non-finite sample in decoded noise");
    }

    // SNR over the stationary middle, per channel, aligned for the codec delay.
    for ch in 0..2usize {
        let reference: Vec<f32> = pcm.iter().skip(ch).step_by(2).copied().collect();
        let output: Vec<f32> = decoded.iter().skip(ch).step_by(2).copied().collect();

        let snr = snr_at_lag(&reference, &output, OVERLAP, 2 * FRAME, (n_frames - 1) * FRAME);
        assert!(snr >= 6.0, "channel {} snr {:.2} dB below target", ch, snr);
    }
}

#[test]
fn transient_impulse_round_trip() {
    let n_frames = 4;
    let mut pcm = vec![0.0f32; n_frames * FRAME];

    // Quiet noise floor so the frame isn't coded as silence, plus one sharp impulse.
    for (i, v) in pcm.iter_mut().enumerate() {
        *v = 1e-3 * ((i * 2654435761) as f32 / u32::MAX as f32 - 0.5);
    }
    let impulse_pos = 2 * FRAME + 200;
    pcm[impulse_pos] = 0.9;

    let opts = EncoderOptions { channels: 1, bitrate: 96000, ..Default::default() };
    let (_, decoded) = run_codec(opts, &pcm, 240);

    // Find the decoded peak.
    let (peak_pos, peak_val) = decoded
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.abs().partial_cmp(&b.1.abs()).unwrap())
        .unwrap();

    let expected = impulse_pos + OVERLAP;
    assert!(
        (peak_pos as i32 - expected as i32).abs() <= 2,
        "impulse at {} decoded at {} (expected near {})",
        impulse_pos,
        peak_pos,
        expected
    );

    // Peak amplitude within 3 dB.
    let ratio = 20.0 * (peak_val.abs() / 0.9).log10();
    assert!(ratio.abs() <= 3.0, "impulse peak off by {:.2} dB", ratio);
}

#[test]
fn bitrate_sweep_improves_quality() {
    let n_frames = 8;

    // A mix of tones makes quality differences visible at every rate.
    let pcm: Vec<f32> = (0..n_frames * FRAME)
        .map(|i| {
            let t = i as f32 / 48000.0;
            0.3 * (2.0 * std::f32::consts::PI * 440.0 * t).sin()
                + 0.2 * (2.0 * std::f32::consts::PI * 1370.0 * t).sin()
                + 0.1 * (2.0 * std::f32::consts::PI * 3700.0 * t).sin()
        })
        .collect();

    let mut last_snr = f64::NEG_INFINITY;

    for &bitrate in &[32000i32, 64000, 128000] {
        let opts = EncoderOptions { channels: 1, bitrate, ..Default::default() };
        let (sizes, decoded) = run_codec(opts, &pcm, 400);

        // CBR: every packet hits the byte budget for the rate.
        let expected_bytes = (bitrate as usize * FRAME) / (48000 * 8);
        for &s in &sizes {
            assert!(
                (s as i32 - expected_bytes as i32).abs() <= 1,
                "cbr packet of {} bytes at {} bps",
                s,
                bitrate
            );
        }

        let snr = snr_at_lag(&pcm, &decoded, OVERLAP, 2 * FRAME, (n_frames - 1) * FRAME);
        assert!(
            snr >= last_snr - 0.5,
            "snr {:.2} dB at {} bps regressed from {:.2}",
            snr,
            bitrate,
            last_snr
        );
        last_snr = snr.max(last_snr);
    }

    assert!(last_snr >= 12.0, "peak snr {:.2} dB too low", last_snr);
}

#[test]
fn stationary_input_reaches_steady_state() {
    // 100 identical frames: the energy envelope prediction settles and the decoded frames
    // become stationary.
    let n_frames = 100;
    let period_aligned = sine(FRAME, 1000.0, 0.4); // 20 full cycles per frame
    let mut pcm = Vec::new();
    for _ in 0..n_frames {
        pcm.extend_from_slice(&period_aligned);
    }

    let opts = EncoderOptions { channels: 1, bitrate: 64000, ..Default::default() };
    let (_, decoded) = run_codec(opts, &pcm, 160);

    // Frame RMS in the second half of the stream varies by well under 10%.
    let rms: Vec<f64> = decoded
        .chunks_exact(FRAME)
        .map(|f| (f.iter().map(|&v| f64::from(v) * f64::from(v)).sum::<f64>() / f64::from(FRAME as u32)).sqrt())
        .collect();

    let tail = &rms[n_frames / 2..n_frames - 1];
    let mean: f64 = tail.iter().sum::<f64>() / tail.len() as f64;

    for &r in tail {
        assert!((r - mean).abs() <= 0.1 * mean, "rms {} deviates from steady {}", r, mean);
    }
}

#[test]
fn all_frame_sizes_round_trip() {
    for &frame in &[120usize, 240, 480, 960] {
        let pcm = sine(8 * frame, 500.0, 0.4);

        let opts = EncoderOptions { channels: 1, bitrate: 64000, frame_size: frame, ..Default::default() };
        let (_, decoded) = run_codec(opts, &pcm, 400);

        assert_eq!(decoded.len(), pcm.len());
        for &v in &decoded {
            assert!(v.is_finite());
        }

        // Past startup, the signal comes through.
        let snr = snr_at_lag(&pcm, &decoded, OVERLAP, 3 * frame, 7 * frame);
        assert!(snr > 0.0, "no signal through at frame size {} ({:.2} dB)", frame, snr);
    }
}

#[test]
fn vbr_spends_fewer_bits_on_easy_signals() {
    let easy = sine(8 * FRAME, 300.0, 0.1);

    let mut hard = vec![0.0f32; 8 * FRAME];
    for (i, v) in hard.iter_mut().enumerate() {
        // A dense multitone is expensive to code.
        let t = i as f32 / 48000.0;
        for k in 1..12 {
            *v += 0.05 * (2.0 * std::f32::consts::PI * (300.0 * k as f32 + 17.0) * t).sin();
        }
    }

    let opts =
        EncoderOptions { channels: 1, bitrate: 64000, vbr: true, ..Default::default() };
    let (easy_sizes, _) = run_codec(opts.clone(), &easy, 400);
    let (hard_sizes, _) = run_codec(opts, &hard, 400);

    let easy_total: usize = easy_sizes.iter().sum();
    let hard_total: usize = hard_sizes.iter().sum();

    assert!(
        easy_total < hard_total,
        "vbr used {} bytes on the easy signal but {} on the hard one",
        easy_total,
        hard_total
    );
}

#[test]
fn packet_loss_concealment_keeps_running() {
    let pcm = sine(8 * FRAME, 440.0, 0.4);

    let mut encoder =
        Encoder::try_new(EncoderOptions { channels: 1, bitrate: 64000, ..Default::default() })
            .unwrap();
    let mut decoder = Decoder::try_new(1).unwrap();

    let mut packet = vec![0u8; 200];
    let mut out = vec![0.0f32; FRAME];

    for (k, chunk) in pcm.chunks_exact(FRAME).enumerate() {
        let len = encoder.encode(chunk, &mut packet).unwrap();

        // Drop every third packet.
        if k % 3 == 2 {
            decoder.decode(None, FRAME, &mut out).unwrap();
        }
        else {
            decoder.decode(Some(&packet[..len]), FRAME, &mut out).unwrap();
        }

        for &v in &out {
            assert!(v.is_finite());
            assert!(v.abs() <= 4.0, "concealment blew up: {}", v);
        }
    }
}

#[test]
fn undersized_buffer_is_rejected_and_recoverable() {
    let pcm = sine(2 * FRAME, 440.0, 0.4);

    let mut encoder =
        Encoder::try_new(EncoderOptions { channels: 1, bitrate: 64000, ..Default::default() })
            .unwrap();

    let mut tiny = [0u8; 1];
    assert!(encoder.encode(&pcm[..FRAME], &mut tiny).is_err());

    // The failed attempt must not have corrupted the stream state.
    let mut packet = vec![0u8; 200];
    let len = encoder.encode(&pcm[..FRAME], &mut packet).unwrap();
    assert!(len > 0);
}
