// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A pure Rust CELT encoder and decoder.
//!
//! CELT is the low-latency transform layer of the Opus codec (RFC 6716 section 4.3): a lapped
//! MDCT codec that transmits a coarse per-band energy envelope plus the unit-norm shape of each
//! band quantized against a pyramid codebook, all wrapped in a shared range coder. This crate
//! implements the 48 kHz float path for frames of 2.5, 5, 10 and 20 ms, mono or stereo.
//!
//! The packet format produced here is the raw CELT frame: container framing (Ogg, the Opus TOC
//! byte, multistream packing) and the SILK/hybrid layers live above this crate.
//!
//! ```no_run
//! use toccata_codec_celt::{Decoder, Encoder, EncoderOptions};
//!
//! let mut encoder = Encoder::try_new(EncoderOptions {
//!     channels: 1,
//!     frame_size: 960,
//!     bitrate: 64000,
//!     ..Default::default()
//! })?;
//! let mut decoder = Decoder::try_new(1)?;
//!
//! let pcm = vec![0.0f32; 960];
//! let mut packet = vec![0u8; 160];
//! let len = encoder.encode(&pcm, &mut packet)?;
//!
//! let mut out = vec![0.0f32; 960];
//! decoder.decode(Some(&packet[..len]), 960, &mut out)?;
//! # Ok::<(), toccata_core::errors::Error>(())
//! ```

#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]
// The following lints are allowed in all Toccata crates. Please see the workspace Cargo.toml for
// their justification.
#![allow(clippy::comparison_chain)]
#![allow(clippy::excessive_precision)]
#![allow(clippy::identity_op)]
#![allow(clippy::manual_range_contains)]
#![allow(clippy::needless_range_loop)]

mod bands;
mod celt;
mod cwrs;
mod decoder;
mod encoder;
mod energy;
mod entropy;
mod laplace;
mod math;
mod mode;
mod pitch;
mod rate;
mod tables;
mod vq;

pub use decoder::Decoder;
pub use encoder::{Encoder, EncoderOptions, MAX_PACKET_BYTES};
pub use mode::{Mode, OVERLAP, SAMPLE_RATE};

pub use toccata_core::errors;
