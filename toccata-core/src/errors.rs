// Toccata
// Copyright (c) 2026 The Project Toccata Developers.
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `errors` module defines the common error type.

use std::fmt;
use std::result;

/// `Error` provides an enumeration of all possible errors reported by Toccata.
#[derive(Debug)]
pub enum Error {
    /// A parameter passed by the caller is outside the permitted set (frame size, channel count,
    /// buffer length mismatch). The operation performed no work and mutated no state.
    BadArgument(&'static str),
    /// The encoder ran out of output bytes mid-frame. The frame was abandoned and cross-frame
    /// state was not committed; the caller may retry with a larger buffer.
    BufferOverflow(&'static str),
    /// The decoder's entropy coder reached the end of the packet while a symbol was incomplete.
    /// The frame still produced best-effort audio.
    BitstreamExhausted(&'static str),
    /// A decoded flag implied an impossible configuration. The frame still produced best-effort
    /// audio; the error is surfaced for telemetry.
    BitstreamInconsistent(&'static str),
    /// A default limit was reached while encoding or decoding. Limits prevent
    /// denial-of-service conditions from malicious streams.
    LimitError(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::BadArgument(msg) => {
                write!(f, "bad argument: {}", msg)
            }
            Error::BufferOverflow(msg) => {
                write!(f, "output buffer too small: {}", msg)
            }
            Error::BitstreamExhausted(msg) => {
                write!(f, "bitstream exhausted: {}", msg)
            }
            Error::BitstreamInconsistent(msg) => {
                write!(f, "malformed bitstream: {}", msg)
            }
            Error::LimitError(constraint) => {
                write!(f, "limit reached: {}", constraint)
            }
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = result::Result<T, Error>;

/// Convenience function to create a bad argument error.
pub fn bad_argument_error<T>(msg: &'static str) -> Result<T> {
    Err(Error::BadArgument(msg))
}

/// Convenience function to create a buffer overflow error.
pub fn buffer_overflow_error<T>(msg: &'static str) -> Result<T> {
    Err(Error::BufferOverflow(msg))
}

/// Convenience function to create a bitstream exhausted error.
pub fn bitstream_exhausted_error<T>(msg: &'static str) -> Result<T> {
    Err(Error::BitstreamExhausted(msg))
}

/// Convenience function to create a bitstream inconsistency error.
pub fn bitstream_inconsistent_error<T>(msg: &'static str) -> Result<T> {
    Err(Error::BitstreamInconsistent(msg))
}

/// Convenience function to create a limit error.
pub fn limit_error<T>(constraint: &'static str) -> Result<T> {
    Err(Error::LimitError(constraint))
}
