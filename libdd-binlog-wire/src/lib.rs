// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Byte-level wire format shared by the binlog runtime and the offline
//! decoder. Everything here is little-endian; cross-endian decoding is not
//! supported.
//!
//! A compressed log file is a sequence of self-delimiting framed entries.
//! Every entry begins with a 2-bit tag in the low bits of its first byte:
//!
//! ```reference
//! file        := checkpoint entry*
//! entry       := checkpoint | buffer-extent | dict-fragment | padding
//! checkpoint  := tag(3) rdtsc unix-time cycles-per-sec dict-bytes
//!                dict-total dict-bytes*
//! extent      := tag(2) wrap short nibble length record*
//! record      := tag(1) id-bytes ts-nibble packed-id packed-delta payload
//! dict-frag   := tag(1) byte-len(30) running-total log-info*
//! padding     := 0x00 (any all-zero byte)
//! ```
//!
//! Integer packing is keyed by a 4-bit nibble: values 1-8 give the byte
//! count of a little-endian prefix, values 9-15 mean the stored bytes are
//! the negated value, and 0 stands for a literal zero. Two nibbles share a
//! byte, first in the low four bits. Record payloads place the whole nibble
//! block before the packed values, which is what the [`packer::Nibbler`]
//! cursor walks.

pub mod entry;
pub mod packer;

pub use entry::*;
pub use packer::*;

/// Decoding failures. Encoding into a caller-sized buffer reports only
/// [`WireError::Truncated`]; the rest describe malformed input.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("expected a {expected} entry, found tag {found}")]
    UnexpectedEntry { expected: &'static str, found: u8 },

    #[error("nibble cursor exhausted after {limit} values")]
    NibblesExhausted { limit: usize },

    #[error("string in dictionary entry is not NUL-terminated")]
    UnterminatedString,
}
