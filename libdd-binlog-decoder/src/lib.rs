// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Offline decoder for compressed binlog files. Opening a file reads its
//! checkpoint and dictionary; replay then walks the framed entries and
//! renders each record the way the original printf call would have,
//! either in arrival order ([`Decoder::decompress_unordered`]) or in true
//! chronological order ([`Decoder::decompress_ordered`], which re-sorts
//! within the compressor's bounded reordering window). The iterative
//! [`Decoder::next_log_statement`] hands records back one at a time in a
//! [`LogMessage`] so callers can aggregate over decoded arguments.

pub mod decoder;
pub mod format;
pub mod log_message;

mod fragment;
mod printf;

pub use decoder::{Aggregation, Decoder};
pub use format::{create_micro_code, FormatMetadata, FormatType, PrintFragment};
pub use log_message::{LogMessage, SlotValue};
