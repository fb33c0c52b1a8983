// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Binary logging runtime tuned for latency-sensitive callers. A log call
//! stages a compact record (site id, cycle-counter timestamp, raw argument
//! bytes) into a per-thread lock-free ring and returns; a background thread
//! round-robins the rings, variable-length-packs the records, and writes
//! fixed-size blocks to the log file through a double-buffered writer. All
//! formatting happens offline in `libdd-binlog-decoder`.
//!
//! ```no_run
//! use libdd_binlog::{ArgSlot, Config, LogArg, LogLevel, Runtime};
//!
//! # fn main() -> anyhow::Result<()> {
//! let runtime = Runtime::new(Config::default())?;
//! let id = runtime.register_site(
//!     LogLevel::Notice,
//!     "demo.rs",
//!     10,
//!     "processed %d requests in %f ms",
//!     vec![ArgSlot::I32, ArgSlot::F64],
//! );
//! let mut producer = runtime.producer();
//! producer.log(id, &[LogArg::I32(128), LogArg::F64(0.37)]);
//! runtime.sync();
//! # Ok(())
//! # }
//! ```
//!
//! The free functions at the crate root drive a process-wide runtime with
//! one staging ring per calling thread; [`initialize`] must run before any
//! of them do anything.

pub mod aligned;
pub mod args;
pub mod config;
pub mod cycles;
pub mod encoder;
pub mod registry;
pub mod staging;

mod compressor;
mod runtime;

pub use aligned::AlignedBuf;
pub use args::{ArgSlot, LogArg, LogId};
pub use config::Config;
pub use registry::{Codec, StaticLogInfo};
pub use runtime::Runtime;
pub use staging::Producer;

use std::cell::RefCell;
use std::path::Path;
use std::sync::OnceLock;

/// Severity of a log invocation site. Higher values are more verbose; a
/// record is kept when its level does not exceed the runtime's current
/// level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    /// Turns all logging off when used as the runtime level.
    Silent = 0,
    Error = 1,
    Warning = 2,
    Notice = 3,
    Debug = 4,
}

impl LogLevel {
    /// Clamps an arbitrary byte into the valid level range.
    pub fn from_severity(raw: u8) -> LogLevel {
        match raw {
            0 => LogLevel::Silent,
            1 => LogLevel::Error,
            2 => LogLevel::Warning,
            3 => LogLevel::Notice,
            _ => LogLevel::Debug,
        }
    }
}

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

thread_local! {
    static PRODUCER: RefCell<Option<Producer>> = const { RefCell::new(None) };
}

/// Builds the process-wide runtime. Returns the existing one when called
/// again; the config of later calls is ignored.
pub fn initialize(config: Config) -> anyhow::Result<&'static Runtime> {
    if let Some(runtime) = RUNTIME.get() {
        return Ok(runtime);
    }
    let runtime = Runtime::new(config)?;
    Ok(RUNTIME.get_or_init(|| runtime))
}

/// The process-wide runtime, if [`initialize`] has run.
pub fn instance() -> Option<&'static Runtime> {
    RUNTIME.get()
}

/// Ensures the calling thread's staging buffer exists so the first log call
/// does not pay for its construction.
pub fn preallocate() {
    let Some(runtime) = instance() else { return };
    PRODUCER.with(|slot| {
        slot.borrow_mut().get_or_insert_with(|| runtime.producer());
    });
}

/// Stages one record on the calling thread's ring. `id` must come from
/// [`register_site`]; records above the runtime's current level are
/// dropped here, before any buffer work.
pub fn log(severity: LogLevel, id: LogId, log_args: &[LogArg<'_>]) {
    let Some(runtime) = instance() else { return };
    if severity > runtime.log_level() {
        return;
    }
    PRODUCER.with(|slot| {
        let mut slot = slot.borrow_mut();
        let producer = slot.get_or_insert_with(|| runtime.producer());
        producer.log(id, log_args);
    });
}

/// Registers a log invocation site with the process-wide runtime. `None`
/// before [`initialize`].
pub fn register_site(
    severity: LogLevel,
    filename: &str,
    line: u32,
    format: &str,
    slots: Vec<ArgSlot>,
) -> Option<LogId> {
    instance().map(|runtime| runtime.register_site(severity, filename, line, format, slots))
}

/// Blocks until everything staged before this call is on disk.
pub fn sync() {
    if let Some(runtime) = instance() {
        runtime.sync();
    }
}

/// Rotates the process-wide runtime onto a new log file.
pub fn set_log_file(path: &Path) -> anyhow::Result<()> {
    match instance() {
        Some(runtime) => runtime.set_log_file(path),
        None => anyhow::bail!("logging runtime is not initialized"),
    }
}

/// Sets the minimum severity the process-wide runtime keeps.
pub fn set_log_level(level: LogLevel) {
    if let Some(runtime) = instance() {
        runtime.set_log_level(level);
    }
}

/// Human-readable counters of the process-wide runtime.
pub fn stats() -> Option<String> {
    instance().map(Runtime::stats)
}

/// Human-readable distributions of the process-wide runtime.
pub fn histograms() -> Option<String> {
    instance().map(Runtime::histograms)
}
