// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Runtime configuration. The defaults mirror the sizes the system was
//! tuned with: 1 MiB staging rings, a 64 MiB double buffer, and microsecond
//! idle polls.

use anyhow::ensure;
use std::path::PathBuf;
use std::time::Duration;

/// Extra open(2) flags applied to the log file on top of
/// append/read-write/create.
#[cfg(target_os = "linux")]
pub const DEFAULT_FILE_FLAGS: i32 = libc::O_NOATIME | libc::O_DSYNC;
#[cfg(not(target_os = "linux"))]
pub const DEFAULT_FILE_FLAGS: i32 = 0;

/// Where the log goes when the caller does not pick a file.
pub const DEFAULT_LOG_FILE: &str = "./compressedLog";

#[derive(Clone, Debug)]
pub struct Config {
    /// Byte size of each per-thread staging ring. Large enough to ride out
    /// bursts; a single record may use at most half of it.
    pub staging_buffer_size: usize,

    /// Byte size of each half of the output double buffer. Must be at
    /// least `staging_buffer_size` so one full ring always fits.
    pub output_buffer_size: usize,

    /// Most bytes one encode call consumes from a staging ring before
    /// space is released back to the producer. Lower values block
    /// producers more often but for shorter stretches.
    pub release_threshold: usize,

    /// How long the compression thread sleeps when it finds no work.
    pub poll_interval_no_work: Duration,

    /// How long the compression thread sleeps between write-completion
    /// polls while an I/O is in flight.
    pub poll_interval_during_io: Duration,

    /// Extra open(2) flags for the log file. When `O_DIRECT` is included,
    /// writes are zero-padded to 512-byte multiples.
    pub extra_file_flags: i32,

    /// Initial log file path.
    pub log_file: PathBuf,

    /// Embed the full site dictionary in each file-opening checkpoint (the
    /// generated-codec integration mode). Off by default: metadata then
    /// travels as dictionary fragments as sites register at runtime.
    pub full_dictionary_in_checkpoint: bool,

    /// Reset a full staging ring instead of blocking the producer. Only
    /// for benchmarking; the dropped bytes corrupt the record stream for
    /// the consumer.
    pub discard_on_full: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            staging_buffer_size: 1 << 20,
            output_buffer_size: 1 << 26,
            release_threshold: 1 << 19,
            poll_interval_no_work: Duration::from_micros(1),
            poll_interval_during_io: Duration::from_micros(1),
            extra_file_flags: DEFAULT_FILE_FLAGS,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            full_dictionary_in_checkpoint: false,
            discard_on_full: false,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(
            self.staging_buffer_size >= 4096,
            "staging buffer must be at least 4 KiB, got {}",
            self.staging_buffer_size
        );
        ensure!(
            self.output_buffer_size >= self.staging_buffer_size,
            "output buffer ({}) must be at least the staging buffer size ({})",
            self.output_buffer_size,
            self.staging_buffer_size
        );
        ensure!(
            self.output_buffer_size % 512 == 0,
            "output buffer ({}) must be a multiple of the 512-byte write alignment",
            self.output_buffer_size
        );
        ensure!(
            self.release_threshold >= self.staging_buffer_size / 2
                && self.release_threshold <= self.staging_buffer_size,
            "release threshold ({}) must be between half the staging buffer \
             size and the staging buffer size ({}); a maximal record has to \
             fit in one encode hop",
            self.release_threshold,
            self.staging_buffer_size
        );
        Ok(())
    }

    /// Largest record admitted to a staging ring; the bound comes from the
    /// ring's wrap protocol.
    pub fn max_record_size(&self) -> usize {
        self.staging_buffer_size / 2
    }

    pub fn uses_direct_io(&self) -> bool {
        #[cfg(target_os = "linux")]
        {
            self.extra_file_flags & libc::O_DIRECT != 0
        }
        #[cfg(not(target_os = "linux"))]
        {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn output_must_cover_staging() {
        let config = Config {
            staging_buffer_size: 1 << 20,
            output_buffer_size: 1 << 16,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn release_threshold_bounds() {
        let config = Config {
            release_threshold: (1 << 20) + 1,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
