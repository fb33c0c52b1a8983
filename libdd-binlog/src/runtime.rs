// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide glue: the runtime owns the site table, the staging-ring
//! registry, the compression thread, and the log file lifecycle.

use crate::aligned::AlignedBuf;
use crate::args::{ArgSlot, LogId};
use crate::compressor;
use crate::config::Config;
use crate::cycles;
use crate::registry::StaticLogInfo;
use crate::staging::{Producer, StagingBuffer, BLOCKED_DIST_BUCKETS};
use crate::LogLevel;
use anyhow::Context;
use parking_lot::{Condvar, Mutex};
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Buckets of the peek-size distribution, each a 5% slice of the staging
/// buffer.
pub(crate) const PEEK_DIST_BUCKETS: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SyncStatus {
    /// No sync in progress (or the last one finished).
    Completed,
    /// A caller asked for a sync; the compressor owes a full scan pass.
    Requested,
    /// The post-request scan pass is running.
    PerformingSecondPass,
    /// Everything is encoded; the last write has to land.
    WaitingOnIo,
}

pub(crate) struct CondState {
    pub sync_status: SyncStatus,
}

pub(crate) struct BufferRegistry {
    pub list: Vec<Arc<StagingBuffer>>,
    pub next_id: u32,
}

pub(crate) struct Stats {
    pub total_bytes_read: AtomicU64,
    pub total_bytes_written: AtomicU64,
    pub pad_bytes_written: AtomicU64,
    pub logs_processed: AtomicU64,
    pub writes_completed: AtomicU64,
    pub write_failures: AtomicU64,
    pub cycles_compressing: AtomicU64,
    pub peek_dist: [AtomicU64; PEEK_DIST_BUCKETS],
}

impl Default for Stats {
    fn default() -> Stats {
        Stats {
            total_bytes_read: AtomicU64::new(0),
            total_bytes_written: AtomicU64::new(0),
            pad_bytes_written: AtomicU64::new(0),
            logs_processed: AtomicU64::new(0),
            writes_completed: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            cycles_compressing: AtomicU64::new(0),
            peek_dist: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

pub(crate) struct Inner {
    pub config: Config,
    /// The site table; the mutex is taken only on registration and
    /// dictionary persistence.
    pub sites: Mutex<Vec<StaticLogInfo>>,
    /// All live staging rings, scanned round-robin by the compressor.
    pub buffers: Mutex<BufferRegistry>,
    /// Index of the first site the compressor has not persisted yet.
    /// Reset on file rotation so the new file gets a full dictionary.
    pub next_site_to_persist: AtomicUsize,
    pub should_exit: AtomicBool,
    pub cond: Mutex<CondState>,
    pub work_added: Condvar,
    pub sync_completed: Condvar,
    pub level: AtomicU8,
    pub stats: Stats,
}

/// The logging runtime. Construction opens the log file and starts the
/// compression thread; drop syncs, drains, and joins it.
pub struct Runtime {
    inner: Arc<Inner>,
    compressor: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(config: Config) -> anyhow::Result<Runtime> {
        config.validate()?;
        let file = open_log_file(&config.log_file, config.extra_file_flags).with_context(|| {
            format!(
                "could not open the log file {:?}; check permissions or pick \
                 a different path with set_log_file",
                config.log_file
            )
        })?;
        let compressing = AlignedBuf::zeroed(config.output_buffer_size)
            .context("could not allocate the output buffers")?;
        let double = AlignedBuf::zeroed(config.output_buffer_size)
            .context("could not allocate the output buffers")?;

        let inner = Arc::new(Inner {
            config,
            sites: Mutex::new(Vec::new()),
            buffers: Mutex::new(BufferRegistry {
                list: Vec::new(),
                next_id: 0,
            }),
            next_site_to_persist: AtomicUsize::new(0),
            should_exit: AtomicBool::new(false),
            cond: Mutex::new(CondState {
                sync_status: SyncStatus::Completed,
            }),
            work_added: Condvar::new(),
            sync_completed: Condvar::new(),
            level: AtomicU8::new(LogLevel::Notice as u8),
            stats: Stats::default(),
        });
        let runtime = Runtime {
            inner,
            compressor: Mutex::new(None),
        };
        runtime.start_compressor(file, (compressing, double))?;
        Ok(runtime)
    }

    fn start_compressor(&self, file: File, buffers: (AlignedBuf, AlignedBuf)) -> anyhow::Result<()> {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("binlog-compressor".into())
            .spawn(move || compressor::compression_thread_main(inner, file, buffers))
            .context("could not spawn the compression thread")?;
        *self.compressor.lock() = Some(handle);
        Ok(())
    }

    fn stop_compressor(&self) {
        {
            let _cond = self.inner.cond.lock();
            self.inner.should_exit.store(true, Ordering::Release);
            self.inner.work_added.notify_all();
        }
        if let Some(handle) = self.compressor.lock().take() {
            let _ = handle.join();
        }
        self.inner.should_exit.store(false, Ordering::Release);
    }

    /// Registers a log invocation site and returns its id. Sites are
    /// expected to call this once and cache the result; the table is
    /// append-only.
    pub fn register_site(
        &self,
        severity: LogLevel,
        filename: &str,
        line: u32,
        format: &str,
        slots: Vec<ArgSlot>,
    ) -> LogId {
        let mut sites = self.inner.sites.lock();
        let id = sites.len() as LogId;
        sites.push(StaticLogInfo::new(severity, filename, line, format, slots));
        id
    }

    /// Builds a staging ring for the calling context and registers it with
    /// the compressor. One ring per thread; the handle is the write
    /// license.
    pub fn producer(&self) -> Producer {
        let mut registry = self.inner.buffers.lock();
        let id = registry.next_id;
        registry.next_id += 1;
        let buffer = Arc::new(StagingBuffer::new(id, self.inner.config.staging_buffer_size));
        registry.list.push(buffer.clone());
        Producer::new(
            buffer,
            self.inner.config.max_record_size(),
            self.inner.config.discard_on_full,
        )
    }

    /// Blocks until every record staged before this call is on disk. The
    /// compressor makes one extra full pass after seeing the request, so
    /// records staged immediately before the call are covered.
    pub fn sync(&self) {
        if self.compressor.lock().is_none() {
            return;
        }
        let mut cond = self.inner.cond.lock();
        cond.sync_status = SyncStatus::Requested;
        self.inner.work_added.notify_all();
        while cond.sync_status != SyncStatus::Completed {
            self.inner.sync_completed.wait(&mut cond);
        }
    }

    /// Rotates onto a new log file: syncs, stops the compressor, swaps the
    /// file, resets the dictionary cursor (the new file opens with a fresh
    /// checkpoint and full dictionary), and restarts.
    pub fn set_log_file(&self, path: &Path) -> anyhow::Result<()> {
        let file = open_log_file(path, self.inner.config.extra_file_flags)
            .with_context(|| format!("could not open the new log file {path:?}"))?;
        self.sync();
        self.stop_compressor();

        self.inner.next_site_to_persist.store(0, Ordering::Relaxed);
        let compressing = AlignedBuf::zeroed(self.inner.config.output_buffer_size)
            .context("could not allocate the output buffers")?;
        let double = AlignedBuf::zeroed(self.inner.config.output_buffer_size)
            .context("could not allocate the output buffers")?;
        self.start_compressor(file, (compressing, double))
    }

    pub fn set_log_level(&self, level: LogLevel) {
        self.inner.level.store(level as u8, Ordering::Relaxed);
    }

    pub fn log_level(&self) -> LogLevel {
        LogLevel::from_severity(self.inner.level.load(Ordering::Relaxed))
    }

    /// Human-readable counters of the runtime so far.
    pub fn stats(&self) -> String {
        let stats = &self.inner.stats;
        let events = stats.logs_processed.load(Ordering::Relaxed);
        let bytes_read = stats.total_bytes_read.load(Ordering::Relaxed);
        let bytes_written = stats.total_bytes_written.load(Ordering::Relaxed);
        let pad_bytes = stats.pad_bytes_written.load(Ordering::Relaxed);
        let writes = stats.writes_completed.load(Ordering::Relaxed);
        let failures = stats.write_failures.load(Ordering::Relaxed);
        let compress_seconds = cycles::to_seconds(stats.cycles_compressing.load(Ordering::Relaxed));

        let mut out = String::new();
        let _ = writeln!(
            out,
            "Wrote {events} events ({:.2} MB) with {:.3} seconds spent compressing",
            bytes_written as f64 / 1.0e6,
            compress_seconds,
        );
        let _ = writeln!(
            out,
            "There were {writes} file flushes ({failures} failed) and {pad_bytes} pad bytes",
        );
        if bytes_written > 0 {
            let _ = writeln!(
                out,
                "The compression ratio was {:.2}x ({bytes_read} bytes in, {bytes_written} bytes out)",
                bytes_read as f64 / bytes_written as f64,
            );
        }
        if events > 0 {
            let _ = writeln!(
                out,
                "On average that's {:.1} bytes/event and {:.2} ns/event compressing",
                bytes_written as f64 / events as f64,
                compress_seconds * 1.0e9 / events as f64,
            );
        }
        out
    }

    /// Distribution summaries: consumer peek sizes and per-ring producer
    /// blocking.
    pub fn histograms(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Distribution of peek() sizes");
        for (i, bucket) in self.inner.stats.peek_dist.iter().enumerate() {
            let _ = writeln!(
                out,
                "\t{:02} - {:02}%: {}",
                i * 100 / PEEK_DIST_BUCKETS,
                (i + 1) * 100 / PEEK_DIST_BUCKETS,
                bucket.load(Ordering::Relaxed)
            );
        }
        let registry = self.inner.buffers.lock();
        for buffer in registry.list.iter() {
            let blocked = buffer.num_times_blocked.load(Ordering::Relaxed);
            let _ = writeln!(
                out,
                "Thread {}:\n\tAllocations   : {}\n\tTimes Blocked : {}",
                buffer.id(),
                buffer.num_allocations.load(Ordering::Relaxed),
                blocked,
            );
            if blocked > 0 {
                let _ = writeln!(
                    out,
                    "\tAvgBlock (ns) : {:.0}\n\tBlock Dist",
                    cycles::to_seconds(buffer.cycles_blocked.load(Ordering::Relaxed)) * 1.0e9
                        / blocked as f64
                );
                debug_assert_eq!(BLOCKED_DIST_BUCKETS, buffer.blocked_dist.len());
                for (i, bucket) in buffer.blocked_dist.iter().enumerate() {
                    let _ = writeln!(
                        out,
                        "\t\t{:4} - {:4} ns: {}",
                        i * 10,
                        (i + 1) * 10,
                        bucket.load(Ordering::Relaxed)
                    );
                }
            }
        }
        out
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.sync();
        self.stop_compressor();
    }
}

fn open_log_file(path: &Path, extra_flags: i32) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.custom_flags(extra_flags);
        options.mode(0o666);
    }
    #[cfg(not(unix))]
    let _ = extra_flags;
    options.open(path)
}
