// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread staging rings. Exactly one producer thread writes records
//! through its [`Producer`] handle and exactly one consumer (the
//! compression thread) drains them, so all cross-thread traffic flows
//! through three positions: the producer position, the consumer position,
//! and the end of recorded space published when the producer wraps.
//!
//! Every comparison on the positions is strict: letting them overlap would
//! make "completely full" indistinguishable from "completely empty", so
//! `producer == consumer` always means empty and one byte of capacity goes
//! unused.

use crate::args::{LogArg, LogId};
use crate::cycles;
use crossbeam_utils::CachePadded;
use libdd_binlog_wire::{RecordHeader, RECORD_HEADER_SIZE};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::error;

/// Buckets of the producer blocked-time histogram, 10ns each.
pub(crate) const BLOCKED_DIST_BUCKETS: usize = 20;

/// The ring itself. Shared between one producer handle and the compression
/// thread via `Arc`; the buffer registry is the owner of record.
pub struct StagingBuffer {
    id: u32,
    storage: Box<[UnsafeCell<u8>]>,

    /// Byte offset of the next record the producer will write. Published
    /// with release ordering by [`Producer::finish_reservation`].
    producer_pos: CachePadded<AtomicUsize>,

    /// One past the last valid byte when the producer has wrapped and the
    /// consumer has not caught up yet. Published before the producer
    /// position rolls back to zero.
    end_of_recorded_space: AtomicUsize,

    /// Byte offset of the next unread byte. Written only by the consumer.
    consumer_pos: CachePadded<AtomicUsize>,

    /// Set by the producer handle's drop; the compression thread frees the
    /// buffer once it also observes it empty.
    should_deallocate: AtomicBool,

    // Producer-side metrics, read by the histogram report.
    pub(crate) num_allocations: AtomicU64,
    pub(crate) num_times_blocked: AtomicU64,
    pub(crate) cycles_blocked: AtomicU64,
    pub(crate) blocked_dist: [AtomicU64; BLOCKED_DIST_BUCKETS],
}

// SAFETY: the storage cells are only written inside a producer reservation
// and only read by the consumer after the matching release store of the
// producer position, per the SPSC discipline documented above.
unsafe impl Send for StagingBuffer {}
unsafe impl Sync for StagingBuffer {}

impl StagingBuffer {
    pub(crate) fn new(id: u32, capacity: usize) -> StagingBuffer {
        StagingBuffer {
            id,
            storage: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            producer_pos: CachePadded::new(AtomicUsize::new(0)),
            end_of_recorded_space: AtomicUsize::new(capacity),
            consumer_pos: CachePadded::new(AtomicUsize::new(0)),
            should_deallocate: AtomicBool::new(false),
            num_allocations: AtomicU64::new(0),
            num_times_blocked: AtomicU64::new(0),
            cycles_blocked: AtomicU64::new(0),
            blocked_dist: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    #[inline]
    fn base_ptr(&self) -> *mut u8 {
        self.storage.as_ptr() as *mut u8
    }

    /// Consumer side: a contiguous readable slice. After the producer has
    /// wrapped, the first peek returns the tail remnant and, once that is
    /// consumed, the next peek rolls over and returns the wrapped prefix.
    pub fn peek(&self) -> &[u8] {
        let cached_producer_pos = self.producer_pos.load(Ordering::Acquire);
        let mut consumer_pos = self.consumer_pos.load(Ordering::Relaxed);

        if cached_producer_pos < consumer_pos {
            let end = self.end_of_recorded_space.load(Ordering::Acquire);
            let available = end.saturating_sub(consumer_pos);
            if available > 0 {
                // SAFETY: [consumer_pos, end) was committed by the
                // producer before it wrapped and will not be rewritten
                // until consumed.
                return unsafe {
                    std::slice::from_raw_parts(self.base_ptr().add(consumer_pos), available)
                };
            }
            // Tail fully consumed: roll over to the wrapped prefix.
            self.consumer_pos.store(0, Ordering::Release);
            consumer_pos = 0;
        }

        let available = cached_producer_pos.saturating_sub(consumer_pos);
        // SAFETY: [consumer_pos, producer_pos) is committed and stable
        // until consumed.
        unsafe { std::slice::from_raw_parts(self.base_ptr().add(consumer_pos), available) }
    }

    /// Consumer side: releases `nbytes` back to the producer. May be less
    /// than the last peek for piecewise processing.
    pub fn consume(&self, nbytes: usize) {
        let consumer_pos = self.consumer_pos.load(Ordering::Relaxed);
        self.consumer_pos
            .store(consumer_pos + nbytes, Ordering::Release);
    }

    pub(crate) fn mark_deletable(&self) {
        self.should_deallocate.store(true, Ordering::Release);
    }

    pub(crate) fn can_delete(&self) -> bool {
        self.should_deallocate.load(Ordering::Acquire)
    }
}

/// Producer handle for one staging ring. Owning it is the SPSC license to
/// write; dropping it marks the ring for deferred deletion by the
/// compression thread.
pub struct Producer {
    buffer: Arc<StagingBuffer>,
    /// Local mirror of the producer position; the atomic is only updated
    /// on commit.
    producer_pos: usize,
    /// Free space known without touching the consumer's cache line.
    /// Refreshed from the consumer position only when too small.
    min_free_space: usize,
    max_record_size: usize,
    discard_on_full: bool,
}

impl Producer {
    pub(crate) fn new(
        buffer: Arc<StagingBuffer>,
        max_record_size: usize,
        discard_on_full: bool,
    ) -> Producer {
        let min_free_space = buffer.capacity();
        Producer {
            buffer,
            producer_pos: 0,
            min_free_space,
            max_record_size,
            discard_on_full,
        }
    }

    pub fn buffer(&self) -> &Arc<StagingBuffer> {
        &self.buffer
    }

    /// Stages one record: header, then the raw argument bytes. Oversize
    /// records are refused with a diagnostic since they could never clear
    /// the ring's wrap protocol.
    pub fn log(&mut self, fmt_id: LogId, log_args: &[LogArg<'_>]) {
        let payload: usize = log_args.iter().map(LogArg::staged_size).sum();
        let entry_size = RECORD_HEADER_SIZE + payload;
        if entry_size > self.max_record_size {
            error!(
                fmt_id,
                entry_size,
                max = self.max_record_size,
                "log record exceeds half the staging buffer; dropping it"
            );
            return;
        }
        let timestamp = cycles::rdtsc();

        let Some(ptr) = self.reserve_space(entry_size, true) else {
            return;
        };
        // SAFETY: `reserve_space` returned `entry_size` contiguous bytes
        // that only this producer may touch until the commit below.
        let out = unsafe { std::slice::from_raw_parts_mut(ptr, entry_size) };
        let mut pos = 0;
        let header = RecordHeader {
            fmt_id,
            entry_size: entry_size as u32,
            timestamp,
        };
        // Infallible: the slice is exactly entry_size bytes.
        let _ = header.write(out, &mut pos);
        for arg in log_args {
            arg.write(out, &mut pos);
        }
        self.finish_reservation(entry_size);
    }

    /// Returns a pointer to `nbytes` of contiguous writable space without
    /// making it visible to the consumer. The fast path costs one branch
    /// against the cached free space.
    #[inline]
    pub fn reserve_space(&mut self, nbytes: usize, blocking: bool) -> Option<*mut u8> {
        if nbytes < self.min_free_space {
            return Some(self.write_ptr());
        }
        self.reserve_space_internal(nbytes, blocking)
    }

    /// Slow path: refreshes the cached free space from the consumer
    /// position, wrapping or blocking as the protocol requires.
    #[cold]
    fn reserve_space_internal(&mut self, nbytes: usize, blocking: bool) -> Option<*mut u8> {
        let capacity = self.buffer.capacity();
        let blocked_start = cycles::rdtsc();
        let mut blocked = false;

        while self.min_free_space <= nbytes {
            let cached_consumer_pos = self.buffer.consumer_pos.load(Ordering::Acquire);

            if cached_consumer_pos <= self.producer_pos {
                self.min_free_space = capacity - self.producer_pos;
                if self.min_free_space > nbytes {
                    break;
                }

                // Not enough tail space: publish where the recorded bytes
                // end and wrap, unless the consumer still sits at the head
                // (the wrapped region would collide with unread data).
                self.buffer
                    .end_of_recorded_space
                    .store(self.producer_pos, Ordering::Release);
                if cached_consumer_pos != 0 {
                    self.buffer.producer_pos.store(0, Ordering::Release);
                    self.producer_pos = 0;
                    self.min_free_space = cached_consumer_pos;
                }
            } else {
                self.min_free_space = cached_consumer_pos - self.producer_pos;
            }

            if self.discard_on_full && self.min_free_space <= nbytes {
                // Benchmarking escape hatch: throw the staged bytes away.
                self.buffer.producer_pos.store(0, Ordering::Release);
                self.producer_pos = 0;
                self.min_free_space = capacity;
                break;
            }

            if self.min_free_space <= nbytes {
                if !blocking {
                    return None;
                }
                blocked = true;
                std::hint::spin_loop();
            }
        }

        if blocked {
            let cycles = cycles::rdtsc().wrapping_sub(blocked_start);
            self.buffer.num_times_blocked.fetch_add(1, Ordering::Relaxed);
            self.buffer
                .cycles_blocked
                .fetch_add(cycles, Ordering::Relaxed);
            let bucket =
                ((cycles::to_seconds(cycles) * 1.0e8) as usize).min(BLOCKED_DIST_BUCKETS - 1);
            self.buffer.blocked_dist[bucket].fetch_add(1, Ordering::Relaxed);
        }
        Some(self.write_ptr())
    }

    /// Commits `nbytes` of a reservation, making them visible to the
    /// consumer. Must not exceed the reservation and must not cross the
    /// end of the ring.
    #[inline]
    pub fn finish_reservation(&mut self, nbytes: usize) {
        debug_assert!(
            nbytes <= self.min_free_space,
            "commit of {nbytes} bytes exceeds the reservation"
        );
        debug_assert!(
            self.producer_pos + nbytes <= self.buffer.capacity(),
            "commit crosses the end of the staging buffer"
        );
        self.min_free_space -= nbytes;
        self.producer_pos += nbytes;
        self.buffer.num_allocations.fetch_add(1, Ordering::Relaxed);
        self.buffer
            .producer_pos
            .store(self.producer_pos, Ordering::Release);
    }

    #[inline]
    fn write_ptr(&self) -> *mut u8 {
        // SAFETY: producer_pos < capacity by the wrap protocol.
        unsafe { self.buffer.base_ptr().add(self.producer_pos) }
    }
}

impl Drop for Producer {
    fn drop(&mut self) {
        self.buffer.mark_deletable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(capacity: usize) -> (Producer, Arc<StagingBuffer>) {
        let buffer = Arc::new(StagingBuffer::new(0, capacity));
        (Producer::new(buffer.clone(), capacity / 2, false), buffer)
    }

    fn fill(producer: &mut Producer, nbytes: usize, byte: u8) -> bool {
        let Some(ptr) = producer.reserve_space(nbytes, false) else {
            return false;
        };
        unsafe { std::slice::from_raw_parts_mut(ptr, nbytes) }.fill(byte);
        producer.finish_reservation(nbytes);
        true
    }

    #[test]
    fn empty_means_equal_positions() {
        let (_producer, buffer) = ring(1024);
        assert_eq!(0, buffer.peek().len());
    }

    #[test]
    fn committed_bytes_become_visible() {
        let (mut producer, buffer) = ring(1024);
        assert!(fill(&mut producer, 100, 7));
        let peeked = buffer.peek();
        assert_eq!(100, peeked.len());
        assert!(peeked.iter().all(|&b| b == 7));

        buffer.consume(100);
        assert_eq!(0, buffer.peek().len());
    }

    #[test]
    fn wrap_publishes_tail_then_prefix() {
        let (mut producer, buffer) = ring(1000);
        // Fill to within 100 bytes of the end, in 50-byte records.
        for _ in 0..18 {
            assert!(fill(&mut producer, 50, 1));
        }
        // Free the head so the wrap is allowed.
        assert_eq!(900, buffer.peek().len());
        buffer.consume(600);

        // A 200-byte reservation cannot fit in the 100-byte tail: the
        // producer must publish end-of-recorded-space and wrap.
        assert!(fill(&mut producer, 200, 2));

        // First peek drains the tail remnant.
        let tail = buffer.peek();
        assert_eq!(300, tail.len());
        assert!(tail.iter().all(|&b| b == 1));
        buffer.consume(300);

        // Second peek rolls over to the wrapped prefix.
        let prefix = buffer.peek();
        assert_eq!(200, prefix.len());
        assert!(prefix.iter().all(|&b| b == 2));
    }

    #[test]
    fn producer_blocks_when_consumer_at_head() {
        let (mut producer, buffer) = ring(1000);
        for _ in 0..18 {
            assert!(fill(&mut producer, 50, 1));
        }
        // Consumer has not moved: wrapping would collide. The non-blocking
        // reservation must refuse rather than overwrite.
        assert!(producer.reserve_space(200, false).is_none());
        assert_eq!(900, buffer.peek().len());
    }

    #[test]
    fn never_fills_completely() {
        let (mut producer, buffer) = ring(256);
        // A reservation equal to the remaining space must not be admitted:
        // positions may never overlap.
        assert!(fill(&mut producer, 128, 1));
        assert!(fill(&mut producer, 127, 2));
        assert!(producer.reserve_space(1, false).is_none());
        assert_eq!(255, buffer.peek().len());
    }

    #[test]
    fn consume_can_be_piecewise() {
        let (mut producer, buffer) = ring(1024);
        assert!(fill(&mut producer, 300, 9));
        buffer.consume(100);
        assert_eq!(200, buffer.peek().len());
        buffer.consume(200);
        assert_eq!(0, buffer.peek().len());
    }

    #[test]
    fn drop_marks_deletable() {
        let (producer, buffer) = ring(1024);
        assert!(!buffer.can_delete());
        drop(producer);
        assert!(buffer.can_delete());
    }

    #[test]
    fn log_stages_header_and_args() {
        let (mut producer, buffer) = ring(4096);
        producer.log(3, &[LogArg::I32(-1), LogArg::Str("hi")]);

        let bytes = buffer.peek();
        let header = RecordHeader::read(bytes, 0).unwrap();
        assert_eq!(3, header.fmt_id);
        assert_eq!((RECORD_HEADER_SIZE + 4 + 3) as u32, header.entry_size);
        assert_eq!(
            &(-1i32).to_le_bytes(),
            &bytes[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + 4]
        );
        assert_eq!(b"hi\0", &bytes[RECORD_HEADER_SIZE + 4..header.entry_size as usize]);
    }

    #[test]
    fn oversize_record_is_refused() {
        let (mut producer, buffer) = ring(4096);
        let big = "x".repeat(4096);
        producer.log(1, &[LogArg::Str(&big)]);
        assert_eq!(0, buffer.peek().len());
    }
}
