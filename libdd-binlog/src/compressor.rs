// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The background compression thread. Each iteration scans every staging
//! ring round-robin, drives the encoder, and keeps exactly one write in
//! flight on the writer thread while encoding continues into the other
//! half of the double buffer.

use crate::aligned::AlignedBuf;
use crate::cycles;
use crate::encoder::Encoder;
use crate::registry::StaticLogInfo;
use crate::runtime::{Inner, SyncStatus, PEEK_DIST_BUCKETS};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError};
use libdd_binlog_wire::{log_info_encoded_size, CHECKPOINT_SIZE};
use std::fs::File;
use std::io::Write;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::error;

/// One filled output buffer and how many of its bytes to write.
type WriteRequest = (AlignedBuf, usize);
/// The buffer coming back once its write completed (or failed).
type WriteCompletion = (AlignedBuf, std::io::Result<()>);

/// Dedicated writer thread owning the log file. The bounded(1) channel
/// pair realizes the "exactly one outstanding write" rule: the compressor
/// submits a filled buffer and later reclaims it, recycled, from the
/// completion side.
struct Writer {
    submit: Sender<WriteRequest>,
    completions: Receiver<WriteCompletion>,
    handle: JoinHandle<()>,
}

impl Writer {
    fn spawn(mut file: File) -> Writer {
        let (submit, requests) = bounded::<WriteRequest>(1);
        let (completion_tx, completions) = bounded::<WriteCompletion>(1);
        let handle = std::thread::spawn(move || {
            while let Ok((buffer, len)) = requests.recv() {
                let result = file.write_all(&buffer.as_slice()[..len]);
                if completion_tx.send((buffer, result)).is_err() {
                    return;
                }
            }
        });
        Writer {
            submit,
            completions,
            handle,
        }
    }

    fn shutdown(self) {
        drop(self.submit);
        drop(self.completions);
        let _ = self.handle.join();
    }
}

/// Marks a completed write in the stats and the sync state machine.
fn finish_write(inner: &Inner, result: std::io::Result<()>) {
    if let Err(err) = result {
        error!(error = %err, "log file write failed; the block is lost");
        inner.stats.write_failures.fetch_add(1, Ordering::Relaxed);
    }
    inner.stats.writes_completed.fetch_add(1, Ordering::Relaxed);

    let mut cond = inner.cond.lock();
    if cond.sync_status == SyncStatus::WaitingOnIo {
        cond.sync_status = SyncStatus::Completed;
        inner.sync_completed.notify_all();
    }
}

pub(crate) fn compression_thread_main(
    inner: Arc<Inner>,
    file: File,
    buffers: (AlignedBuf, AlignedBuf),
) {
    let config = inner.config.clone();
    let writer = Writer::spawn(file);
    let (compressing_buffer, double_buffer) = buffers;

    // In the integration mode the whole table known right now rides along
    // in the checkpoint; later registrations still go out as fragments.
    let embedded: Option<Vec<StaticLogInfo>> = if config.full_dictionary_in_checkpoint {
        let sites = inner.sites.lock();
        let needed = CHECKPOINT_SIZE
            + sites
                .iter()
                .map(|s| log_info_encoded_size(&s.filename, &s.format))
                .sum::<usize>();
        if needed > config.output_buffer_size {
            // Fall back to the fragment protocol; the file stays decodable.
            error!(
                needed,
                available = config.output_buffer_size,
                "dictionary does not fit in the checkpoint; falling back to fragments"
            );
            inner.next_site_to_persist.store(0, Ordering::Relaxed);
            None
        } else {
            inner.next_site_to_persist.store(sites.len(), Ordering::Relaxed);
            Some(sites.clone())
        }
    } else {
        None
    };
    let mut encoder = match Encoder::new(
        compressing_buffer,
        config.staging_buffer_size,
        false,
        embedded.as_deref(),
    ) {
        Ok(encoder) => encoder,
        Err(err) => {
            // Unreachable with a validated config; bail rather than spin.
            error!(error = %err, "output buffer cannot hold a checkpoint; logging disabled");
            writer.shutdown();
            return;
        }
    };
    let mut spare: Option<AlignedBuf> = Some(double_buffer);
    let mut outstanding = false;

    // Index of the staging ring the previous scan stopped at.
    let mut last_staging_buffer_checked = 0usize;
    // The output buffer filled up before a peek was drained.
    let mut output_buffer_full = false;
    // A full pass over the rings completed; the next extent carries the
    // wrap bit.
    let mut wrap_around = false;
    // Shadow of the persisted prefix of the site table, so scans never
    // hold the registration lock while compressing.
    let mut shadow_dictionary: Vec<StaticLogInfo> = Vec::new();

    loop {
        if inner.should_exit.load(Ordering::Acquire) && encoder.encoded_bytes() == 0 && !outstanding
        {
            break;
        }

        let mut bytes_consumed_this_iteration = 0u64;
        let compress_start = cycles::rdtsc();

        // Step 1: flush new dictionary entries, then scan for staged bytes.
        {
            let mut buffer_registry = inner.buffers.lock();

            {
                let sites = inner.sites.lock();
                let mut cursor = inner.next_site_to_persist.load(Ordering::Relaxed);
                if cursor < sites.len() {
                    encoder.encode_new_dictionary_entries(&mut cursor, &sites);
                    inner.next_site_to_persist.store(cursor, Ordering::Relaxed);
                }
                while shadow_dictionary.len() < cursor {
                    shadow_dictionary.push(sites[shadow_dictionary.len()].clone());
                }
            }

            let mut i = if buffer_registry.list.is_empty() {
                0
            } else {
                last_staging_buffer_checked.min(buffer_registry.list.len() - 1)
            };
            while !output_buffer_full && !buffer_registry.list.is_empty() {
                let staging = buffer_registry.list[i].clone();
                let peeked = staging.peek();
                let peek_bytes = peeked.len();

                if peek_bytes > 0 {
                    drop(buffer_registry);

                    let bucket = (PEEK_DIST_BUCKETS * peek_bytes / config.staging_buffer_size)
                        .min(PEEK_DIST_BUCKETS - 1);
                    inner.stats.peek_dist[bucket].fetch_add(1, Ordering::Relaxed);

                    // Encode in release-threshold hops so the producer sees
                    // space freed promptly.
                    let mut offset = 0;
                    while offset < peek_bytes {
                        let chunk = (peek_bytes - offset).min(config.release_threshold);
                        let mut events = 0u64;
                        let misses_before = encoder.encode_misses_due_to_metadata();
                        let consumed = encoder.encode_log_msgs(
                            &peeked[offset..offset + chunk],
                            staging.id(),
                            wrap_around,
                            &shadow_dictionary,
                            &mut events,
                        );
                        inner.stats.logs_processed.fetch_add(events, Ordering::Relaxed);
                        if consumed == 0 {
                            if encoder.encode_misses_due_to_metadata() > misses_before {
                                // The producer is mid-registration: leave
                                // this ring alone for the rest of the pass.
                                break;
                            }
                            last_staging_buffer_checked = i;
                            output_buffer_full = true;
                            break;
                        }
                        wrap_around = false;
                        staging.consume(consumed);
                        offset += consumed;
                        bytes_consumed_this_iteration += consumed as u64;
                        inner
                            .stats
                            .total_bytes_read
                            .fetch_add(consumed as u64, Ordering::Relaxed);
                        if consumed < chunk {
                            // Unregistered id or a record cut by the hop
                            // boundary: leave the rest for the next pass.
                            break;
                        }
                    }

                    buffer_registry = inner.buffers.lock();
                } else if staging.can_delete() {
                    // The producer thread exited and the ring is drained.
                    buffer_registry.list.remove(i);
                    if buffer_registry.list.is_empty() {
                        last_staging_buffer_checked = 0;
                        wrap_around = true;
                        break;
                    }
                    // Back up so the pass does not skip the shifted entry.
                    if last_staging_buffer_checked >= i && last_staging_buffer_checked > 0 {
                        last_staging_buffer_checked -= 1;
                    }
                    if i >= buffer_registry.list.len() {
                        i = 0;
                        wrap_around = true;
                    }
                    if i == last_staging_buffer_checked {
                        break;
                    }
                    continue;
                }

                i = (i + 1) % buffer_registry.list.len();
                if i == 0 {
                    wrap_around = true;
                }
                if i == last_staging_buffer_checked {
                    break;
                }
            }
        }
        inner.stats.cycles_compressing.fetch_add(
            cycles::rdtsc().wrapping_sub(compress_start),
            Ordering::Relaxed,
        );

        // Step 2: nothing to output. Run the sync state machine and doze.
        if encoder.encoded_bytes() == 0 {
            let mut cond = inner.cond.lock();
            if cond.sync_status == SyncStatus::Requested {
                // Producers may have staged records right before the sync
                // request: make one more full scan pass.
                cond.sync_status = SyncStatus::PerformingSecondPass;
                continue;
            }
            if cond.sync_status == SyncStatus::PerformingSecondPass {
                cond.sync_status = if outstanding {
                    SyncStatus::WaitingOnIo
                } else {
                    SyncStatus::Completed
                };
            }
            if cond.sync_status == SyncStatus::Completed {
                inner.sync_completed.notify_all();
            }
            if !inner.should_exit.load(Ordering::Acquire) {
                inner
                    .work_added
                    .wait_for(&mut cond, config.poll_interval_no_work);
            }
        }

        // Step 3: reap the outstanding write, waiting only when the full
        // output buffer leaves no other option.
        if outstanding {
            match writer.completions.try_recv() {
                Ok((buffer, result)) => {
                    spare = Some(buffer);
                    outstanding = false;
                    finish_write(&inner, result);
                }
                Err(TryRecvError::Empty) => {
                    if output_buffer_full {
                        match writer.completions.recv() {
                            Ok((buffer, result)) => {
                                spare = Some(buffer);
                                outstanding = false;
                                finish_write(&inner, result);
                            }
                            Err(_) => {
                                error!("log writer thread died; shutting the compressor down");
                                break;
                            }
                        }
                    } else {
                        if bytes_consumed_this_iteration == 0 {
                            let mut cond = inner.cond.lock();
                            inner
                                .work_added
                                .wait_for(&mut cond, config.poll_interval_during_io);
                        }
                        match writer.completions.try_recv() {
                            Ok((buffer, result)) => {
                                spare = Some(buffer);
                                outstanding = false;
                                finish_write(&inner, result);
                            }
                            Err(_) => continue,
                        }
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    error!("log writer thread died; shutting the compressor down");
                    break;
                }
            }
        }

        // Step 4: the double buffer is free; submit what the encoder has.
        let mut bytes_to_write = encoder.encoded_bytes();
        if bytes_to_write == 0 {
            continue;
        }
        let Some(new_buffer) = spare.take() else {
            continue;
        };
        let (mut filled, encoded) = encoder.swap_buffer(new_buffer);
        bytes_to_write = encoded;

        // Direct I/O writes whole 512-byte sectors; the padding decodes as
        // invalid entries and is skipped.
        if config.uses_direct_io() {
            let over = bytes_to_write % 512;
            if over != 0 {
                let pad = 512 - over;
                filled.as_mut_slice()[bytes_to_write..bytes_to_write + pad].fill(0);
                bytes_to_write += pad;
                inner
                    .stats
                    .pad_bytes_written
                    .fetch_add(pad as u64, Ordering::Relaxed);
            }
        }
        inner
            .stats
            .total_bytes_written
            .fetch_add(bytes_to_write as u64, Ordering::Relaxed);

        if writer.submit.send((filled, bytes_to_write)).is_err() {
            error!("log writer thread died; shutting the compressor down");
            break;
        }
        outstanding = true;
        output_buffer_full = false;
    }

    writer.shutdown();
}
