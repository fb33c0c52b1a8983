// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Turns staged records into the framed compressed stream. The encoder
//! owns one half of the output double buffer at a time; the compression
//! thread repeatedly feeds it staged bytes and swaps the buffer out for
//! I/O when it fills.
//!
//! Layout produced here: a checkpoint first (once per file), then buffer
//! extents holding compressed records, with dictionary fragments between
//! extents as new sites appear.

use crate::aligned::AlignedBuf;
use crate::cycles;
use crate::registry::StaticLogInfo;
use anyhow::Context;
use libdd_binlog_wire::{
    encode_dictionary_fragment_header, encode_extent_start, encode_log_info,
    encode_record_header, log_info_encoded_size, patch_extent_length, Checkpoint, RecordHeader,
    CHECKPOINT_SIZE, DICTIONARY_FRAGMENT_HEADER_SIZE, RECORD_HEADER_SIZE,
};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::error;

pub struct Encoder {
    buffer: AlignedBuf,
    write_pos: usize,
    staging_buffer_size: usize,

    /// Producer id of the extent in progress; a new extent is emitted per
    /// encode call, this survives for the swap bookkeeping.
    last_buffer_id: Option<u32>,

    /// Offset of the in-progress extent's length field, patched as records
    /// land in it.
    extent_length_offset: Option<usize>,

    /// Timestamp of the last record encoded into the current extent;
    /// deltas are taken against it, starting from zero per extent.
    last_timestamp: u64,

    /// Total number of encode failures due to missing metadata. Usually a
    /// benign registration race.
    encode_misses_due_to_metadata: u64,

    /// Consecutive misses; a large run means the dictionary is not being
    /// persisted at all.
    consecutive_encode_misses: u64,
}

impl Encoder {
    /// An encoder whose construction corresponds to the start of a log
    /// file: it writes the checkpoint, embedding the full dictionary when
    /// `embed` is given. `skip_checkpoint` exists for unit tests that
    /// frame entries by hand.
    pub fn new(
        buffer: AlignedBuf,
        staging_buffer_size: usize,
        skip_checkpoint: bool,
        embed: Option<&[StaticLogInfo]>,
    ) -> anyhow::Result<Encoder> {
        let mut encoder = Encoder {
            buffer,
            write_pos: 0,
            staging_buffer_size,
            last_buffer_id: None,
            extent_length_offset: None,
            last_timestamp: 0,
            encode_misses_due_to_metadata: 0,
            consecutive_encode_misses: 0,
        };
        if skip_checkpoint && embed.is_none() {
            return Ok(encoder);
        }
        encoder.insert_checkpoint(embed)?;
        Ok(encoder)
    }

    fn insert_checkpoint(&mut self, embed: Option<&[StaticLogInfo]>) -> anyhow::Result<()> {
        let start = self.write_pos;
        let mut pos = start + CHECKPOINT_SIZE;
        anyhow::ensure!(
            pos <= self.buffer.len(),
            "output buffer too small for a checkpoint"
        );

        let mut new_metadata_bytes = 0u32;
        let mut total_metadata_entries = 0u32;
        if let Some(sites) = embed {
            let dictionary_start = pos;
            let out = self.buffer.as_mut_slice();
            for site in sites {
                encode_log_info(
                    out,
                    &mut pos,
                    site.severity as u8,
                    site.line,
                    &site.filename,
                    &site.format,
                )
                .context("output buffer too small for the embedded dictionary")?;
            }
            new_metadata_bytes = (pos - dictionary_start) as u32;
            total_metadata_entries = sites.len() as u32;
        }

        let checkpoint = Checkpoint {
            rdtsc: cycles::rdtsc(),
            unix_time: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default(),
            cycles_per_second: cycles::cycles_per_second(),
            new_metadata_bytes,
            total_metadata_entries,
        };
        let mut checkpoint_pos = start;
        checkpoint
            .write(self.buffer.as_mut_slice(), &mut checkpoint_pos)
            .context("output buffer too small for a checkpoint")?;
        self.write_pos = pos;
        Ok(())
    }

    /// Bytes of encoded data waiting in the internal buffer.
    pub fn encoded_bytes(&self) -> usize {
        self.write_pos
    }

    /// Emits the extent header that opens a run of records for
    /// `buffer_id`. Fails only for lack of output space.
    fn encode_buffer_extent_start(&mut self, buffer_id: u32, new_pass: bool) -> bool {
        let mut pos = self.write_pos;
        match encode_extent_start(self.buffer.as_mut_slice(), &mut pos, buffer_id, new_pass) {
            Ok(length_offset) => {
                self.write_pos = pos;
                self.extent_length_offset = Some(length_offset);
                self.last_buffer_id = Some(buffer_id);
                self.last_timestamp = 0;
                true
            }
            Err(_) => false,
        }
    }

    /// Compresses the staged records in `from` into the internal buffer as
    /// one buffer extent for `buffer_id`. Returns the bytes consumed from
    /// `from`; zero means the output buffer is out of room and the caller
    /// should swap it. Stops early at a record whose bytes are not all in
    /// `from` yet, or whose metadata has not been registered in
    /// `dictionary` (the producer is mid-registration).
    pub fn encode_log_msgs(
        &mut self,
        from: &[u8],
        buffer_id: u32,
        new_pass: bool,
        dictionary: &[StaticLogInfo],
        num_events: &mut u64,
    ) -> usize {
        if !self.encode_buffer_extent_start(buffer_id, new_pass) {
            return 0;
        }
        let extent_data_start = self.write_pos;
        let mut consumed = 0usize;

        while consumed < from.len() {
            // A record split by the caller's chunking shows up as a short
            // tail; it comes back whole in the next call.
            if from.len() - consumed < RECORD_HEADER_SIZE {
                break;
            }
            // Infallible: at least a header's worth remains.
            let Ok(header) = RecordHeader::read(from, consumed) else {
                break;
            };
            let entry_size = header.entry_size as usize;

            if dictionary.len() <= header.fmt_id as usize {
                self.encode_misses_due_to_metadata += 1;
                self.consecutive_encode_misses += 1;
                if self.consecutive_encode_misses % 1000 == 0 {
                    error!(
                        fmt_id = header.fmt_id,
                        registered = dictionary.len(),
                        "metadata still missing for a log record during \
                         compression; the dictionary is not being persisted"
                    );
                }
                break;
            }
            self.consecutive_encode_misses = 0;

            if entry_size > from.len() - consumed {
                if entry_size < self.staging_buffer_size / 2 {
                    break;
                }
                let info = &dictionary[header.fmt_id as usize];
                error!(
                    entry_size,
                    max = self.staging_buffer_size / 2,
                    file = &*info.filename,
                    line = info.line,
                    format = &*info.format,
                    "log record exceeds the maximum allowable size"
                );
                break;
            }

            // Worst case: nothing compresses and every data byte needs a
            // nibble.
            let max_compressed_size = 2 * entry_size + RECORD_HEADER_SIZE;
            if max_compressed_size > self.buffer.len() - self.write_pos {
                break;
            }

            let mut pos = self.write_pos;
            if encode_record_header(
                self.buffer.as_mut_slice(),
                &mut pos,
                header.fmt_id,
                header.timestamp,
                self.last_timestamp,
            )
            .is_err()
            {
                break;
            }
            self.last_timestamp = header.timestamp;

            let info = &dictionary[header.fmt_id as usize];
            let arg_data = &from[consumed + RECORD_HEADER_SIZE..consumed + entry_size];
            (info.codec.pack)(&info.codec, arg_data, self.buffer.as_mut_slice(), &mut pos);
            self.write_pos = pos;

            consumed += entry_size;
            *num_events += 1;
        }

        if let Some(length_offset) = self.extent_length_offset {
            patch_extent_length(
                self.buffer.as_mut_slice(),
                length_offset,
                (self.write_pos - extent_data_start) as u32,
            );
        }
        consumed
    }

    /// Writes a dictionary fragment holding `sites[*cursor..]`, as many
    /// entries as fit, advancing the cursor past what was persisted.
    /// Returns the fragment's byte count, zero when not even its header
    /// fits.
    pub fn encode_new_dictionary_entries(
        &mut self,
        cursor: &mut usize,
        sites: &[StaticLogInfo],
    ) -> u32 {
        let header_offset = self.write_pos;
        if DICTIONARY_FRAGMENT_HEADER_SIZE >= self.buffer.len() - self.write_pos {
            return 0;
        }
        let mut pos = self.write_pos + DICTIONARY_FRAGMENT_HEADER_SIZE;

        while *cursor < sites.len() {
            let site = &sites[*cursor];
            let entry_size = log_info_encoded_size(&site.filename, &site.format);
            if entry_size >= self.buffer.len() - pos {
                break;
            }
            // Infallible after the size check above.
            if encode_log_info(
                self.buffer.as_mut_slice(),
                &mut pos,
                site.severity as u8,
                site.line,
                &site.filename,
                &site.format,
            )
            .is_err()
            {
                break;
            }
            *cursor += 1;
        }

        let fragment_bytes = (pos - header_offset) as u32;
        encode_dictionary_fragment_header(
            self.buffer.as_mut_slice(),
            header_offset,
            fragment_bytes,
            *cursor as u32,
        );
        self.write_pos = pos;
        // A fragment ends any extent in progress; records must not span
        // other entries.
        self.last_buffer_id = None;
        self.extent_length_offset = None;
        fragment_bytes
    }

    /// Trades the internal buffer for `new_buffer` so the old one can be
    /// submitted for I/O. Returns the old buffer and its encoded length.
    pub fn swap_buffer(&mut self, new_buffer: AlignedBuf) -> (AlignedBuf, usize) {
        let encoded = self.write_pos;
        let old = std::mem::replace(&mut self.buffer, new_buffer);
        self.write_pos = 0;
        self.last_buffer_id = None;
        self.extent_length_offset = None;
        (old, encoded)
    }

    pub fn encode_misses_due_to_metadata(&self) -> u64 {
        self.encode_misses_due_to_metadata
    }
}
