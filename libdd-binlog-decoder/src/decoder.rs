// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Interprets a compressed log file produced by the runtime. The decoder
//! is built once and reused via [`Decoder::open`]; it holds on to large
//! fragment buffers between files.

use crate::format::{create_micro_code, FormatMetadata};
use crate::fragment::BufferFragment;
use crate::log_message::LogMessage;
use anyhow::{bail, Context};
use libdd_binlog_wire::{
    decode_dictionary_fragment_header, decode_log_info, entry_type, Checkpoint, EntryType,
    CHECKPOINT_SIZE, DICTIONARY_FRAGMENT_HEADER_SIZE, MAX_EXTENT_HEADER_SIZE,
};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;

/// Default bound on one buffer extent: the default staging-buffer size
/// plus the extent header. Extents from runtimes configured with larger
/// staging rings need [`Decoder::with_max_staging_buffer_size`].
const DEFAULT_MAX_STAGING_BUFFER_SIZE: usize = 1 << 20;

/// Number of stages the ordered replay buffers. The compressor reorders
/// records across at most two partial passes plus the current one, so
/// three stages bound the sorting window.
const STAGES_TO_BUFFER: usize = 3;

/// A per-record hook for cross-record statistics: invoked with the
/// original format string and the decoded arguments of every record whose
/// id matches.
pub struct Aggregation<'a> {
    pub target_id: u32,
    pub callback: &'a mut dyn FnMut(&str, &LogMessage),
}

/// Min-heap adapter: orders fragments by their next record's timestamp,
/// smallest on top.
struct StagedFragment {
    fragment: Box<BufferFragment>,
}

impl StagedFragment {
    fn key(&self) -> u64 {
        self.fragment.next_timestamp()
    }
}

impl PartialEq for StagedFragment {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for StagedFragment {}
impl PartialOrd for StagedFragment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for StagedFragment {
    fn cmp(&self, other: &Self) -> Ordering {
        // Inverted so the std max-heap yields the smallest timestamp.
        other.key().cmp(&self.key())
    }
}

pub struct Decoder {
    path: Option<PathBuf>,
    input: Option<BufReader<File>>,

    /// False once an unrecoverable error was seen; every entry point
    /// refuses to continue.
    good: bool,

    /// The checkpoint governing cycle-to-wall-clock translation. Replaced
    /// when a later execution's checkpoint is crossed.
    checkpoint: Checkpoint,

    /// Micro-code per message id. `None` marks an id whose format string
    /// could not be interpreted; its records are unrenderable.
    dictionary: Vec<Option<Arc<FormatMetadata>>>,

    /// The fragment the iterative interface is draining.
    current: Box<BufferFragment>,
    free_fragments: Vec<Box<BufferFragment>>,
    max_extent_size: usize,

    log_msgs_printed: u64,
    num_buffer_fragments_read: u64,
    num_checkpoints_read: u64,
}

impl Default for Decoder {
    fn default() -> Self {
        Decoder::new()
    }
}

impl Decoder {
    pub fn new() -> Decoder {
        Decoder::with_max_staging_buffer_size(DEFAULT_MAX_STAGING_BUFFER_SIZE)
    }

    /// A decoder for files written with a non-default staging buffer
    /// size; extents are bounded by it.
    pub fn with_max_staging_buffer_size(staging_buffer_size: usize) -> Decoder {
        let max_extent_size = staging_buffer_size + MAX_EXTENT_HEADER_SIZE;
        Decoder {
            path: None,
            input: None,
            good: false,
            checkpoint: Checkpoint::default(),
            dictionary: Vec::new(),
            current: Box::new(BufferFragment::new(max_extent_size)),
            free_fragments: Vec::new(),
            max_extent_size,
            log_msgs_printed: 0,
            num_buffer_fragments_read: 0,
            num_checkpoints_read: 0,
        }
    }

    /// Opens a compressed log. Fails when the file cannot be read or does
    /// not begin with a valid checkpoint and dictionary.
    pub fn open(&mut self, path: &Path) -> anyhow::Result<()> {
        self.good = false;
        self.input = None;
        self.path = None;
        self.current.reset();
        self.log_msgs_printed = 0;
        self.num_buffer_fragments_read = 0;
        self.num_checkpoints_read = 0;

        let file = File::open(path).with_context(|| format!("could not open {path:?}"))?;
        let mut reader = BufReader::new(file);
        self.read_dictionary(&mut reader, true)
            .with_context(|| format!("{path:?} is not a valid compressed log"))?;

        self.input = Some(reader);
        self.path = Some(path.to_owned());
        self.good = true;
        Ok(())
    }

    pub fn log_msgs_printed(&self) -> u64 {
        self.log_msgs_printed
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn num_buffer_fragments_read(&self) -> u64 {
        self.num_buffer_fragments_read
    }

    pub fn num_checkpoints_read(&self) -> u64 {
        self.num_checkpoints_read
    }

    /// Reads a checkpoint and its embedded dictionary, rebuilding the
    /// micro-code table. `flush` drops the previous execution's entries
    /// first.
    fn read_dictionary(&mut self, reader: &mut impl Read, flush: bool) -> anyhow::Result<()> {
        let mut checkpoint_bytes = [0u8; CHECKPOINT_SIZE];
        reader
            .read_exact(&mut checkpoint_bytes)
            .context("could not read the checkpoint")?;
        let checkpoint = Checkpoint::read(&checkpoint_bytes)
            .context("the file does not begin with a checkpoint")?;

        if flush {
            self.dictionary.clear();
        }

        let mut raw = vec![0u8; checkpoint.new_metadata_bytes as usize];
        reader
            .read_exact(&mut raw)
            .context("could not read the embedded dictionary")?;
        let mut pos = 0;
        while pos < raw.len() {
            self.append_dictionary_entry(&raw, &mut pos)?;
        }
        if pos != raw.len() {
            bail!(
                "embedded dictionary is inconsistent: expected {} bytes, \
                 consumed {pos}",
                raw.len()
            );
        }
        if self.dictionary.len() != checkpoint.total_metadata_entries as usize {
            bail!(
                "missing log metadata: expected {} entries, found {}",
                checkpoint.total_metadata_entries,
                self.dictionary.len()
            );
        }

        self.checkpoint = checkpoint;
        self.num_checkpoints_read += 1;
        Ok(())
    }

    /// Reads one dictionary fragment and appends its entries. The
    /// fragment's byte count is authoritative; the running entry total is
    /// a sanity check.
    fn read_dictionary_fragment(&mut self, reader: &mut impl Read) -> anyhow::Result<()> {
        let mut header = [0u8; DICTIONARY_FRAGMENT_HEADER_SIZE];
        reader
            .read_exact(&mut header)
            .context("could not read a dictionary fragment header")?;
        let (fragment_bytes, total_entries) = decode_dictionary_fragment_header(&header)?;
        if (fragment_bytes as usize) < DICTIONARY_FRAGMENT_HEADER_SIZE {
            bail!("dictionary fragment claims {fragment_bytes} bytes, less than its header");
        }

        let mut raw = vec![0u8; fragment_bytes as usize - DICTIONARY_FRAGMENT_HEADER_SIZE];
        reader
            .read_exact(&mut raw)
            .context("could not read a dictionary fragment")?;
        let mut pos = 0;
        while pos < raw.len() {
            self.append_dictionary_entry(&raw, &mut pos)?;
        }
        if self.dictionary.len() != total_entries as usize {
            bail!(
                "dictionary running total mismatch: fragment says {total_entries}, \
                 table has {}",
                self.dictionary.len()
            );
        }
        Ok(())
    }

    fn append_dictionary_entry(&mut self, raw: &[u8], pos: &mut usize) -> anyhow::Result<()> {
        let info = decode_log_info(raw, pos).context("corrupt dictionary entry")?;
        match create_micro_code(&info.format, &info.filename, info.line, info.severity) {
            Ok(metadata) => self.dictionary.push(Some(Arc::new(metadata))),
            Err(err) => {
                // Keep the id slot so later ids stay aligned; records using
                // this one are unrenderable.
                warn!(
                    id = self.dictionary.len(),
                    error = %err,
                    "dropping an uninterpretable format string"
                );
                self.dictionary.push(None);
            }
        }
        Ok(())
    }

    fn alloc_fragment(&mut self) -> Box<BufferFragment> {
        match self.free_fragments.pop() {
            Some(fragment) => fragment,
            None => Box::new(BufferFragment::new(self.max_extent_size)),
        }
    }

    fn free_fragment(&mut self, mut fragment: Box<BufferFragment>) {
        fragment.reset();
        self.free_fragments.push(fragment);
    }

    /// Replays the file in arrival order. Returns the number of records
    /// decoded.
    pub fn decompress_unordered(&mut self, out: &mut dyn Write) -> anyhow::Result<u64> {
        self.decompress_unordered_filtered(out, None)
    }

    /// Arrival-order replay with an optional per-record aggregation hook.
    pub fn decompress_unordered_filtered(
        &mut self,
        out: &mut dyn Write,
        mut aggregation: Option<Aggregation<'_>>,
    ) -> anyhow::Result<u64> {
        if !self.good {
            bail!("no valid log file is open");
        }
        let mut msg = LogMessage::new();
        let mut fragment = self.alloc_fragment();

        let result = (|| -> anyhow::Result<()> {
            loop {
                let Some(entry) = self.peek_entry()? else {
                    return Ok(());
                };
                let Some(reader) = self.input.as_mut() else {
                    return Ok(());
                };
                match entry {
                    EntryType::BufferExtent => {
                        if fragment
                            .read_buffer_extent(reader)
                            .context("corrupted buffer extent")?
                            .is_none()
                        {
                            // Truncated tail entry: ignore it and stop.
                            return Ok(());
                        }
                        self.num_buffer_fragments_read += 1;
                        while fragment.has_next() {
                            fragment.decompress_next(
                                Some(&mut *out),
                                &self.checkpoint,
                                &self.dictionary,
                                &mut msg,
                                aggregation.as_mut(),
                            )?;
                            self.log_msgs_printed += 1;
                        }
                    }
                    EntryType::Checkpoint => {
                        self.read_dictionary_inline(true)?;
                        writeln!(out, "\n# New execution started")?;
                    }
                    EntryType::LogMsgsOrDic => {
                        self.read_dictionary_fragment_inline()?;
                    }
                    EntryType::Invalid => self.skip_padding()?,
                }
            }
        })();
        self.free_fragment(fragment);
        if let Err(err) = result {
            self.good = false;
            return Err(err);
        }

        writeln!(
            out,
            "\n\n# Decompression Complete after printing {} log messages",
            self.log_msgs_printed
        )?;
        Ok(self.log_msgs_printed)
    }

    /// Replays the file in chronological order. The compressor guarantees
    /// a record is never reordered across more than one full pass over the
    /// staging buffers, so buffering three stages of extents and merging
    /// by next-record timestamp restores the true order.
    pub fn decompress_ordered(&mut self, out: &mut dyn Write) -> anyhow::Result<u64> {
        if !self.good {
            bail!("no valid log file is open");
        }
        let mut msg = LogMessage::new();
        let mut stages: [BinaryHeap<StagedFragment>; STAGES_TO_BUFFER] = Default::default();
        let mut stages_buffered = 0usize;

        let result = (|| -> anyhow::Result<()> {
            'file: loop {
                // All stages must drain before a new execution's checkpoint
                // is crossed, and at end of file.
                let mut must_deplete_all_stages = false;

                // Step 1: buffer extents until enough stages accumulate.
                loop {
                    let Some(entry) = self.peek_entry()? else {
                        must_deplete_all_stages = true;
                        if !stages[stages_buffered].is_empty() {
                            stages_buffered += 1;
                        }
                        break;
                    };
                    let mut new_stage = false;
                    match entry {
                        EntryType::BufferExtent => {
                            let mut fragment = self.alloc_fragment();
                            let Some(reader) = self.input.as_mut() else {
                                return Ok(());
                            };
                            match fragment
                                .read_buffer_extent(reader)
                                .context("corrupted buffer extent")?
                            {
                                Some(wrap_around) => {
                                    self.num_buffer_fragments_read += 1;
                                    new_stage = wrap_around;
                                    if fragment.has_next() {
                                        stages[stages_buffered].push(StagedFragment { fragment });
                                    } else {
                                        self.free_fragment(fragment);
                                    }
                                }
                                None => {
                                    // Truncated tail: flush what we have.
                                    self.free_fragment(fragment);
                                    must_deplete_all_stages = true;
                                }
                            }
                        }
                        EntryType::Checkpoint => {
                            if stages_buffered > 0 || !stages[0].is_empty() {
                                must_deplete_all_stages = true;
                            } else {
                                self.read_dictionary_inline(true)?;
                                writeln!(out, "\n# New execution started")?;
                            }
                        }
                        EntryType::LogMsgsOrDic => self.read_dictionary_fragment_inline()?,
                        EntryType::Invalid => self.skip_padding()?,
                    }

                    if self.at_eof()? {
                        must_deplete_all_stages = true;
                    }
                    if new_stage || (must_deplete_all_stages && !stages[stages_buffered].is_empty())
                    {
                        stages_buffered += 1;
                    }
                    if must_deplete_all_stages || stages_buffered == STAGES_TO_BUFFER {
                        break;
                    }
                }

                // Steps 2 and 3: merge by the smallest next timestamp
                // across the buffered stages.
                loop {
                    let mut min_stage: Option<usize> = None;
                    for (index, stage) in stages.iter().enumerate().take(stages_buffered) {
                        if let Some(front) = stage.peek() {
                            let better = match min_stage {
                                None => true,
                                Some(current) => {
                                    // Infallible: min_stage only holds
                                    // non-empty stages.
                                    stages[current]
                                        .peek()
                                        .map(|m| front.key() < m.key())
                                        .unwrap_or(true)
                                }
                            };
                            if better {
                                min_stage = Some(index);
                            }
                        }
                    }
                    let Some(min_stage) = min_stage else {
                        // Every closed stage is drained; rotate so the
                        // stage still being filled lands at index zero.
                        stages.rotate_left(stages_buffered);
                        stages_buffered = 0;
                        break;
                    };

                    // Infallible: min_stage is non-empty by construction.
                    let Some(mut staged) = stages[min_stage].pop() else {
                        break;
                    };
                    staged.fragment.decompress_next(
                        Some(&mut *out),
                        &self.checkpoint,
                        &self.dictionary,
                        &mut msg,
                        None,
                    )?;
                    self.log_msgs_printed += 1;
                    if staged.fragment.has_next() {
                        stages[min_stage].push(staged);
                    } else {
                        self.free_fragment(staged.fragment);
                    }

                    // When the oldest stage drains, everything shifts left
                    // and reading may resume.
                    if stages[0].is_empty() && stages_buffered > 0 {
                        stages.rotate_left(1);
                        stages_buffered -= 1;
                        if !must_deplete_all_stages {
                            break;
                        }
                    }
                }

                if self.at_eof()? && stages_buffered == 0 && stages[0].is_empty() {
                    break 'file;
                }
            }
            Ok(())
        })();

        for stage in stages {
            for staged in stage.into_vec() {
                self.free_fragment(staged.fragment);
            }
        }
        if let Err(err) = result {
            self.good = false;
            return Err(err);
        }
        Ok(self.log_msgs_printed)
    }

    /// Iterative interface: decodes exactly one record per call in arrival
    /// order, filling `msg` (and printing when `out` is given). False once
    /// the file is exhausted.
    pub fn next_log_statement(
        &mut self,
        msg: &mut LogMessage,
        mut out: Option<&mut dyn Write>,
    ) -> anyhow::Result<bool> {
        if self.current.has_next() {
            let mut current = std::mem::replace(
                &mut self.current,
                Box::new(BufferFragment::new(0)),
            );
            let decoded = current.decompress_next(
                out.as_mut().map(|w| &mut **w as &mut dyn Write),
                &self.checkpoint,
                &self.dictionary,
                msg,
                None,
            );
            self.current = current;
            if decoded? {
                self.log_msgs_printed += 1;
                return Ok(true);
            }
        }

        msg.reset(None, u32::MAX, 0);
        if !self.good {
            return Ok(false);
        }

        while !self.current.has_next() {
            let Some(entry) = self.peek_entry()? else {
                return Ok(false);
            };
            match entry {
                EntryType::BufferExtent => {
                    let mut current = std::mem::replace(
                        &mut self.current,
                        Box::new(BufferFragment::new(0)),
                    );
                    let Some(reader) = self.input.as_mut() else {
                        self.current = current;
                        return Ok(false);
                    };
                    let read = current.read_buffer_extent(reader);
                    self.current = current;
                    match read.context("corrupted buffer extent") {
                        Ok(Some(_)) => self.num_buffer_fragments_read += 1,
                        Ok(None) => return Ok(false),
                        Err(err) => {
                            self.good = false;
                            return Err(err);
                        }
                    }
                }
                EntryType::Checkpoint => {
                    self.read_dictionary_inline(true)?;
                    if let Some(out) = out.as_mut() {
                        writeln!(out, "\n# New execution started")?;
                    }
                }
                EntryType::LogMsgsOrDic => self.read_dictionary_fragment_inline()?,
                EntryType::Invalid => self.skip_padding()?,
            }
        }

        let mut current = std::mem::replace(&mut self.current, Box::new(BufferFragment::new(0)));
        let decoded = current.decompress_next(
            out.as_mut().map(|w| &mut **w as &mut dyn Write),
            &self.checkpoint,
            &self.dictionary,
            msg,
            None,
        );
        self.current = current;
        if decoded? {
            self.log_msgs_printed += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn read_dictionary_inline(&mut self, flush: bool) -> anyhow::Result<()> {
        let Some(mut reader) = self.input.take() else {
            bail!("no input file");
        };
        let result = self.read_dictionary(&mut reader, flush);
        self.input = Some(reader);
        if result.is_err() {
            self.good = false;
        }
        result
    }

    fn read_dictionary_fragment_inline(&mut self) -> anyhow::Result<()> {
        let Some(mut reader) = self.input.take() else {
            bail!("no input file");
        };
        let result = self.read_dictionary_fragment(&mut reader);
        self.input = Some(reader);
        if result.is_err() {
            self.good = false;
        }
        result
    }

    /// Entry tag under the read cursor, without consuming it. `None` at
    /// end of file.
    fn peek_entry(&mut self) -> anyhow::Result<Option<EntryType>> {
        let Some(reader) = self.input.as_mut() else {
            return Ok(None);
        };
        let buf = reader.fill_buf().context("could not read the log file")?;
        Ok(buf.first().map(|&b| entry_type(b)))
    }

    fn at_eof(&mut self) -> anyhow::Result<bool> {
        let Some(reader) = self.input.as_mut() else {
            return Ok(true);
        };
        Ok(reader
            .fill_buf()
            .context("could not read the log file")?
            .is_empty())
    }

    /// Consumes NUL padding byte by byte until a recognizable tag shows
    /// up.
    fn skip_padding(&mut self) -> anyhow::Result<()> {
        let Some(reader) = self.input.as_mut() else {
            return Ok(());
        };
        loop {
            let buf = reader.fill_buf().context("could not read the log file")?;
            match buf.first() {
                Some(&byte) if entry_type(byte) == EntryType::Invalid => reader.consume(1),
                _ => return Ok(()),
            }
        }
    }
}
