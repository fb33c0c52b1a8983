// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reads one buffer extent out of the compressed log and interprets the
//! records inside it. A fragment is sized a little past the largest
//! staging buffer, so a whole extent always fits; the decoder keeps a free
//! list of them since the ordered replay holds several at once.

use crate::decoder::Aggregation;
use crate::format::{FormatMetadata, FormatType};
use crate::log_message::LogMessage;
use crate::printf::{render_fragment, RenderArg};
use anyhow::{anyhow, bail, Context};
use chrono::{Local, TimeZone};
use libdd_binlog_wire::packer::Nibbler;
use libdd_binlog_wire::{
    decode_extent_id, decode_extent_prefix, decode_record_header, Checkpoint, EXTENT_PREFIX_SIZE,
};
use std::borrow::Cow;
use std::io::{Read, Write};
use std::sync::Arc;

pub(crate) const LEVEL_NAMES: [&str; 5] = ["(none)", "ERROR", "WARNING", "NOTICE", "DEBUG"];

pub(crate) struct BufferFragment {
    /// Raw bytes of one extent, header included.
    storage: Vec<u8>,
    valid_bytes: usize,
    runtime_id: u32,
    /// Read cursor, always positioned after a record header.
    read_pos: usize,
    has_more: bool,
    /// Header of the record the cursor sits on, pre-decoded so the ordered
    /// replay can sort fragments by their next timestamp.
    next_log_id: u32,
    next_timestamp: u64,
}

impl BufferFragment {
    pub fn new(max_extent_size: usize) -> BufferFragment {
        BufferFragment {
            storage: vec![0; max_extent_size],
            valid_bytes: 0,
            runtime_id: u32::MAX,
            read_pos: 0,
            has_more: false,
            next_log_id: u32::MAX,
            next_timestamp: 0,
        }
    }

    pub fn reset(&mut self) {
        self.valid_bytes = 0;
        self.runtime_id = u32::MAX;
        self.read_pos = 0;
        self.has_more = false;
    }

    pub fn has_next(&self) -> bool {
        self.has_more
    }

    /// Timestamp of the next decodable record. Only meaningful while
    /// [`BufferFragment::has_next`] holds.
    pub fn next_timestamp(&self) -> u64 {
        self.next_timestamp
    }

    pub fn runtime_id(&self) -> u32 {
        self.runtime_id
    }

    /// Reads the extent at the reader's position. Returns the extent's
    /// wrap bit, or `None` when the file ends mid-entry (a truncated tail
    /// is ignored, not an error). Malformed framing is an error.
    pub fn read_buffer_extent(&mut self, reader: &mut impl Read) -> anyhow::Result<Option<bool>> {
        self.reset();

        let mut prefix_bytes = [0u8; EXTENT_PREFIX_SIZE];
        if read_fully(reader, &mut prefix_bytes)?.is_none() {
            return Ok(None);
        }
        let prefix = decode_extent_prefix(&prefix_bytes)?;
        let length = prefix.length as usize;
        if length < EXTENT_PREFIX_SIZE || length > self.storage.len() {
            bail!(
                "buffer extent length {length} is outside the valid range \
                 (max {})",
                self.storage.len()
            );
        }

        self.storage[..EXTENT_PREFIX_SIZE].copy_from_slice(&prefix_bytes);
        if read_fully(reader, &mut self.storage[EXTENT_PREFIX_SIZE..length])?.is_none() {
            self.reset();
            return Ok(None);
        }
        self.valid_bytes = length;

        let (runtime_id, header_len) = decode_extent_id(&self.storage[..length], &prefix)?;
        self.runtime_id = runtime_id;
        self.read_pos = header_len;

        // An extent can legitimately hold no records, e.g. when it only
        // marks a wrap or the output buffer filled right after the header.
        if self.read_pos == self.valid_bytes {
            self.has_more = false;
            return Ok(Some(prefix.wrap_around));
        }

        let mut pos = self.read_pos;
        match decode_record_header(&self.storage[..self.valid_bytes], &mut pos, 0)? {
            Some((log_id, timestamp)) => {
                self.read_pos = pos;
                self.next_log_id = log_id;
                self.next_timestamp = timestamp;
                self.has_more = true;
            }
            None => bail!("buffer extent does not start with a log record"),
        }
        Ok(Some(prefix.wrap_around))
    }

    /// Decodes the record at the cursor, optionally printing it, and
    /// pre-decodes the following record header. Returns false once the
    /// extent is drained.
    pub fn decompress_next(
        &mut self,
        out: Option<&mut dyn Write>,
        checkpoint: &Checkpoint,
        dictionary: &[Option<Arc<FormatMetadata>>],
        msg: &mut LogMessage,
        mut aggregation: Option<&mut Aggregation<'_>>,
    ) -> anyhow::Result<bool> {
        if self.read_pos > self.valid_bytes || !self.has_more {
            self.has_more = false;
            return Ok(false);
        }

        let metadata = dictionary
            .get(self.next_log_id as usize)
            .ok_or_else(|| {
                anyhow!(
                    "record references id {} beyond the dictionary ({} entries); \
                     the log is malformed",
                    self.next_log_id,
                    dictionary.len()
                )
            })?
            .clone()
            .ok_or_else(|| {
                anyhow!(
                    "record references id {} whose format string could not be \
                     interpreted",
                    self.next_log_id
                )
            })?;

        msg.reset(Some(metadata.clone()), self.next_log_id, self.next_timestamp);

        let mut line = String::new();
        if out.is_some() {
            self.render_context(&mut line, checkpoint, &metadata);
        }

        let payload = &self.storage[self.read_pos..self.valid_bytes];
        let mut nibbler = Nibbler::new(payload, metadata.num_nibbles as usize)?;
        let mut string_cursor = nibbler.packed_end();

        for fragment in &metadata.fragments {
            let width = if fragment.has_dynamic_width {
                let w = nibbler.next_i32()?;
                msg.push(w);
                Some(w)
            } else {
                None
            };
            let precision = if fragment.has_dynamic_precision {
                let p = nibbler.next_i32()?;
                msg.push(p);
                Some(p)
            } else {
                None
            };

            let owned_string;
            let arg = match fragment.arg_type {
                FormatType::None => RenderArg::None,
                FormatType::ConstCharPtr => {
                    let bytes = take_c_string(payload, &mut string_cursor)?;
                    owned_string = String::from_utf8_lossy(bytes);
                    msg.push_str(owned_string.as_ref());
                    RenderArg::Str(owned_string.as_ref())
                }
                FormatType::ConstWcharTPtr => {
                    let text = take_wide_string(payload, &mut string_cursor)?;
                    owned_string = Cow::Owned(text);
                    msg.push_str(owned_string.as_ref());
                    RenderArg::Str(owned_string.as_ref())
                }
                FormatType::Double => {
                    let value = nibbler.next_f64()?;
                    msg.push(value);
                    RenderArg::Double(value)
                }
                FormatType::LongDouble => {
                    bail!("long double arguments are unsupported")
                }
                FormatType::ConstVoidPtr => {
                    let value = nibbler.next_u64()?;
                    msg.push(value);
                    RenderArg::Pointer(value)
                }
                other => {
                    let raw = nibbler.next_u64()?;
                    if let Some(bits) = other.signed_bits() {
                        let value = sign_extend(raw, bits);
                        msg.push(value);
                        RenderArg::Signed(value)
                    } else {
                        let bits = other.unsigned_bits().unwrap_or(64);
                        let value = truncate(raw, bits);
                        msg.push(value);
                        RenderArg::Unsigned(value)
                    }
                }
            };

            render_fragment(&mut line, &fragment.fragment, &arg, width, precision);
        }

        if let Some(out) = out {
            line.push('\n');
            out.write_all(line.as_bytes())
                .context("could not write a decoded record")?;
        }
        if let Some(aggregation) = aggregation.take() {
            if aggregation.target_id == self.next_log_id {
                (aggregation.callback)(&metadata.format, msg);
            }
        }

        // Advance past this record's payload and pre-decode the next
        // header, which chains timestamp deltas.
        self.read_pos += string_cursor;
        if self.read_pos >= self.valid_bytes {
            self.has_more = false;
        } else {
            let mut pos = self.read_pos;
            match decode_record_header(
                &self.storage[..self.valid_bytes],
                &mut pos,
                self.next_timestamp,
            )? {
                Some((log_id, timestamp)) => {
                    self.read_pos = pos;
                    self.next_log_id = log_id;
                    self.next_timestamp = timestamp;
                }
                None => self.has_more = false,
            }
        }
        Ok(true)
    }

    /// The `time file:line LEVEL[producer]: ` prefix of an output line.
    fn render_context(&self, line: &mut String, checkpoint: &Checkpoint, meta: &FormatMetadata) {
        let delta_cycles = self.next_timestamp as i64 - checkpoint.rdtsc as i64;
        let seconds_since_checkpoint = delta_cycles as f64 / checkpoint.cycles_per_second;
        let mut whole_seconds = seconds_since_checkpoint.floor() as i64;
        let mut nanos = (seconds_since_checkpoint - whole_seconds as f64) * 1.0e9;
        if nanos < 0.0 {
            whole_seconds -= 1;
            nanos += 1.0e9;
        }

        let timestamp = match Local.timestamp_opt(checkpoint.unix_time + whole_seconds, 0) {
            chrono::LocalResult::Single(t) => t.format("%Y-%m-%d %H:%M:%S").to_string(),
            _ => "????-??-?? ??:??:??".to_owned(),
        };
        let level = LEVEL_NAMES
            .get(meta.log_level as usize)
            .copied()
            .unwrap_or("UNKNOWN");
        line.push_str(&format!(
            "{timestamp}.{:09} {}:{} {level}[{}]: ",
            nanos as u64, meta.filename, meta.line_number, self.runtime_id
        ));
    }
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    let shift = 64 - bits;
    ((raw as i64) << shift) >> shift
}

fn truncate(raw: u64, bits: u32) -> u64 {
    if bits >= 64 {
        raw
    } else {
        raw & ((1u64 << bits) - 1)
    }
}

/// Takes the NUL-terminated byte string at the cursor.
fn take_c_string<'a>(payload: &'a [u8], cursor: &mut usize) -> anyhow::Result<&'a [u8]> {
    let tail = &payload[*cursor..];
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| anyhow!("string argument is missing its terminator"))?;
    *cursor += end + 1;
    Ok(&tail[..end])
}

/// Takes a NUL-terminated sequence of 4-byte wide characters.
fn take_wide_string(payload: &[u8], cursor: &mut usize) -> anyhow::Result<String> {
    let mut text = String::new();
    loop {
        let tail = &payload[*cursor..];
        if tail.len() < 4 {
            bail!("wide string argument is missing its terminator");
        }
        let mut quad = [0u8; 4];
        quad.copy_from_slice(&tail[..4]);
        *cursor += 4;
        let unit = u32::from_le_bytes(quad);
        if unit == 0 {
            return Ok(text);
        }
        text.push(char::from_u32(unit).unwrap_or('\u{FFFD}'));
    }
}

/// `read_exact` that reports a clean EOF (even mid-buffer) as `None`
/// instead of an error, so truncated tails are skippable.
fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> anyhow::Result<Option<()>> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .context("could not read from the log file")?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    Ok(Some(()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extension_restores_narrow_values() {
        assert_eq!(-1i64, sign_extend(0xFF, 8));
        assert_eq!(-128i64, sign_extend(0xFF80, 16));
        assert_eq!(127i64, sign_extend(0x7F, 8));
        assert_eq!(-5i64, sign_extend((-5i64) as u64, 64));
    }

    #[test]
    fn truncation_masks_to_width() {
        assert_eq!(0x80, truncate(0xFF80, 8));
        assert_eq!(u64::MAX, truncate(u64::MAX, 64));
        assert_eq!(0xFFFF_FFFF, truncate(u64::MAX, 32));
    }

    #[test]
    fn c_string_consumption() {
        let payload = b"ab\0cd\0";
        let mut cursor = 0;
        assert_eq!(b"ab", take_c_string(payload, &mut cursor).unwrap());
        assert_eq!(b"cd", take_c_string(payload, &mut cursor).unwrap());
        assert_eq!(6, cursor);
        assert!(take_c_string(payload, &mut cursor).is_err());
    }

    #[test]
    fn wide_string_consumption() {
        let mut payload = Vec::new();
        for unit in ['h' as u32, 'i' as u32, 0] {
            payload.extend_from_slice(&unit.to_le_bytes());
        }
        let mut cursor = 0;
        assert_eq!("hi", take_wide_string(&payload, &mut cursor).unwrap());
        assert_eq!(12, cursor);
    }

    #[test]
    fn truncated_prefix_is_a_clean_end() {
        let mut fragment = BufferFragment::new(1024);
        let bytes: &[u8] = &[0x02, 0x05];
        assert_eq!(
            None,
            fragment.read_buffer_extent(&mut &bytes[..]).unwrap()
        );
    }

    #[test]
    fn oversize_extent_is_malformed() {
        let mut fragment = BufferFragment::new(64);
        // Tag 2 with a length far past the fragment's storage.
        let mut bytes = vec![0x02u8];
        bytes.extend_from_slice(&1_000_000u32.to_le_bytes());
        assert!(fragment.read_buffer_extent(&mut &bytes[..]).is_err());
    }
}
