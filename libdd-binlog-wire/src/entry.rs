// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The framed entry layouts of the compressed log. Every entry carries its
//! 2-bit tag in the low bits of the first byte so one-byte peeks always
//! identify what follows.

use crate::packer::{pack_i64, pack_u64, unpack_i64, unpack_u64};
use crate::WireError;
use static_assertions::const_assert;

/// Byte size of the record header each call site stages ahead of its raw
/// argument bytes.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Fixed byte size of a checkpoint: tag, rdtsc, unix time, cycles per
/// second, dictionary byte count, dictionary entry total.
pub const CHECKPOINT_SIZE: usize = 1 + 8 + 8 + 8 + 4 + 4;

/// Fixed prefix of a buffer extent: the packed tag byte plus the unpacked
/// 32-bit length.
pub const EXTENT_PREFIX_SIZE: usize = 1 + 4;

/// Worst-case buffer extent header: the prefix plus a fully un-compacted
/// producer id.
pub const MAX_EXTENT_HEADER_SIZE: usize = EXTENT_PREFIX_SIZE + 4;

/// Dictionary fragment header: tag plus 30-bit byte length in one word,
/// then the running entry total.
pub const DICTIONARY_FRAGMENT_HEADER_SIZE: usize = 4 + 4;

/// Fixed part of an on-disk dictionary entry: severity, line, filename
/// length, format-string length.
pub const LOG_INFO_HEADER_SIZE: usize = 1 + 4 + 2 + 2;

/// Worst case for a compressed record header: tag byte, 4 id bytes, 8
/// timestamp-delta bytes.
pub const MAX_RECORD_HEADER_SIZE: usize = 1 + 4 + 8;

const_assert!(CHECKPOINT_SIZE == 33);

/// The four entry kinds distinguishable from a one-byte peek. `Invalid` is
/// deliberately zero so the NUL padding that rounds direct-I/O writes up to
/// 512 bytes reads back as skippable entries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryType {
    Invalid = 0,
    /// A compressed log record inside a buffer extent, or a dictionary
    /// fragment at the top level.
    LogMsgsOrDic = 1,
    BufferExtent = 2,
    Checkpoint = 3,
}

/// Reads the entry tag out of the first byte of an entry.
#[inline]
pub fn entry_type(byte: u8) -> EntryType {
    match byte & 0x03 {
        0 => EntryType::Invalid,
        1 => EntryType::LogMsgsOrDic,
        2 => EntryType::BufferExtent,
        _ => EntryType::Checkpoint,
    }
}

#[inline]
fn need(buf: &[u8], pos: usize, bytes: usize) -> Result<(), WireError> {
    let available = buf.len().saturating_sub(pos);
    if available < bytes {
        return Err(WireError::Truncated {
            needed: bytes,
            available,
        });
    }
    Ok(())
}

/// Header of an uncompressed record as staged by a producer thread.
/// `entry_size` covers the header and the raw argument payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RecordHeader {
    pub fmt_id: u32,
    pub entry_size: u32,
    pub timestamp: u64,
}

impl RecordHeader {
    pub fn write(&self, buf: &mut [u8], pos: &mut usize) -> Result<(), WireError> {
        need(buf, *pos, RECORD_HEADER_SIZE)?;
        buf[*pos..*pos + 4].copy_from_slice(&self.fmt_id.to_le_bytes());
        buf[*pos + 4..*pos + 8].copy_from_slice(&self.entry_size.to_le_bytes());
        buf[*pos + 8..*pos + 16].copy_from_slice(&self.timestamp.to_le_bytes());
        *pos += RECORD_HEADER_SIZE;
        Ok(())
    }

    pub fn read(buf: &[u8], pos: usize) -> Result<RecordHeader, WireError> {
        need(buf, pos, RECORD_HEADER_SIZE)?;
        let mut quad = [0u8; 4];
        let mut octet = [0u8; 8];
        quad.copy_from_slice(&buf[pos..pos + 4]);
        let fmt_id = u32::from_le_bytes(quad);
        quad.copy_from_slice(&buf[pos + 4..pos + 8]);
        let entry_size = u32::from_le_bytes(quad);
        octet.copy_from_slice(&buf[pos + 8..pos + 16]);
        let timestamp = u64::from_le_bytes(octet);
        Ok(RecordHeader {
            fmt_id,
            entry_size,
            timestamp,
        })
    }
}

/// Re-encodes a record header as a compressed record: one packed byte
/// holding the tag, the extra id byte count (stored minus one to fit two
/// bits), and the timestamp pack nibble, followed by the packed id and the
/// packed delta against the previous record in this encoder run.
pub fn encode_record_header(
    buf: &mut [u8],
    pos: &mut usize,
    fmt_id: u32,
    timestamp: u64,
    last_timestamp: u64,
) -> Result<usize, WireError> {
    need(buf, *pos, MAX_RECORD_HEADER_SIZE)?;
    let start = *pos;
    *pos += 1;
    let id_nibble = pack_u64(buf, pos, fmt_id as u64);
    let delta = timestamp.wrapping_sub(last_timestamp) as i64;
    let ts_nibble = pack_i64(buf, pos, delta);
    buf[start] = EntryType::LogMsgsOrDic as u8 | ((id_nibble - 1) << 2) | (ts_nibble << 4);
    Ok(*pos - start)
}

/// Inverts [`encode_record_header`]. Returns `None` when the bytes at `pos`
/// do not carry the record tag, leaving the cursor untouched.
pub fn decode_record_header(
    buf: &[u8],
    pos: &mut usize,
    last_timestamp: u64,
) -> Result<Option<(u32, u64)>, WireError> {
    need(buf, *pos, 1)?;
    let header = buf[*pos];
    if entry_type(header) != EntryType::LogMsgsOrDic {
        return Ok(None);
    }
    *pos += 1;
    let id_nibble = ((header >> 2) & 0x03) + 1;
    let ts_nibble = header >> 4;
    let fmt_id = unpack_u64(buf, pos, id_nibble)? as u32;
    let delta = unpack_i64(buf, pos, ts_nibble)?;
    Ok(Some((fmt_id, last_timestamp.wrapping_add(delta as u64))))
}

/// Time-base anchor written at the start of every log file (and again when
/// a later execution appends to it). `new_metadata_bytes` dictionary bytes
/// follow the fixed part when a full dictionary is embedded.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Checkpoint {
    pub rdtsc: u64,
    pub unix_time: i64,
    pub cycles_per_second: f64,
    pub new_metadata_bytes: u32,
    pub total_metadata_entries: u32,
}

impl Checkpoint {
    pub fn write(&self, buf: &mut [u8], pos: &mut usize) -> Result<(), WireError> {
        need(buf, *pos, CHECKPOINT_SIZE)?;
        buf[*pos] = EntryType::Checkpoint as u8;
        buf[*pos + 1..*pos + 9].copy_from_slice(&self.rdtsc.to_le_bytes());
        buf[*pos + 9..*pos + 17].copy_from_slice(&self.unix_time.to_le_bytes());
        buf[*pos + 17..*pos + 25].copy_from_slice(&self.cycles_per_second.to_le_bytes());
        buf[*pos + 25..*pos + 29].copy_from_slice(&self.new_metadata_bytes.to_le_bytes());
        buf[*pos + 29..*pos + 33].copy_from_slice(&self.total_metadata_entries.to_le_bytes());
        *pos += CHECKPOINT_SIZE;
        Ok(())
    }

    pub fn read(buf: &[u8]) -> Result<Checkpoint, WireError> {
        need(buf, 0, CHECKPOINT_SIZE)?;
        if entry_type(buf[0]) != EntryType::Checkpoint {
            return Err(WireError::UnexpectedEntry {
                expected: "checkpoint",
                found: buf[0] & 0x03,
            });
        }
        let mut octet = [0u8; 8];
        let mut quad = [0u8; 4];
        octet.copy_from_slice(&buf[1..9]);
        let rdtsc = u64::from_le_bytes(octet);
        octet.copy_from_slice(&buf[9..17]);
        let unix_time = i64::from_le_bytes(octet);
        octet.copy_from_slice(&buf[17..25]);
        let cycles_per_second = f64::from_le_bytes(octet);
        quad.copy_from_slice(&buf[25..29]);
        let new_metadata_bytes = u32::from_le_bytes(quad);
        quad.copy_from_slice(&buf[29..33]);
        let total_metadata_entries = u32::from_le_bytes(quad);
        Ok(Checkpoint {
            rdtsc,
            unix_time,
            cycles_per_second,
            new_metadata_bytes,
            total_metadata_entries,
        })
    }
}

/// Decoded fixed prefix of a buffer extent. When `is_short` the producer id
/// sits directly in `nibble_or_id`; otherwise it is the pack nibble for the
/// id bytes that follow the prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExtentPrefix {
    pub wrap_around: bool,
    pub is_short: bool,
    pub nibble_or_id: u8,
    pub length: u32,
}

/// Starts a buffer extent for `buffer_id`. The 32-bit length field is left
/// unpacked on purpose so it can be patched as more records land in the
/// extent; its buffer offset is returned for that. The initial length
/// covers just the header.
pub fn encode_extent_start(
    buf: &mut [u8],
    pos: &mut usize,
    buffer_id: u32,
    wrap_around: bool,
) -> Result<usize, WireError> {
    need(buf, *pos, MAX_EXTENT_HEADER_SIZE)?;
    let start = *pos;
    let length_offset = start + 1;
    *pos += EXTENT_PREFIX_SIZE;

    let (is_short, nibble) = if buffer_id < (1 << 4) {
        (true, buffer_id as u8)
    } else {
        (false, pack_u64(buf, pos, buffer_id as u64))
    };
    buf[start] = EntryType::BufferExtent as u8
        | (u8::from(wrap_around) << 2)
        | (u8::from(is_short) << 3)
        | (nibble << 4);

    let length = (*pos - start) as u32;
    buf[length_offset..length_offset + 4].copy_from_slice(&length.to_le_bytes());
    Ok(length_offset)
}

/// Grows the length field of an in-progress extent in place.
pub fn patch_extent_length(buf: &mut [u8], length_offset: usize, additional: u32) {
    let mut quad = [0u8; 4];
    quad.copy_from_slice(&buf[length_offset..length_offset + 4]);
    let length = u32::from_le_bytes(quad) + additional;
    buf[length_offset..length_offset + 4].copy_from_slice(&length.to_le_bytes());
}

pub fn decode_extent_prefix(buf: &[u8]) -> Result<ExtentPrefix, WireError> {
    need(buf, 0, EXTENT_PREFIX_SIZE)?;
    if entry_type(buf[0]) != EntryType::BufferExtent {
        return Err(WireError::UnexpectedEntry {
            expected: "buffer extent",
            found: buf[0] & 0x03,
        });
    }
    let mut quad = [0u8; 4];
    quad.copy_from_slice(&buf[1..5]);
    Ok(ExtentPrefix {
        wrap_around: buf[0] & 0x04 != 0,
        is_short: buf[0] & 0x08 != 0,
        nibble_or_id: buf[0] >> 4,
        length: u32::from_le_bytes(quad),
    })
}

/// Resolves the producer id of an extent whose prefix has been decoded.
/// `extent` must be the full extent bytes. Returns the id and the total
/// header length consumed.
pub fn decode_extent_id(extent: &[u8], prefix: &ExtentPrefix) -> Result<(u32, usize), WireError> {
    if prefix.is_short {
        return Ok((prefix.nibble_or_id as u32, EXTENT_PREFIX_SIZE));
    }
    let mut pos = EXTENT_PREFIX_SIZE;
    let id = unpack_u64(extent, &mut pos, prefix.nibble_or_id)? as u32;
    Ok((id, pos))
}

/// Writes a dictionary fragment header at `offset`. Call again once the
/// trailing entries are in place to patch the real byte count in.
pub fn encode_dictionary_fragment_header(
    buf: &mut [u8],
    offset: usize,
    new_metadata_bytes: u32,
    total_metadata_entries: u32,
) {
    let word = EntryType::LogMsgsOrDic as u32 | ((new_metadata_bytes & 0x3FFF_FFFF) << 2);
    buf[offset..offset + 4].copy_from_slice(&word.to_le_bytes());
    buf[offset + 4..offset + 8].copy_from_slice(&total_metadata_entries.to_le_bytes());
}

/// Returns (fragment byte count including this header, running entry
/// total).
pub fn decode_dictionary_fragment_header(buf: &[u8]) -> Result<(u32, u32), WireError> {
    need(buf, 0, DICTIONARY_FRAGMENT_HEADER_SIZE)?;
    if entry_type(buf[0]) != EntryType::LogMsgsOrDic {
        return Err(WireError::UnexpectedEntry {
            expected: "dictionary fragment",
            found: buf[0] & 0x03,
        });
    }
    let mut quad = [0u8; 4];
    quad.copy_from_slice(&buf[0..4]);
    let word = u32::from_le_bytes(quad);
    quad.copy_from_slice(&buf[4..8]);
    Ok((word >> 2, u32::from_le_bytes(quad)))
}

/// One decoded dictionary entry: the static information of a log site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogInfo {
    pub severity: u8,
    pub line: u32,
    pub filename: String,
    pub format: String,
}

/// Byte size [`encode_log_info`] will take for these strings. The stored
/// lengths include the NUL terminators.
pub fn log_info_encoded_size(filename: &str, format: &str) -> usize {
    LOG_INFO_HEADER_SIZE + filename.len() + 1 + format.len() + 1
}

pub fn encode_log_info(
    buf: &mut [u8],
    pos: &mut usize,
    severity: u8,
    line: u32,
    filename: &str,
    format: &str,
) -> Result<(), WireError> {
    let total = log_info_encoded_size(filename, format);
    need(buf, *pos, total)?;
    let filename_len = (filename.len() + 1) as u16;
    let format_len = (format.len() + 1) as u16;
    buf[*pos] = severity;
    buf[*pos + 1..*pos + 5].copy_from_slice(&line.to_le_bytes());
    buf[*pos + 5..*pos + 7].copy_from_slice(&filename_len.to_le_bytes());
    buf[*pos + 7..*pos + 9].copy_from_slice(&format_len.to_le_bytes());
    *pos += LOG_INFO_HEADER_SIZE;
    buf[*pos..*pos + filename.len()].copy_from_slice(filename.as_bytes());
    *pos += filename.len();
    buf[*pos] = 0;
    *pos += 1;
    buf[*pos..*pos + format.len()].copy_from_slice(format.as_bytes());
    *pos += format.len();
    buf[*pos] = 0;
    *pos += 1;
    Ok(())
}

pub fn decode_log_info(buf: &[u8], pos: &mut usize) -> Result<LogInfo, WireError> {
    need(buf, *pos, LOG_INFO_HEADER_SIZE)?;
    let severity = buf[*pos];
    let mut quad = [0u8; 4];
    quad.copy_from_slice(&buf[*pos + 1..*pos + 5]);
    let line = u32::from_le_bytes(quad);
    let mut pair = [0u8; 2];
    pair.copy_from_slice(&buf[*pos + 5..*pos + 7]);
    let filename_len = u16::from_le_bytes(pair) as usize;
    pair.copy_from_slice(&buf[*pos + 7..*pos + 9]);
    let format_len = u16::from_le_bytes(pair) as usize;
    *pos += LOG_INFO_HEADER_SIZE;

    let filename = take_nul_terminated(buf, pos, filename_len)?;
    let format = take_nul_terminated(buf, pos, format_len)?;
    Ok(LogInfo {
        severity,
        line,
        filename,
        format,
    })
}

fn take_nul_terminated(buf: &[u8], pos: &mut usize, len: usize) -> Result<String, WireError> {
    need(buf, *pos, len)?;
    let bytes = &buf[*pos..*pos + len];
    let Some((&0, text)) = bytes.split_last() else {
        return Err(WireError::UnterminatedString);
    };
    *pos += len;
    Ok(String::from_utf8_lossy(text).into_owned())
}
