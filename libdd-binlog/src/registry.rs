// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Static per-site information. Each distinct log invocation site registers
//! once and receives its index in the process-wide table as its id; the
//! table is append-only and the registration mutex is taken only on
//! registration and dictionary persistence.

use crate::args::ArgSlot;
use crate::LogLevel;
use libdd_binlog_wire::packer;
use std::sync::Arc;

/// Walks one record's raw argument bytes and emits nibbles, packed values,
/// and the string tail into the encoder output. `out` is guaranteed large
/// enough by the encoder's worst-case room check. Sites with generated
/// packers can substitute their own function; [`pack_args`] is the generic
/// slot-driven walker.
pub type PackFn = fn(codec: &Codec, arg_data: &[u8], out: &mut [u8], out_pos: &mut usize);

/// How to serialize one site's dynamic arguments: the nibble budget, the
/// per-argument layout tags, and the pack routine itself.
#[derive(Clone, Debug)]
pub struct Codec {
    pub num_nibbles: u16,
    pub slots: Box<[ArgSlot]>,
    pub pack: PackFn,
}

impl Codec {
    pub fn new(slots: Vec<ArgSlot>) -> Codec {
        let num_nibbles = slots.iter().filter(|s| s.consumes_nibble()).count() as u16;
        Codec {
            num_nibbles,
            slots: slots.into_boxed_slice(),
            pack: pack_args,
        }
    }
}

/// Immutable description of a log invocation site, alive for the process
/// lifetime once registered.
#[derive(Clone, Debug)]
pub struct StaticLogInfo {
    pub severity: LogLevel,
    pub filename: Arc<str>,
    pub line: u32,
    pub format: Arc<str>,
    pub codec: Arc<Codec>,
}

impl StaticLogInfo {
    pub fn new(
        severity: LogLevel,
        filename: &str,
        line: u32,
        format: &str,
        slots: Vec<ArgSlot>,
    ) -> StaticLogInfo {
        StaticLogInfo {
            severity,
            filename: Arc::from(filename),
            line,
            format: Arc::from(format),
            codec: Arc::new(Codec::new(slots)),
        }
    }
}

/// Reads a little-endian value of `$ty` spanning `$width` bytes at `$pos`,
/// bumping `$pos`.
macro_rules! read_le {
    ($buf:expr, $pos:expr, $ty:ty, $width:expr) => {{
        let mut bytes = [0u8; $width];
        bytes.copy_from_slice(&$buf[$pos..$pos + $width]);
        $pos += $width;
        <$ty>::from_le_bytes(bytes)
    }};
}

/// Generic pack routine: first pass packs the non-string slots and fills
/// the nibble block, second pass copies the NUL-terminated strings to the
/// tail so they land after every packed value.
pub fn pack_args(codec: &Codec, arg_data: &[u8], out: &mut [u8], out_pos: &mut usize) {
    let nibble_base = *out_pos;
    let nibble_len = packer::nibble_bytes(codec.num_nibbles as usize);
    out[nibble_base..nibble_base + nibble_len].fill(0);
    *out_pos += nibble_len;

    let mut nibble_index = 0;
    let mut in_pos = 0;
    for slot in codec.slots.iter() {
        let nibble = match *slot {
            ArgSlot::Str => {
                in_pos += staged_str_len(arg_data, in_pos);
                continue;
            }
            ArgSlot::I8 => packer::pack_i8(out, out_pos, read_le!(arg_data, in_pos, i8, 1)),
            ArgSlot::I16 => packer::pack_i16(out, out_pos, read_le!(arg_data, in_pos, i16, 2)),
            ArgSlot::I32 | ArgSlot::DynamicWidth | ArgSlot::DynamicPrecision => {
                packer::pack_i32(out, out_pos, read_le!(arg_data, in_pos, i32, 4))
            }
            ArgSlot::I64 => packer::pack_i64(out, out_pos, read_le!(arg_data, in_pos, i64, 8)),
            ArgSlot::U8 => packer::pack_u64(out, out_pos, read_le!(arg_data, in_pos, u8, 1) as u64),
            ArgSlot::U16 => {
                packer::pack_u64(out, out_pos, read_le!(arg_data, in_pos, u16, 2) as u64)
            }
            ArgSlot::U32 => {
                packer::pack_u64(out, out_pos, read_le!(arg_data, in_pos, u32, 4) as u64)
            }
            ArgSlot::U64 | ArgSlot::Pointer => {
                packer::pack_u64(out, out_pos, read_le!(arg_data, in_pos, u64, 8))
            }
            // Float arguments were promoted to double when staged.
            ArgSlot::F32 | ArgSlot::F64 => {
                packer::pack_f64(out, out_pos, read_le!(arg_data, in_pos, f64, 8))
            }
        };
        packer::set_nibble(out, nibble_base, nibble_index, nibble);
        nibble_index += 1;
    }

    let mut in_pos = 0;
    for slot in codec.slots.iter() {
        match *slot {
            ArgSlot::Str => {
                let len = staged_str_len(arg_data, in_pos);
                out[*out_pos..*out_pos + len].copy_from_slice(&arg_data[in_pos..in_pos + len]);
                *out_pos += len;
                in_pos += len;
            }
            other => {
                // Unwrap is fine: only Str lacks a width and it is handled
                // above.
                in_pos += other.staged_width().unwrap_or(0);
            }
        }
    }
}

/// Length of the NUL-terminated string at `pos`, terminator included. A
/// missing terminator takes the rest of the payload; the record was staged
/// by us, so that only happens for corrupted input.
fn staged_str_len(arg_data: &[u8], pos: usize) -> usize {
    match arg_data[pos..].iter().position(|&b| b == 0) {
        Some(idx) => idx + 1,
        None => arg_data.len() - pos,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::LogArg;
    use libdd_binlog_wire::packer::Nibbler;

    fn stage(args: &[LogArg<'_>]) -> Vec<u8> {
        let mut out = vec![0u8; args.iter().map(|a| a.staged_size()).sum()];
        let mut pos = 0;
        for arg in args {
            arg.write(&mut out, &mut pos);
        }
        out
    }

    #[test]
    fn packs_mixed_arguments() {
        let args = [
            LogArg::I32(-3),
            LogArg::Str("mid"),
            LogArg::U64(1 << 40),
            LogArg::F64(1.5),
        ];
        let codec = Codec::new(args.iter().map(LogArg::slot).collect());
        assert_eq!(3, codec.num_nibbles);

        let staged = stage(&args);
        let mut out = vec![0u8; 2 * staged.len() + 16];
        let mut pos = 0;
        (codec.pack)(&codec, &staged, &mut out, &mut pos);

        let mut nb = Nibbler::new(&out[..pos], codec.num_nibbles as usize).unwrap();
        assert_eq!(-3, nb.next_i64().unwrap());
        assert_eq!(1 << 40, nb.next_u64().unwrap());
        assert_eq!(1.5, nb.next_f64().unwrap());
        assert_eq!(b"mid\0", &out[nb.packed_end()..pos]);
    }

    #[test]
    fn strings_follow_all_packed_values() {
        let args = [LogArg::Str("a"), LogArg::I32(7), LogArg::Str("b")];
        let codec = Codec::new(args.iter().map(LogArg::slot).collect());
        let staged = stage(&args);
        let mut out = vec![0u8; 2 * staged.len() + 16];
        let mut pos = 0;
        (codec.pack)(&codec, &staged, &mut out, &mut pos);

        let mut nb = Nibbler::new(&out[..pos], 1).unwrap();
        assert_eq!(7, nb.next_i64().unwrap());
        assert_eq!(b"a\0b\0", &out[nb.packed_end()..pos]);
    }

    #[test]
    fn empty_argument_list() {
        let codec = Codec::new(Vec::new());
        let mut out = [0u8; 4];
        let mut pos = 0;
        (codec.pack)(&codec, &[], &mut out, &mut pos);
        assert_eq!(0, pos);
    }
}
