// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-message "micro-code": the decoder's internal representation of a
//! printf format string. A format string is cut into [`PrintFragment`]s,
//! each holding at most one conversion specifier, so the decoder can
//! consume one argument at a time and print as it goes instead of
//! buffering all arguments first.

use anyhow::bail;
use lazy_static::lazy_static;
use regex::bytes::Regex;

lazy_static! {
    /// The printf specification grammar: flags, width, precision, length,
    /// specifier. Width and precision may be `*` (consumed from the
    /// argument stream at decode time).
    pub(crate) static ref SPECIFIER: Regex = compile_specifier();
}

#[allow(clippy::expect_used)]
fn compile_specifier() -> Regex {
    Regex::new(
        "^%\
         ([-+ #0]+)?\
         ([\\d]+|\\*)?\
         (\\.(\\d+|\\*))?\
         (hh|h|l|ll|j|z|Z|t|L)?\
         ([diuoxXfFeEgGaAcspn])",
    )
    .expect("the specifier grammar is a valid regex")
}

/// Argument category of one conversion, following the C printf families.
/// The runtime never produces `LongDouble` or `ConstWcharTPtr` arguments,
/// but the decoder still classifies them so foreign format strings fail
/// loudly instead of silently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FormatType {
    /// No argument; the fragment is literal text.
    None,
    UnsignedChar,
    UnsignedShortInt,
    UnsignedInt,
    UnsignedLongInt,
    UnsignedLongLongInt,
    UintmaxT,
    SizeT,
    WintT,
    SignedChar,
    ShortInt,
    Int,
    LongInt,
    LongLongInt,
    IntmaxT,
    PtrdiffT,
    Double,
    LongDouble,
    ConstVoidPtr,
    ConstCharPtr,
    ConstWcharTPtr,
}

impl FormatType {
    pub fn is_string(self) -> bool {
        matches!(self, FormatType::ConstCharPtr | FormatType::ConstWcharTPtr)
    }

    /// Bit width to sign-extend a packed value from, for the signed
    /// families. `None` for unsigned and non-integer categories.
    pub(crate) fn signed_bits(self) -> Option<u32> {
        match self {
            FormatType::SignedChar => Some(8),
            FormatType::ShortInt => Some(16),
            FormatType::Int | FormatType::WintT => Some(32),
            FormatType::LongInt
            | FormatType::LongLongInt
            | FormatType::IntmaxT
            | FormatType::PtrdiffT => Some(64),
            _ => None,
        }
    }

    /// Bit width to truncate a packed value to, for the unsigned families.
    pub(crate) fn unsigned_bits(self) -> Option<u32> {
        match self {
            FormatType::UnsignedChar => Some(8),
            FormatType::UnsignedShortInt => Some(16),
            FormatType::UnsignedInt => Some(32),
            FormatType::UnsignedLongInt
            | FormatType::UnsignedLongLongInt
            | FormatType::UintmaxT
            | FormatType::SizeT => Some(64),
            _ => None,
        }
    }
}

/// A slice of the original format string holding at most one conversion
/// specifier, plus what to pull from the packed argument stream for it.
#[derive(Clone, Debug, PartialEq)]
pub struct PrintFragment {
    pub arg_type: FormatType,
    pub has_dynamic_width: bool,
    pub has_dynamic_precision: bool,
    pub fragment: String,
}

/// The decoded static description of one log site, rebuilt from the
/// on-disk dictionary.
#[derive(Clone, Debug)]
pub struct FormatMetadata {
    /// Nibbles in a record's packed stream: one per non-string conversion
    /// plus one per dynamic width or precision.
    pub num_nibbles: u16,
    pub log_level: u8,
    pub line_number: u32,
    pub filename: String,
    /// The original format string, kept for aggregation callbacks.
    pub format: String,
    pub fragments: Vec<PrintFragment>,
}

/// Maps a `(length, specifier)` pair to its argument category, mirroring
/// the printf reference table. `None` marks an unsupported combination.
fn format_type(length: &str, specifier: u8) -> Option<FormatType> {
    use FormatType::*;

    match specifier {
        b'd' | b'i' => {
            if length.is_empty() {
                return Some(Int);
            }
            if length.len() == 2 {
                if length.starts_with('h') {
                    return Some(SignedChar);
                }
                if length.starts_with('l') {
                    return Some(LongLongInt);
                }
            }
            match length.as_bytes()[0] {
                b'h' => Some(ShortInt),
                b'l' => Some(LongInt),
                b'j' => Some(IntmaxT),
                b'z' => Some(SizeT),
                b't' => Some(PtrdiffT),
                _ => Option::None,
            }
        }
        b'u' | b'o' | b'x' | b'X' => {
            if length.is_empty() {
                return Some(UnsignedInt);
            }
            if length.len() == 2 {
                if length.starts_with('h') {
                    return Some(UnsignedChar);
                }
                if length.starts_with('l') {
                    return Some(UnsignedLongLongInt);
                }
            }
            match length.as_bytes()[0] {
                b'h' => Some(UnsignedShortInt),
                b'l' => Some(UnsignedLongInt),
                b'j' => Some(UintmaxT),
                b'z' => Some(SizeT),
                b't' => Some(PtrdiffT),
                _ => Option::None,
            }
        }
        b's' => {
            if length.is_empty() {
                Some(ConstCharPtr)
            } else if length.starts_with('l') {
                Some(ConstWcharTPtr)
            } else {
                Option::None
            }
        }
        b'p' => {
            if length.is_empty() {
                Some(ConstVoidPtr)
            } else {
                Option::None
            }
        }
        b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A' => {
            if length == "L" {
                Some(LongDouble)
            } else {
                Some(Double)
            }
        }
        b'c' => {
            if length.is_empty() {
                Some(Int)
            } else if length.starts_with('l') {
                Some(WintT)
            } else {
                Option::None
            }
        }
        _ => Option::None,
    }
}

/// Splits `format` into print fragments. Escapes: `\` skips the next
/// character, and an even run of `%` is a literal percent, not a
/// specifier. Fails on a specifier outside the supported table; the
/// caller keeps the id unrenderable.
pub fn create_micro_code(
    format: &str,
    filename: &str,
    line_number: u32,
    severity: u8,
) -> anyhow::Result<FormatMetadata> {
    let bytes = format.as_bytes();
    let mut fragments: Vec<PrintFragment> = Vec::new();
    let mut num_nibbles = 0u16;

    let mut i = 0;
    let mut consecutive_percents = 0;
    let mut start_of_next_fragment = 0;

    while i < bytes.len() {
        let c = bytes[i];
        if c == b'\\' {
            i += 2;
            continue;
        }
        if c != b'%' {
            i += 1;
            consecutive_percents = 0;
            continue;
        }

        consecutive_percents += 1;
        let captures = if consecutive_percents % 2 == 0 {
            None
        } else {
            SPECIFIER.captures(&bytes[i..])
        };
        let Some(captures) = captures else {
            i += 1;
            continue;
        };
        consecutive_percents = 0;

        let matched = captures.get(0).map(|m| m.len()).unwrap_or(0);
        let width_is_dynamic = captures.get(2).map(|m| m.as_bytes() == b"*").unwrap_or(false);
        let precision_is_dynamic = captures.get(4).map(|m| m.as_bytes() == b"*").unwrap_or(false);
        let length = captures
            .get(5)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .unwrap_or_default();
        let specifier = captures
            .get(6)
            .and_then(|m| m.as_bytes().first().copied())
            .unwrap_or(0);

        let Some(arg_type) = format_type(&length, specifier) else {
            bail!(
                "could not process the conversion {:?} in {:?}",
                String::from_utf8_lossy(&bytes[i..i + matched]),
                format
            );
        };
        i += matched;

        if specifier != b's' {
            num_nibbles += 1;
        }
        if width_is_dynamic {
            num_nibbles += 1;
        }
        if precision_is_dynamic {
            num_nibbles += 1;
        }

        fragments.push(PrintFragment {
            arg_type,
            has_dynamic_width: width_is_dynamic,
            has_dynamic_precision: precision_is_dynamic,
            fragment: String::from_utf8_lossy(&bytes[start_of_next_fragment..i]).into_owned(),
        });
        start_of_next_fragment = i;
    }

    match fragments.last_mut() {
        // No specifiers at all: one literal fragment covers the string.
        None => fragments.push(PrintFragment {
            arg_type: FormatType::None,
            has_dynamic_width: false,
            has_dynamic_precision: false,
            fragment: format.to_owned(),
        }),
        // Extend the last fragment with the trailing literal text.
        Some(last) => last
            .fragment
            .push_str(&String::from_utf8_lossy(&bytes[start_of_next_fragment..])),
    }

    Ok(FormatMetadata {
        num_nibbles,
        log_level: severity,
        line_number,
        filename: filename.to_owned(),
        format: format.to_owned(),
        fragments,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragments(format: &str) -> FormatMetadata {
        create_micro_code(format, "test.cc", 1, 2).unwrap()
    }

    #[test]
    fn plain_string_is_one_literal_fragment() {
        let meta = fragments("Hello, world!");
        assert_eq!(0, meta.num_nibbles);
        assert_eq!(1, meta.fragments.len());
        assert_eq!(FormatType::None, meta.fragments[0].arg_type);
        assert_eq!("Hello, world!", meta.fragments[0].fragment);
    }

    #[test]
    fn splits_just_past_each_specifier() {
        let meta = fragments("a=%d b=%s tail");
        assert_eq!(2, meta.fragments.len());
        assert_eq!("a=%d", meta.fragments[0].fragment);
        assert_eq!(FormatType::Int, meta.fragments[0].arg_type);
        assert_eq!(" b=%s tail", meta.fragments[1].fragment);
        assert_eq!(FormatType::ConstCharPtr, meta.fragments[1].arg_type);
        // Only %d needs a nibble; strings are NUL-delimited.
        assert_eq!(1, meta.num_nibbles);
    }

    #[test]
    fn length_modifiers_map_to_families() {
        let meta = fragments("%hhd %hd %ld %lld %jd %zd %td %hu %lu %llu %lc");
        let types: Vec<FormatType> = meta.fragments.iter().map(|f| f.arg_type).collect();
        assert_eq!(
            vec![
                FormatType::SignedChar,
                FormatType::ShortInt,
                FormatType::LongInt,
                FormatType::LongLongInt,
                FormatType::IntmaxT,
                FormatType::SizeT,
                FormatType::PtrdiffT,
                FormatType::UnsignedShortInt,
                FormatType::UnsignedLongInt,
                FormatType::UnsignedLongLongInt,
                FormatType::WintT,
            ],
            types
        );
    }

    #[test]
    fn floats_pointers_and_wide_strings() {
        let meta = fragments("%f %e %G %a %Lf %p %ls");
        let types: Vec<FormatType> = meta.fragments.iter().map(|f| f.arg_type).collect();
        assert_eq!(
            vec![
                FormatType::Double,
                FormatType::Double,
                FormatType::Double,
                FormatType::Double,
                FormatType::LongDouble,
                FormatType::ConstVoidPtr,
                FormatType::ConstWcharTPtr,
            ],
            types
        );
    }

    #[test]
    fn dynamic_width_and_precision_take_nibbles() {
        let meta = fragments("%*.*f and %.*s");
        assert_eq!(2, meta.fragments.len());
        assert!(meta.fragments[0].has_dynamic_width);
        assert!(meta.fragments[0].has_dynamic_precision);
        assert!(!meta.fragments[1].has_dynamic_width);
        assert!(meta.fragments[1].has_dynamic_precision);
        // %f plus its two stars, plus the string's star.
        assert_eq!(4, meta.num_nibbles);
    }

    #[test]
    fn doubled_percent_is_literal() {
        let meta = fragments("100%% done %d");
        assert_eq!(1, meta.fragments.len());
        assert_eq!("100%% done %d", meta.fragments[0].fragment);
        assert_eq!(FormatType::Int, meta.fragments[0].arg_type);
    }

    #[test]
    fn backslash_escapes_skip_the_next_character() {
        let meta = fragments("literal \\%d here %u");
        assert_eq!(1, meta.fragments.len());
        assert_eq!(FormatType::UnsignedInt, meta.fragments[0].arg_type);
    }

    #[test]
    fn specifiers_without_spaces() {
        let meta = fragments("%d%s%u");
        assert_eq!(3, meta.fragments.len());
        assert_eq!("%d", meta.fragments[0].fragment);
        assert_eq!("%s", meta.fragments[1].fragment);
        assert_eq!("%u", meta.fragments[2].fragment);
    }

    #[test]
    fn unknown_conversions_roll_back() {
        assert!(create_micro_code("count: %n", "t.cc", 1, 2).is_err());
        assert!(create_micro_code("%hs", "t.cc", 1, 2).is_err());
        assert!(create_micro_code("%lp", "t.cc", 1, 2).is_err());
    }

    #[test]
    fn format_string_is_preserved() {
        let meta = fragments("x=%d y=%d");
        assert_eq!("x=%d y=%d", meta.format);
        let rebuilt: String = meta.fragments.iter().map(|f| f.fragment.as_str()).collect();
        assert_eq!(meta.format, rebuilt);
    }
}
