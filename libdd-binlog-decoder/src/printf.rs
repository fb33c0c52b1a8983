// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Renders one print fragment the way printf would: the literal text with
//! `%%` collapsed, and the fragment's single conversion applied to the
//! decoded argument. Covers the flag/width/precision behavior of the
//! d,i,u,o,x,X,c,s,p,f,F,e,E,g,G,a,A families; `%n` never reaches here
//! (micro-code creation refuses it).

use crate::format::SPECIFIER;

/// A decoded argument ready for rendering. Strings already point at
/// owned/borrowed UTF-8; integer values are widened to 64 bits with their
/// type's signedness applied.
pub(crate) enum RenderArg<'a> {
    None,
    Signed(i64),
    Unsigned(u64),
    Double(f64),
    Pointer(u64),
    Str(&'a str),
}

#[derive(Default)]
struct Flags {
    minus: bool,
    plus: bool,
    space: bool,
    hash: bool,
    zero: bool,
}

struct Conversion {
    flags: Flags,
    width: Option<usize>,
    precision: Option<usize>,
    specifier: u8,
    /// Byte span of the conversion inside the fragment.
    start: usize,
    end: usize,
}

/// Finds the fragment's conversion, honoring the same escape rules the
/// micro-code splitter uses.
fn find_conversion(fragment: &[u8]) -> Option<Conversion> {
    let mut i = 0;
    let mut consecutive_percents = 0;
    while i < fragment.len() {
        let c = fragment[i];
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
        if consecutive_percents % 2 == 0 {
            i += 1;
            continue;
        }
        let Some(captures) = SPECIFIER.captures(&fragment[i..]) else {
            i += 1;
            continue;
        };
        let all = captures.get(0)?;
        let mut flags = Flags::default();
        if let Some(m) = captures.get(1) {
            for &f in m.as_bytes() {
                match f {
                    b'-' => flags.minus = true,
                    b'+' => flags.plus = true,
                    b' ' => flags.space = true,
                    b'#' => flags.hash = true,
                    b'0' => flags.zero = true,
                    _ => {}
                }
            }
        }
        let parse = |m: Option<regex::bytes::Match>| -> Option<usize> {
            let bytes = m?.as_bytes();
            if bytes == b"*" {
                return None;
            }
            std::str::from_utf8(bytes).ok()?.parse().ok()
        };
        return Some(Conversion {
            width: parse(captures.get(2)),
            precision: parse(captures.get(4)),
            specifier: captures.get(6).map(|m| m.as_bytes()[0]).unwrap_or(0),
            flags,
            start: i,
            end: i + all.len(),
        });
    }
    None
}

/// Appends `text` with `%%` collapsed to `%`, as printf itself would emit
/// it. Split points sit on `%` bytes, so the slicing stays on char
/// boundaries.
fn push_literal(out: &mut String, text: &str) {
    let bytes = text.as_bytes();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 1 < bytes.len() && bytes[i + 1] == b'%' {
            out.push_str(&text[start..i + 1]);
            i += 2;
            start = i;
        } else {
            i += 1;
        }
    }
    out.push_str(&text[start..]);
}

/// Renders one fragment. Dynamic width/precision values, already read from
/// the packed stream, override whatever the conversion spelled.
pub(crate) fn render_fragment(
    out: &mut String,
    fragment: &str,
    arg: &RenderArg<'_>,
    dynamic_width: Option<i32>,
    dynamic_precision: Option<i32>,
) {
    let bytes = fragment.as_bytes();
    let Some(mut conversion) = find_conversion(bytes) else {
        push_literal(out, fragment);
        return;
    };
    if let Some(w) = dynamic_width {
        // A negative dynamic width means left-aligned with its magnitude.
        if w < 0 {
            conversion.flags.minus = true;
        }
        conversion.width = Some(w.unsigned_abs() as usize);
    }
    if let Some(p) = dynamic_precision {
        // A negative dynamic precision is as if none were given.
        conversion.precision = if p < 0 { None } else { Some(p as usize) };
    }

    push_literal(out, &fragment[..conversion.start]);
    render_conversion(out, &conversion, arg);
    push_literal(out, &fragment[conversion.end..]);
}

fn render_conversion(out: &mut String, conversion: &Conversion, arg: &RenderArg<'_>) {
    match conversion.specifier {
        b'd' | b'i' => {
            let value = match arg {
                RenderArg::Signed(v) => *v,
                RenderArg::Unsigned(v) => *v as i64,
                _ => 0,
            };
            let sign = sign_prefix(value < 0, &conversion.flags);
            let digits = value.unsigned_abs().to_string();
            pad_numeric(out, conversion, sign, "", digits);
        }
        b'u' | b'o' | b'x' | b'X' => {
            let value = match arg {
                RenderArg::Unsigned(v) => *v,
                RenderArg::Signed(v) => *v as u64,
                _ => 0,
            };
            let (digits, prefix) = match conversion.specifier {
                b'o' => (format!("{value:o}"), ""),
                b'x' => (
                    format!("{value:x}"),
                    if conversion.flags.hash && value != 0 { "0x" } else { "" },
                ),
                b'X' => (
                    format!("{value:X}"),
                    if conversion.flags.hash && value != 0 { "0X" } else { "" },
                ),
                _ => (value.to_string(), ""),
            };
            let digits = if conversion.specifier == b'o'
                && conversion.flags.hash
                && !digits.starts_with('0')
            {
                format!("0{digits}")
            } else {
                digits
            };
            pad_numeric(out, conversion, "", prefix, digits);
        }
        b'c' => {
            let value = match arg {
                RenderArg::Signed(v) => *v as u32,
                RenderArg::Unsigned(v) => *v as u32,
                _ => 0,
            };
            let text = char::from_u32(value).unwrap_or('\u{FFFD}').to_string();
            pad_text(out, conversion, &text);
        }
        b's' => {
            let text = match arg {
                RenderArg::Str(s) => *s,
                _ => "",
            };
            let truncated = match conversion.precision {
                Some(max) if max < text.len() => {
                    let mut end = max;
                    while !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    &text[..end]
                }
                _ => text,
            };
            pad_text(out, conversion, truncated);
        }
        b'p' => {
            let value = match arg {
                RenderArg::Pointer(v) | RenderArg::Unsigned(v) => *v,
                RenderArg::Signed(v) => *v as u64,
                _ => 0,
            };
            let text = if value == 0 {
                "(nil)".to_owned()
            } else {
                format!("0x{value:x}")
            };
            pad_text(out, conversion, &text);
        }
        b'f' | b'F' | b'e' | b'E' | b'g' | b'G' | b'a' | b'A' => {
            let value = match arg {
                RenderArg::Double(v) => *v,
                RenderArg::Signed(v) => *v as f64,
                RenderArg::Unsigned(v) => *v as f64,
                _ => 0.0,
            };
            render_float(out, conversion, value);
        }
        _ => {}
    }
}

fn sign_prefix(negative: bool, flags: &Flags) -> &'static str {
    if negative {
        "-"
    } else if flags.plus {
        "+"
    } else if flags.space {
        " "
    } else {
        ""
    }
}

/// Numeric assembly: precision gives a minimum digit count, the zero flag
/// pads with zeros after the sign and prefix (unless left-aligned or a
/// precision was given), the width pads with spaces.
fn pad_numeric(
    out: &mut String,
    conversion: &Conversion,
    sign: &str,
    prefix: &str,
    mut digits: String,
) {
    if let Some(precision) = conversion.precision {
        if precision == 0 && digits == "0" {
            digits.clear();
        }
        while digits.len() < precision {
            digits.insert(0, '0');
        }
    }
    let body_len = sign.len() + prefix.len() + digits.len();
    let width = conversion.width.unwrap_or(0);
    let pad = width.saturating_sub(body_len);

    if conversion.flags.minus {
        out.push_str(sign);
        out.push_str(prefix);
        out.push_str(&digits);
        out.extend(std::iter::repeat_n(' ', pad));
    } else if conversion.flags.zero && conversion.precision.is_none() {
        out.push_str(sign);
        out.push_str(prefix);
        out.extend(std::iter::repeat_n('0', pad));
        out.push_str(&digits);
    } else {
        out.extend(std::iter::repeat_n(' ', pad));
        out.push_str(sign);
        out.push_str(prefix);
        out.push_str(&digits);
    }
}

/// Width padding for the text-like conversions (no zero fill).
fn pad_text(out: &mut String, conversion: &Conversion, text: &str) {
    let width = conversion.width.unwrap_or(0);
    let pad = width.saturating_sub(text.chars().count());
    if conversion.flags.minus {
        out.push_str(text);
        out.extend(std::iter::repeat_n(' ', pad));
    } else {
        out.extend(std::iter::repeat_n(' ', pad));
        out.push_str(text);
    }
}

fn render_float(out: &mut String, conversion: &Conversion, value: f64) {
    let upper = conversion.specifier.is_ascii_uppercase();
    let negative = value.is_sign_negative();
    let sign = sign_prefix(negative, &conversion.flags);

    if value.is_nan() || value.is_infinite() {
        let body = match (value.is_nan(), upper) {
            (true, false) => "nan",
            (true, true) => "NAN",
            (false, false) => "inf",
            (false, true) => "INF",
        };
        // Zero fill never applies to non-numbers.
        let text = format!("{}{}", if value.is_nan() { "" } else { sign }, body);
        pad_text(out, conversion, &text);
        return;
    }

    let magnitude = value.abs();
    let body = match conversion.specifier | 0x20 {
        b'f' => format_fixed(magnitude, conversion.precision.unwrap_or(6), conversion.flags.hash),
        b'e' => format_scientific(
            magnitude,
            conversion.precision.unwrap_or(6),
            upper,
            conversion.flags.hash,
        ),
        b'g' => format_shortest(
            magnitude,
            conversion.precision.unwrap_or(6),
            upper,
            conversion.flags.hash,
        ),
        _ => format_hex_float(magnitude, conversion.precision, upper),
    };

    let body_len = sign.len() + body.len();
    let width = conversion.width.unwrap_or(0);
    let pad = width.saturating_sub(body_len);
    if conversion.flags.minus {
        out.push_str(sign);
        out.push_str(&body);
        out.extend(std::iter::repeat_n(' ', pad));
    } else if conversion.flags.zero {
        out.push_str(sign);
        out.extend(std::iter::repeat_n('0', pad));
        out.push_str(&body);
    } else {
        out.extend(std::iter::repeat_n(' ', pad));
        out.push_str(sign);
        out.push_str(&body);
    }
}

fn format_fixed(magnitude: f64, precision: usize, hash: bool) -> String {
    let mut body = format!("{magnitude:.precision$}");
    if hash && precision == 0 {
        body.push('.');
    }
    body
}

fn format_scientific(magnitude: f64, precision: usize, upper: bool, hash: bool) -> String {
    let formatted = format!("{magnitude:.precision$e}");
    let (mantissa, exponent) = split_exponent(&formatted);
    let mut body = mantissa.to_owned();
    if hash && precision == 0 {
        body.push('.');
    }
    body.push(if upper { 'E' } else { 'e' });
    if exponent < 0 {
        body.push('-');
    } else {
        body.push('+');
    }
    body.push_str(&format!("{:02}", exponent.unsigned_abs()));
    body
}

/// The %g rules: scientific when the exponent falls outside
/// `[-4, precision)`, fixed otherwise, and trailing zeros trimmed unless
/// `#` keeps them.
fn format_shortest(magnitude: f64, precision: usize, upper: bool, hash: bool) -> String {
    let significant = precision.max(1);
    let probe = format!("{:.*e}", significant - 1, magnitude);
    let (_, exponent) = split_exponent(&probe);

    let mut body = if exponent < -4 || exponent >= significant as i64 {
        let mut s = format_scientific(magnitude, significant - 1, upper, hash);
        if !hash {
            let marker = if upper { 'E' } else { 'e' };
            if let Some(at) = s.find(marker) {
                let (mantissa, exp_part) = s.split_at(at);
                let trimmed = trim_fraction(mantissa);
                s = format!("{trimmed}{exp_part}");
            }
        }
        s
    } else {
        let fraction_digits = (significant as i64 - 1 - exponent).max(0) as usize;
        format_fixed(magnitude, fraction_digits, hash)
    };
    if !hash && !body.contains('e') && !body.contains('E') {
        body = trim_fraction(&body).to_owned();
    }
    body
}

fn trim_fraction(s: &str) -> &str {
    if !s.contains('.') {
        return s;
    }
    s.trim_end_matches('0').trim_end_matches('.')
}

fn split_exponent(formatted: &str) -> (&str, i64) {
    match formatted.find(['e', 'E']) {
        Some(at) => {
            let exponent = formatted[at + 1..].parse().unwrap_or(0);
            (&formatted[..at], exponent)
        }
        None => (formatted, 0),
    }
}

/// C-style `%a`: `0x1.<hex fraction>p<decimal exponent>`, the fraction
/// trimmed of trailing zeros when no precision is given, rounded
/// half-to-even at the requested hex digit otherwise.
fn format_hex_float(magnitude: f64, precision: Option<usize>, upper: bool) -> String {
    let bits = magnitude.to_bits();
    let raw_exponent = (bits >> 52) & 0x7FF;
    let fraction = bits & ((1u64 << 52) - 1);

    let (mut leading, exponent): (u64, i64) = if magnitude == 0.0 {
        (0, 0)
    } else if raw_exponent == 0 {
        (0, -1022)
    } else {
        (1, raw_exponent as i64 - 1023)
    };

    // 4.52 fixed point: leading digit plus 13 fraction nibbles.
    let combined = (leading << 52) | fraction;
    let digits = match precision {
        Some(p) if p < 13 => {
            let shift = 52 - 4 * p as u32;
            let kept = combined >> shift;
            let remainder = combined & ((1u64 << shift) - 1);
            let half = 1u64 << (shift - 1);
            let mut rounded = kept;
            if remainder > half || (remainder == half && kept & 1 == 1) {
                rounded += 1;
            }
            leading = rounded >> (4 * p as u32);
            let fraction_bits = if p == 0 {
                0
            } else {
                rounded & ((1u64 << (4 * p as u32)) - 1)
            };
            let mut text = String::new();
            for i in (0..p).rev() {
                let nibble = (fraction_bits >> (4 * i)) & 0xF;
                text.push(char::from_digit(nibble as u32, 16).unwrap_or('0'));
            }
            text
        }
        Some(p) => {
            let mut text = format!("{fraction:013x}");
            text.extend(std::iter::repeat_n('0', p - 13));
            text
        }
        None => {
            let text = format!("{fraction:013x}");
            text.trim_end_matches('0').to_owned()
        }
    };

    let mut body = String::from("0x");
    body.push_str(&leading.to_string());
    if !digits.is_empty() {
        body.push('.');
        body.push_str(&digits);
    }
    body.push('p');
    if exponent < 0 {
        body.push('-');
    } else {
        body.push('+');
    }
    body.push_str(&exponent.unsigned_abs().to_string());
    if upper {
        body = body.to_uppercase();
    }
    body
}
