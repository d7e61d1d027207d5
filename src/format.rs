//! Decoding of the textual side-band payloads: format descriptors,
//! formatted messages and plain print events.
//!
//! A format descriptor is a NUL-terminated format string followed by a
//! NUL-terminated argument-type list, one byte per argument. A formatted
//! message then carries only the argument values, packed back to back in
//! the order of that list.

use std::convert::TryInto;

const ARG_END: u8 = 0;
const ARG_I32: u8 = 1;
const ARG_I64: u8 = 2;
const ARG_STRING: u8 = 3;

/// Argument types a format descriptor can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ArgKind {
    I32,
    I64,
    Str,
}

/// A parsed format descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FormatSpec {
    pub fmt: String,
    pub args: Vec<ArgKind>,
}

/// Parses a format descriptor from the head of `payload`. Returns the
/// descriptor and the number of bytes it occupied, so that a message
/// carrying an inline descriptor can locate its argument values.
pub fn parse_format(payload: &[u8]) -> Option<(FormatSpec, usize)> {
    let fmt_end = payload.iter().position(|&b| b == ARG_END)?;
    let fmt = String::from_utf8_lossy(&payload[..fmt_end]).into_owned();

    let mut args = vec![];
    let mut i = fmt_end + 1;
    loop {
        match payload.get(i)? {
            &ARG_END => break,
            &ARG_I32 => args.push(ArgKind::I32),
            &ARG_I64 => args.push(ArgKind::I64),
            &ARG_STRING => args.push(ArgKind::Str),
            _ => return None,
        }
        i += 1;
    }

    Some((FormatSpec { fmt, args }, i + 1))
}

/// One argument value pulled from a message payload.
enum Arg {
    Int(i64),
    Str(String),
    Missing,
}

/// Reads the next argument of the given kind, advancing `bytes`.
fn next_arg(kind: ArgKind, bytes: &mut &[u8]) -> Arg {
    match kind {
        ArgKind::I32 => {
            if bytes.len() < 4 {
                return Arg::Missing;
            }
            let (head, rest) = bytes.split_at(4);
            *bytes = rest;
            Arg::Int(i64::from(i32::from_le_bytes(head.try_into().unwrap())))
        }
        ArgKind::I64 => {
            if bytes.len() < 8 {
                return Arg::Missing;
            }
            let (head, rest) = bytes.split_at(8);
            *bytes = rest;
            Arg::Int(i64::from_le_bytes(head.try_into().unwrap()))
        }
        ArgKind::Str => {
            let end = match bytes.iter().position(|&b| b == 0) {
                Some(end) => end,
                None => return Arg::Missing,
            };
            let text = String::from_utf8_lossy(&bytes[..end]).into_owned();
            *bytes = &bytes[end + 1..];
            Arg::Str(text)
        }
    }
}

/// Renders a message against its descriptor. Supports the `%`
/// conversions the tracer-side formatter accepts (`d`, `i`, `u`, `x`,
/// `X`, `p`, `s`, `%`); the optional `ll` length prefix and any width or
/// flag characters are accepted and skipped. Arguments are typed by the
/// descriptor, not the conversion.
pub fn render(spec: &FormatSpec, mut values: &[u8]) -> String {
    let mut out = String::with_capacity(spec.fmt.len());
    let mut args = spec.args.iter();
    let mut chars = spec.fmt.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        // Skip flags, width and length characters up to the conversion.
        let mut conv = None;
        while let Some(&c) = chars.peek() {
            chars.next();
            if c.is_ascii_alphabetic() && !matches!(c, 'l' | 'h' | 'z') {
                conv = Some(c);
                break;
            }
        }
        let arg = match args.next() {
            Some(&kind) => next_arg(kind, &mut values),
            None => Arg::Missing,
        };
        match (conv, arg) {
            (Some('d'), Arg::Int(v)) | (Some('i'), Arg::Int(v)) => {
                out.push_str(&v.to_string());
            }
            (Some('u'), Arg::Int(v)) => out.push_str(&(v as u64).to_string()),
            (Some('x'), Arg::Int(v)) => out.push_str(&format!("{:x}", v)),
            (Some('X'), Arg::Int(v)) => out.push_str(&format!("{:X}", v)),
            (Some('p'), Arg::Int(v)) => out.push_str(&format!("{:#x}", v)),
            (Some('s'), Arg::Str(s)) => out.push_str(&s),
            (Some(c), Arg::Int(v)) => out.push_str(&format!("%{}({})", c, v)),
            (Some(c), Arg::Str(s)) => out.push_str(&format!("%{}({})", c, s)),
            (Some(c), Arg::Missing) => {
                out.push('%');
                out.push(c);
            }
            (None, _) => break,
        }
    }
    out
}

/// Reconstructs the text of a plain print event: the first four
/// characters ride in the parameter (NUL-terminated if the string is
/// short), the remainder in the side-band payload.
pub fn print_text(param: u32, payload: &[u8]) -> String {
    let head = param.to_le_bytes();
    let mut text = String::new();
    for &b in &head {
        if b == 0 {
            return text + &String::from_utf8_lossy(payload);
        }
        text.push(b as char);
    }
    text + &String::from_utf8_lossy(payload)
}
