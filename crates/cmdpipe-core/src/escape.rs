//! Minimal string escaping for diagnostic output.
//!
//! Produces a Java/JSON-like escaped form: common control characters get
//! their short escapes, other control characters (and optionally everything
//! outside ASCII) become `\uXXXX` UTF-16 escapes.

use std::fmt::Write as _;

/// Escape `input` for single-line display.
///
/// With `escape_unicode`, every non-ASCII character is written as one or
/// two `\uXXXX` UTF-16 units; otherwise it is kept as-is.
pub fn simple_escape(input: &str, escape_unicode: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '\u{8}' => out.push_str("\\b"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            c if (c as u32) < 0x20 => push_utf16_escape(&mut out, c),
            c if escape_unicode && (c as u32) > 0x7f => push_utf16_escape(&mut out, c),
            c => out.push(c),
        }
    }
    out
}

fn push_utf16_escape(out: &mut String, ch: char) {
    let mut units = [0u16; 2];
    for unit in ch.encode_utf16(&mut units) {
        let _ = write!(out, "\\u{unit:04X}");
    }
}
