//! Conversion between byte blocks and the Python expressions used to carry
//! them over the REPL.
//!
//! Two encodings exist: a Python bytes literal (`b'...'`), efficient for
//! mostly-textual data, and a hex form (`uh(b'...')`, where `uh` is an alias
//! for `binascii.unhexlify` pre-imported on the device) with a fixed 2x
//! overhead for binary data. Each block is sent in whichever form is shorter.

use super::CodecError;

/// Render a block as a Python bytes literal.
pub fn bytes_literal(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() + 3);
    out.push_str("b'");
    for &byte in data {
        match byte {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            b'\t' => out.push_str("\\t"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            0x20..=0x7e => out.push(byte as char),
            _ => {
                out.push_str("\\x");
                out.push_str(&hex_byte(byte));
            }
        }
    }
    out.push('\'');
    out
}

fn hex_byte(byte: u8) -> String {
    format!("{byte:02x}")
}

/// Length the hex encoding of `data` would have.
pub(crate) fn hex_encoded_len(data_len: usize) -> usize {
    "uh(b'')".len() + data_len * 2
}

/// Render a block as whichever evalable Python expression is shorter: a bytes
/// literal or a call to the device-side `uh` (unhexlify) alias.
pub fn bytes_to_evalable(data: &[u8]) -> String {
    let as_literal = bytes_literal(data);
    if as_literal.len() < hex_encoded_len(data.len()) {
        as_literal
    } else {
        format!("uh(b'{}')", hex::encode(data))
    }
}

/// Render a `str` literal, for paths and other text sent to the device.
pub fn str_literal(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('\'');
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(ch),
        }
    }
    out.push('\'');
    out
}

/// Parse the output of the device-side `bytes_to_evalable`: either a bytes
/// literal or `uh(b'<hex>')`.
pub fn parse_bytes_expr(expr: &str) -> Result<Vec<u8>, CodecError> {
    let expr = expr.trim();
    if let Some(inner) = expr.strip_prefix("uh(").and_then(|e| e.strip_suffix(')')) {
        let hex_bytes = parse_bytes_literal(inner.trim())?;
        return hex::decode(&hex_bytes)
            .map_err(|err| CodecError::Malformed(format!("bad hex payload: {err}")));
    }
    parse_bytes_literal(expr)
}

/// Parse a Python bytes literal (`b'...'` or `b"..."`).
pub fn parse_bytes_literal(literal: &str) -> Result<Vec<u8>, CodecError> {
    let literal = literal.trim();
    let rest = literal
        .strip_prefix('b')
        .ok_or_else(|| CodecError::Malformed(format!("not a bytes literal: {literal:?}")))?;

    let mut chars = rest.chars();
    let quote = match chars.next() {
        Some(q @ ('\'' | '"')) => q,
        _ => return Err(CodecError::Malformed(format!("unquoted literal: {literal:?}"))),
    };

    let mut out = Vec::new();
    loop {
        match chars.next() {
            None => {
                return Err(CodecError::Malformed(format!(
                    "unterminated literal: {literal:?}"
                )))
            }
            Some(c) if c == quote => break,
            Some('\\') => out.push(parse_escape(&mut chars, literal)?),
            Some(c) if c.is_ascii() => out.push(c as u8),
            Some(c) => {
                return Err(CodecError::Malformed(format!(
                    "non-ASCII character {c:?} in bytes literal"
                )))
            }
        }
    }

    if chars.next().is_some() {
        return Err(CodecError::Malformed(format!(
            "trailing junk after literal: {literal:?}"
        )));
    }
    Ok(out)
}

fn parse_escape(chars: &mut impl Iterator<Item = char>, literal: &str) -> Result<u8, CodecError> {
    match chars.next() {
        Some('\\') => Ok(b'\\'),
        Some('\'') => Ok(b'\''),
        Some('"') => Ok(b'"'),
        Some('n') => Ok(b'\n'),
        Some('r') => Ok(b'\r'),
        Some('t') => Ok(b'\t'),
        Some('0') => Ok(0),
        Some('x') => {
            let hi = chars.next();
            let lo = chars.next();
            match (hi, lo) {
                (Some(hi), Some(lo)) => {
                    let pair = [hi as u8, lo as u8];
                    let decoded = hex::decode(pair)
                        .map_err(|_| CodecError::Malformed(format!("bad \\x escape: {literal:?}")))?;
                    Ok(decoded[0])
                }
                _ => Err(CodecError::Malformed(format!(
                    "truncated \\x escape: {literal:?}"
                ))),
            }
        }
        other => Err(CodecError::Malformed(format!(
            "unsupported escape {other:?} in {literal:?}"
        ))),
    }
}

/// Parse the Python list-of-strings literal printed by the device-side `pns`
/// helper, e.g. `['foo','bar',]` or `[]`.
pub fn parse_str_list(text: &str) -> Result<Vec<String>, CodecError> {
    let text = text.trim();
    let inner = text
        .strip_prefix('[')
        .and_then(|t| t.strip_suffix(']'))
        .ok_or_else(|| CodecError::Malformed(format!("not a list literal: {text:?}")))?;

    let mut out = Vec::new();
    let mut chars = inner.chars().peekable();
    loop {
        // Skip separators and whitespace between items
        while matches!(chars.peek(), Some(',' | ' ')) {
            chars.next();
        }
        let quote = match chars.next() {
            None => break,
            Some(q @ ('\'' | '"')) => q,
            Some(c) => {
                return Err(CodecError::Malformed(format!(
                    "expected string literal, found {c:?} in {text:?}"
                )))
            }
        };

        let mut item = String::new();
        loop {
            match chars.next() {
                None => {
                    return Err(CodecError::Malformed(format!(
                        "unterminated string in list: {text:?}"
                    )))
                }
                Some(c) if c == quote => break,
                Some('\\') => {
                    let byte = parse_escape(&mut chars, text)?;
                    item.push(byte as char);
                }
                Some(c) => item.push(c),
            }
        }
        out.push(item);
    }

    Ok(out)
}
