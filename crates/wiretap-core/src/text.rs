//! Byte-transparent text codec for the relay path.
//!
//! Chunks are decoded as ISO-8859-1 so that arbitrary bytes survive a
//! text-level `replace` and re-encode to the identical byte sequence. The
//! Content-Length adjuster measures bodies in UTF-8 instead; that is the
//! HTTP convention, not the relay transport's.

/// Decode bytes as ISO-8859-1. Every byte maps to the Unicode code point of
/// the same value, so `latin1_encode(latin1_decode(b)) == b` for all inputs.
pub fn latin1_decode(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encode text as ISO-8859-1. Code points above U+00FF (which can only come
/// from a replacement string, never from a decoded chunk) become `?`.
pub fn latin1_encode(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
        .collect()
}

/// Escape a chunk for one-line logging: `\n`, `\t`, `\r` and `\\` by name,
/// printable ASCII verbatim, everything else as `\uXXXX`. The result is
/// truncated to `max_chars` characters.
pub fn escape_for_log(text: &str, max_chars: usize) -> String {
    let mut out = String::with_capacity(text.len().min(max_chars));
    let mut written = 0usize;
    for c in text.chars() {
        if written >= max_chars {
            break;
        }
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            ' '..='~' => out.push(c),
            other => out.push_str(&format!("\\u{:04x}", other as u32)),
        }
        written += 1;
    }
    out
}
