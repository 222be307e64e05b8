//! Rewrites the `Content-Length` header of an HTTP message head after a
//! substitution rule changed the body.

use tracing::debug;

/// Parsed view of one HTTP message head where headers and the start of the
/// body are co-present in a single buffer.
struct HeadView<'a> {
    lines: Vec<&'a str>,
    cl_index: usize,
    cl_value: i64,
    body: &'a str,
}

impl<'a> HeadView<'a> {
    /// Body length in UTF-8 bytes (the HTTP body convention this adjuster
    /// assumes, independent of the byte-transparent relay codec).
    fn body_bytes(&self) -> i64 {
        self.body.len() as i64
    }
}

fn parse(message: &str) -> Option<HeadView<'_>> {
    let split = message.find("\r\n\r\n")?;
    let head = &message[..split];
    let body = &message[split + 4..];
    let lines: Vec<&str> = head.split("\r\n").collect();

    let cl_index = lines.iter().position(|line| {
        line.len() >= 15 && line.as_bytes()[..15].eq_ignore_ascii_case(b"content-length:")
    })?;
    let cl_value: i64 = lines[cl_index][15..].trim().parse().ok()?;

    Some(HeadView {
        lines,
        cl_index,
        cl_value,
        body,
    })
}

/// Recompute the `Content-Length` of `modified` after its body diverged from
/// `orig`. Soft-fails to `modified` unchanged whenever the messages cannot be
/// adjusted safely: no `HTTP/1.` token, no double-CRLF, no `Content-Length`
/// header, a non-integer value, or an original whose declared length does not
/// match its visible body (a partial view).
///
/// The rewritten header line always carries the canonical `Content-Length`
/// capitalisation, even when the input used another case.
pub fn adjust(orig: &str, modified: &str) -> String {
    if !orig.contains("HTTP/1.") {
        return modified.to_string();
    }
    let (Some(o), Some(m)) = (parse(orig), parse(modified)) else {
        return modified.to_string();
    };
    if o.cl_value != o.body_bytes() {
        // Declared length disagrees with the bytes on hand; the rest of the
        // body is still in flight and the arithmetic would be wrong.
        return modified.to_string();
    }

    let new_cl = o.cl_value + m.body_bytes() - o.body_bytes();
    let mut lines: Vec<String> = m.lines.iter().map(|l| l.to_string()).collect();
    lines[m.cl_index] = format!("Content-Length: {new_cl}");
    debug!("Content-Length adjusted from {} to {}", m.cl_value, new_cl);
    format!("{}\r\n\r\n{}", lines.join("\r\n"), m.body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grow_body() {
        let orig = "POST /d HTTP/1.1\r\nContent-Length: 5\r\n\r\nL/B/C";
        let modified = "POST /d HTTP/1.1\r\nContent-Length: 5\r\n\r\nLongBodyContent";
        assert_eq!(
            adjust(orig, modified),
            "POST /d HTTP/1.1\r\nContent-Length: 15\r\n\r\nLongBodyContent"
        );
    }

    #[test]
    fn test_shrink_body() {
        let orig = "PUT /u HTTP/1.1\r\nContent-Length: 15\r\n\r\nShort         !";
        let modified = "PUT /u HTTP/1.1\r\nContent-Length: 15\r\n\r\nShort";
        assert_eq!(
            adjust(orig, modified),
            "PUT /u HTTP/1.1\r\nContent-Length: 5\r\n\r\nShort"
        );
    }

    #[test]
    fn test_utf8_bytes_not_chars() {
        let orig = "GET /u HTTP/1.1\r\nContent-Length: 7\r\n\r\nKarotte";
        let modified = "GET /u HTTP/1.1\r\nContent-Length: 7\r\n\r\nMöhre";
        // Five code points, six UTF-8 bytes.
        assert_eq!(
            adjust(orig, modified),
            "GET /u HTTP/1.1\r\nContent-Length: 6\r\n\r\nMöhre"
        );
    }

    #[test]
    fn test_malformed_value_is_identity() {
        let msg = "GET /b HTTP/1.1\r\nContent-Length: invalid\r\n\r\nSomeBody";
        assert_eq!(adjust(msg, msg), msg);
    }

    #[test]
    fn test_missing_header_is_identity() {
        let orig = "GET /a HTTP/1.1\r\nHost: x\r\n\r\nBody";
        let modified = "GET /a HTTP/1.1\r\nHost: x\r\n\r\nLongerBody";
        assert_eq!(adjust(orig, modified), modified);
    }

    #[test]
    fn test_non_http_is_identity() {
        assert_eq!(adjust("hello there", "hello world"), "hello world");
    }

    #[test]
    fn test_no_double_crlf_is_identity() {
        let orig = "GET / HTTP/1.1\r\nContent-Length: 3\r\n";
        assert_eq!(adjust(orig, orig), orig);
    }

    #[test]
    fn test_partial_original_body_is_identity() {
        let orig = "POST /p HTTP/1.1\r\nContent-Length: 100\r\n\r\npartial";
        let modified = "POST /p HTTP/1.1\r\nContent-Length: 100\r\n\r\npar";
        assert_eq!(adjust(orig, modified), modified);
    }

    #[test]
    fn test_empty_body_identity_value() {
        let msg = "GET /e HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
        assert_eq!(adjust(msg, msg), msg);
    }

    #[test]
    fn test_lowercase_header_detected_and_canonicalised() {
        let orig = "GET /l HTTP/1.1\r\ncontent-length: 4\r\n\r\nBody";
        let modified = "GET /l HTTP/1.1\r\ncontent-length: 4\r\n\r\nBodyMore";
        assert_eq!(
            adjust(orig, modified),
            "GET /l HTTP/1.1\r\nContent-Length: 8\r\n\r\nBodyMore"
        );
    }

    #[test]
    fn test_identical_strings_recompute_deterministically() {
        let msg = "POST /s HTTP/1.1\r\nContent-Length: 4\r\n\r\nSame";
        assert_eq!(adjust(msg, msg), msg);
        assert_eq!(adjust(msg, msg), adjust(msg, msg));
    }
}
