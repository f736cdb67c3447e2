//! Line Framer — splits a byte stream into complete, UTF-8 JSON-RPC lines.

use tracing::warn;

/// Accumulates bytes from a child's stdout and yields complete lines as they
/// become available. Lines are delimited by `\n`; a trailing `\r` is
/// stripped. Empty lines (after trimming) are skipped. Lines that are not
/// valid UTF-8 are dropped with a warning rather than surfaced as an error —
/// one malformed line must never take down the whole pipe.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: Vec<u8>,
}

impl LineFramer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Feeds newly read bytes into the framer and returns any complete
    /// lines they produced, in order. Incomplete trailing data is retained
    /// for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();

        loop {
            let Some(pos) = self.buf.iter().position(|&b| b == b'\n') else {
                break;
            };
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let trimmed = &raw[..raw.len() - 1];
            let trimmed = if trimmed.ends_with(b"\r") {
                &trimmed[..trimmed.len() - 1]
            } else {
                trimmed
            };
            if trimmed.is_empty() {
                continue;
            }
            match std::str::from_utf8(trimmed) {
                Ok(s) => lines.push(s.to_string()),
                Err(e) => warn!(error = %e, "dropping non-UTF-8 line from child stdout"),
            }
        }

        lines
    }

    /// Bytes currently buffered but not yet terminated by a newline.
    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_lines_split() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"L1\nL2\n");
        assert_eq!(lines, vec!["L1".to_string(), "L2".to_string()]);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn test_incomplete_trailing_line_retained() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"L1\nL2");
        assert_eq!(lines, vec!["L1".to_string()]);
        assert_eq!(framer.pending_len(), 2);
        let more = framer.push(b"3\n");
        assert_eq!(more, vec!["L23".to_string()]);
    }

    #[test]
    fn test_crlf_stripped() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"L1\r\nL2\r\n");
        assert_eq!(lines, vec!["L1".to_string(), "L2".to_string()]);
    }

    #[test]
    fn test_empty_lines_skipped() {
        let mut framer = LineFramer::new();
        let lines = framer.push(b"\n\nL1\n\n");
        assert_eq!(lines, vec!["L1".to_string()]);
    }

    #[test]
    fn test_non_utf8_line_dropped() {
        let mut framer = LineFramer::new();
        let mut chunk = vec![0xff, 0xfe, 0xfd];
        chunk.push(b'\n');
        chunk.extend_from_slice(b"L1\n");
        let lines = framer.push(&chunk);
        assert_eq!(lines, vec!["L1".to_string()]);
    }

    #[test]
    fn test_fed_across_multiple_pushes_byte_by_byte() {
        let mut framer = LineFramer::new();
        let mut out = Vec::new();
        for byte in b"ab\ncd\n" {
            out.extend(framer.push(&[*byte]));
        }
        assert_eq!(out, vec!["ab".to_string(), "cd".to_string()]);
    }
}
