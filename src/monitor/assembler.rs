// SPDX-License-Identifier: Apache-2.0

//! Splits raw file bytes into complete, newline-delimited records.

use encoding_rs::Encoding;
use memchr::memchr;

/// Buffers bytes read from a file and yields complete records, carrying the
/// unterminated tail forward across reads. Purely a function of (previous
/// fragment, new bytes); it knows nothing about offsets or rotation.
///
/// Zero-length records between consecutive delimiters are dropped from the
/// output. The retained fragment never contains a delimiter.
pub struct LineAssembler {
    fragment: Vec<u8>,
    encoding: &'static Encoding,
}

impl LineAssembler {
    pub fn new(encoding: &'static Encoding) -> Self {
        Self {
            fragment: Vec::new(),
            encoding,
        }
    }

    /// Append a chunk and return the records it completes, in input order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.fragment.extend_from_slice(chunk);

        let mut records = Vec::new();
        let mut start = 0usize;
        while let Some(pos) = memchr(b'\n', &self.fragment[start..]) {
            let end = start + pos;
            if end > start {
                records.push(self.decode(start, end));
            }
            start = end + 1;
        }
        self.fragment.drain(..start);

        records
    }

    fn decode(&self, start: usize, end: usize) -> String {
        let (decoded, _, _) = self.encoding.decode(&self.fragment[start..end]);
        decoded.into_owned()
    }

    /// Bytes buffered without a terminating delimiter.
    pub fn pending_len(&self) -> usize {
        self.fragment.len()
    }

    /// Discard the buffered fragment (rotation, truncation, overflow).
    pub fn clear(&mut self) {
        self.fragment.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use encoding_rs::{UTF_8, WINDOWS_1252};

    #[test]
    fn complete_lines_are_split() {
        let mut asm = LineAssembler::new(UTF_8);

        let records = asm.push(b"line1\nline2\n");
        assert_eq!(records, vec!["line1", "line2"]);
        assert_eq!(asm.pending_len(), 0);
    }

    #[test]
    fn trailing_fragment_is_retained() {
        let mut asm = LineAssembler::new(UTF_8);

        let records = asm.push(b"line1\nline2");
        assert_eq!(records, vec!["line1"]);
        assert_eq!(asm.pending_len(), 5);
    }

    #[test]
    fn fragment_concatenates_exactly_once() {
        let mut asm = LineAssembler::new(UTF_8);

        assert_eq!(asm.push(b"line1\nline2\nline3"), vec!["line1", "line2"]);
        // the continuation joins the retained "line3" fragment
        assert_eq!(
            asm.push(b"line3\nline4\nline5"),
            vec!["line3line3", "line4"]
        );
        assert_eq!(asm.pending_len(), 5);
    }

    #[test]
    fn empty_records_are_dropped() {
        let mut asm = LineAssembler::new(UTF_8);

        let records = asm.push(b"a\n\n\nb\n");
        assert_eq!(records, vec!["a", "b"]);
    }

    #[test]
    fn chunk_split_mid_line() {
        let mut asm = LineAssembler::new(UTF_8);

        assert!(asm.push(b"par").is_empty());
        assert!(asm.push(b"tial").is_empty());
        assert_eq!(asm.push(b" line\n"), vec!["partial line"]);
    }

    #[test]
    fn clear_discards_fragment() {
        let mut asm = LineAssembler::new(UTF_8);

        asm.push(b"dangling");
        asm.clear();
        assert_eq!(asm.pending_len(), 0);
        assert_eq!(asm.push(b"fresh\n"), vec!["fresh"]);
    }

    #[test]
    fn non_utf8_encoding_decodes_records() {
        let mut asm = LineAssembler::new(WINDOWS_1252);

        // 0xE9 is 'é' in windows-1252 but invalid UTF-8
        let records = asm.push(b"caf\xe9\n");
        assert_eq!(records, vec!["café"]);
    }
}
