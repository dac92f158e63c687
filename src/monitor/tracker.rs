// SPDX-License-Identifier: Apache-2.0

//! Consumed-offset and file-identity bookkeeping for one monitored path.

use std::fs::Metadata;

/// Stable identity of an open file: device + inode on Unix. Survives appends
/// and renames; a recreation under the same path yields a different value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdent {
    dev: u64,
    ino: u64,
}

impl FileIdent {
    #[cfg(unix)]
    pub fn of(metadata: &Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// Fallback token for platforms without stable inode semantics. Built
    /// from creation time and size; recreation is still detected, stability
    /// across appends is not guaranteed.
    #[cfg(not(unix))]
    pub fn of(metadata: &Metadata) -> Self {
        use std::time::UNIX_EPOCH;

        let created = metadata
            .created()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self {
            dev: created,
            ino: metadata.len(),
        }
    }
}

impl std::fmt::Display for FileIdent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// Byte offset already handed to the line assembler, plus the identity of
/// the file those bytes came from.
///
/// The offset is monotonically non-decreasing while a file stays open; it
/// resets to zero on confirmed rotation or truncation.
#[derive(Debug, Default)]
pub struct OffsetTracker {
    offset: u64,
    ident: Option<FileIdent>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly opened file and the offset to consume from.
    pub fn begin(&mut self, offset: u64, ident: FileIdent) {
        self.offset = offset;
        self.ident = Some(ident);
    }

    pub fn advance(&mut self, bytes: u64) {
        self.offset += bytes;
    }

    /// Truncation under the open handle: restart from the top of the file.
    pub fn reset_offset(&mut self) {
        self.offset = 0;
    }

    /// The open handle was released.
    pub fn clear(&mut self) {
        self.offset = 0;
        self.ident = None;
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn ident(&self) -> Option<FileIdent> {
        self.ident
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn ident_stable_across_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "one\n").unwrap();

        let first = FileIdent::of(&fs::metadata(&path).unwrap());

        let mut f = fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"two\n").unwrap();
        drop(f);

        let second = FileIdent::of(&fs::metadata(&path).unwrap());
        assert_eq!(first, second);
    }

    #[test]
    fn ident_changes_on_recreation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "one\n").unwrap();
        let first = FileIdent::of(&fs::metadata(&path).unwrap());

        fs::remove_file(&path).unwrap();
        fs::write(&path, "different\n").unwrap();
        let second = FileIdent::of(&fs::metadata(&path).unwrap());

        assert_ne!(first, second);
    }

    #[test]
    fn offsets_accumulate_and_reset() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.log");
        fs::write(&path, "payload\n").unwrap();
        let ident = FileIdent::of(&fs::metadata(&path).unwrap());

        let mut tracker = OffsetTracker::new();
        tracker.begin(4, ident);
        tracker.advance(16);
        assert_eq!(tracker.offset(), 20);

        tracker.reset_offset();
        assert_eq!(tracker.offset(), 0);
        assert_eq!(tracker.ident(), Some(ident));

        tracker.clear();
        assert_eq!(tracker.ident(), None);
    }
}
