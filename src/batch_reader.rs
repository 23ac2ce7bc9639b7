//! Sequential, memory-mapped batch reading of newline-delimited text.
//!
//! The source file is mapped once and scanned in windows of a fixed byte
//! budget. Every window is cut back to its last newline so that a line never
//! straddles two batches. A window without any newline grows to the end of
//! its line. Only the lines of the current window are materialized.

use std::{
    fs::File,
    path::{Path, PathBuf},
};

use memmap2::Mmap;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// One window of decoded lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub lines: Vec<String>,
    /// Byte offset of the first byte of this window.
    pub start_offset: u64,
    /// Byte offset just past the last byte of this window.
    pub end_offset: u64,
    /// Bytes dropped because they were not valid UTF-8.
    pub skipped_bytes: usize,
}

/// Lazy iterator over the batches of a file.
///
/// Dropping the reader unmaps the file.
pub struct BatchReader {
    path: PathBuf,
    mmap: Option<Mmap>,
    position: usize,
    chunk_bytes: usize,
}

impl BatchReader {
    pub fn open(path: &Path, chunk_bytes: usize) -> Result<Self> {
        Self::open_at(path, chunk_bytes, 0)
    }

    /// Open `path` and start reading at byte `offset`, which must be a batch
    /// boundary previously reported by [`Batch::end_offset`].
    pub fn open_at(
        path: &Path,
        chunk_bytes: usize,
        offset: u64,
    ) -> Result<Self> {
        if chunk_bytes == 0 {
            return Err(Error::Config("chunk size must be at least 1".into()));
        }
        let mmap = map_file(path)?;
        let len = mmap.as_ref().map_or(0, |m| m.len());
        let position = usize::try_from(offset).unwrap_or(usize::MAX).min(len);

        debug!(
            path = %path.display(),
            len,
            position,
            chunk_bytes,
            "mapped source file"
        );

        Ok(Self {
            path: path.to_path_buf(),
            mmap,
            position,
            chunk_bytes,
        })
    }

    /// Total size of the mapped file in bytes.
    pub fn len(&self) -> u64 {
        self.mmap.as_ref().map_or(0, |m| m.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current byte offset; everything before it has been yielded.
    pub fn position(&self) -> u64 {
        self.position as u64
    }
}

impl Iterator for BatchReader {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let mmap = self.mmap.as_ref()?;
        let bytes: &[u8] = mmap;
        if self.position >= bytes.len() {
            return None;
        }

        let start = self.position;
        let mut end = start.saturating_add(self.chunk_bytes).min(bytes.len());
        if end < bytes.len() {
            end = match bytes[start..end].iter().rposition(|&b| b == b'\n') {
                Some(nl) => start + nl + 1,
                // A line longer than the window runs on to its newline.
                None => bytes[end..]
                    .iter()
                    .position(|&b| b == b'\n')
                    .map_or(bytes.len(), |nl| end + nl + 1),
            };
        }
        self.position = end;

        let (text, skipped_bytes) = decode_skipping_invalid(&bytes[start..end]);
        if skipped_bytes > 0 {
            warn!(
                path = %self.path.display(),
                offset = start,
                skipped_bytes,
                "skipped malformed bytes in batch"
            );
        }

        Some(Batch {
            lines: text.lines().map(str::to_owned).collect(),
            start_offset: start as u64,
            end_offset: end as u64,
            skipped_bytes,
        })
    }
}

impl Drop for BatchReader {
    fn drop(&mut self) {
        if self.mmap.take().is_some() {
            debug!(
                path = %self.path.display(),
                position = self.position,
                "released source mapping"
            );
        }
    }
}

/// Count logical lines; a final line without a trailing newline counts.
pub fn count_lines(path: &Path) -> Result<u64> {
    let Some(mmap) = map_file(path)? else {
        return Ok(0);
    };
    let newlines = mmap.iter().filter(|&&b| b == b'\n').count() as u64;
    let unterminated = u64::from(mmap.last().is_some_and(|&b| b != b'\n'));
    Ok(newlines + unterminated)
}

fn map_file(path: &Path) -> Result<Option<Mmap>> {
    let file = File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::NotFound {
            kind: "dataset",
            name: path.display().to_string(),
        },
        _ => Error::Io(e),
    })?;
    if file.metadata()?.len() == 0 {
        return Ok(None);
    }

    // SAFETY: the mapping is read-only and the training session is the only
    // user of the source file while it is mapped.
    let mmap = unsafe { Mmap::map(&file)? };
    #[cfg(unix)]
    {
        let _ = mmap.advise(memmap2::Advice::Sequential);
    }
    Ok(Some(mmap))
}

/// Decode UTF-8, dropping invalid sequences. Returns the text and the number
/// of bytes dropped.
fn decode_skipping_invalid(bytes: &[u8]) -> (String, usize) {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return (text.to_owned(), 0);
    }
    let mut text = String::with_capacity(bytes.len());
    let mut skipped = 0;
    for chunk in bytes.utf8_chunks() {
        text.push_str(chunk.valid());
        skipped += chunk.invalid().len();
    }
    (text, skipped)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn write_file(contents: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("data.txt");
        let mut file = File::create(&path).unwrap();
        file.write_all(contents).unwrap();
        (tmp, path)
    }

    #[test]
    fn reads_whole_small_file_in_one_batch() {
        let (_tmp, path) = write_file(b"Hello world\n\nFoo bar!\n");
        let batches: Vec<_> = BatchReader::open(&path, 1024).unwrap().collect();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lines, vec!["Hello world", "", "Foo bar!"]);
        assert_eq!(batches[0].start_offset, 0);
        assert_eq!(batches[0].end_offset, 22);
    }

    #[test]
    fn lines_never_straddle_batches() {
        let (_tmp, path) = write_file(b"aaaa\nbbbb\ncccc\ndddd\n");
        let batches: Vec<_> = BatchReader::open(&path, 12).unwrap().collect();

        let lines: Vec<String> =
            batches.iter().flat_map(|b| b.lines.clone()).collect();
        assert_eq!(lines, vec!["aaaa", "bbbb", "cccc", "dddd"]);
        assert!(batches.iter().all(|b| b.lines.len() <= 2));
        for pair in batches.windows(2) {
            assert_eq!(pair[0].end_offset, pair[1].start_offset);
        }
    }

    #[test]
    fn line_longer_than_window_stays_whole() {
        let (_tmp, path) = write_file(b"abcdefghij\nxy\n");
        let batches: Vec<_> = BatchReader::open(&path, 4).unwrap().collect();

        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].lines, vec!["abcdefghij"]);
        assert_eq!(batches[0].end_offset, 11);
        assert_eq!(batches[1].lines, vec!["xy"]);
        assert_eq!(batches[1].end_offset, 14);
    }

    #[test]
    fn unterminated_long_line_runs_to_eof() {
        let (_tmp, path) = write_file("word café word café".as_bytes());
        let batches: Vec<_> = BatchReader::open(&path, 7).unwrap().collect();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lines, vec!["word café word café"]);
        assert_eq!(batches[0].skipped_bytes, 0);
    }

    #[test]
    fn resumes_from_offset() {
        let (_tmp, path) = write_file(b"one\ntwo\nthree\n");
        let mut reader = BatchReader::open(&path, 8).unwrap();
        let first = reader.next().unwrap();
        assert_eq!(first.lines, vec!["one", "two"]);
        drop(reader);

        let rest: Vec<_> = BatchReader::open_at(&path, 8, first.end_offset)
            .unwrap()
            .flat_map(|b| b.lines)
            .collect();
        assert_eq!(rest, vec!["three"]);
    }

    #[test]
    fn offset_past_end_yields_nothing() {
        let (_tmp, path) = write_file(b"one\n");
        let mut reader = BatchReader::open_at(&path, 8, 1_000).unwrap();
        assert!(reader.next().is_none());
    }

    #[test]
    fn invalid_utf8_is_skipped_not_fatal() {
        let (_tmp, path) = write_file(b"good\nba\xff\xfed\nfine\n");
        let batches: Vec<_> = BatchReader::open(&path, 1024).unwrap().collect();

        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].lines, vec!["good", "bad", "fine"]);
        assert_eq!(batches[0].skipped_bytes, 2);
    }

    #[test]
    fn empty_file_yields_no_batches() {
        let (_tmp, path) = write_file(b"");
        let mut reader = BatchReader::open(&path, 16).unwrap();
        assert!(reader.is_empty());
        assert!(reader.next().is_none());
        assert_eq!(count_lines(&path).unwrap(), 0);
    }

    #[test]
    fn missing_file_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let missing = tmp.path().join("nope.txt");
        assert!(matches!(
            BatchReader::open(&missing, 16),
            Err(Error::NotFound { kind: "dataset", .. })
        ));
    }

    #[test]
    fn count_lines_includes_unterminated_last_line() {
        let (_tmp, path) = write_file(b"a\nb\nc");
        assert_eq!(count_lines(&path).unwrap(), 3);

        let (_tmp2, path2) = write_file(b"Hello world\n\nFoo bar!\n");
        assert_eq!(count_lines(&path2).unwrap(), 3);
    }

    #[test]
    fn early_drop_releases_mapping() {
        let (_tmp, path) = write_file(b"x\ny\nz\n");
        let mut reader = BatchReader::open(&path, 2).unwrap();
        assert!(reader.next().is_some());
        assert_eq!(reader.position(), 2);
        drop(reader);

        // The file can be replaced once the reader is gone.
        std::fs::write(&path, b"replaced\n").unwrap();
        let lines: Vec<_> = BatchReader::open(&path, 64)
            .unwrap()
            .flat_map(|b| b.lines)
            .collect();
        assert_eq!(lines, vec!["replaced"]);
    }
}
