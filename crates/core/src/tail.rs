// crates/core/src/tail.rs
//! Bounded backward read of the newest lines in a session file.
//!
//! The correlator only ever needs the tail of a transcript, and transcripts
//! grow without bound, so the file is read backwards in fixed-size chunks
//! from EOF until enough newlines have been seen. The whole file is never
//! mapped or loaded.

use std::io;
use std::path::Path;

use tokio::io::{AsyncReadExt, AsyncSeekExt};

const CHUNK: u64 = 16 * 1024;

/// Read the last `n` lines of a file, oldest first.
///
/// Returns every line when the file holds fewer than `n`. A trailing
/// newline at EOF does not produce an empty final element. Invalid UTF-8
/// is replaced lossily.
pub async fn tail_lines(path: &Path, n: usize) -> io::Result<Vec<String>> {
    if n == 0 {
        return Ok(Vec::new());
    }

    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len == 0 {
        return Ok(Vec::new());
    }

    // Accumulate bytes from EOF backwards until n+1 newlines are in hand —
    // the extra one delimits the start of the oldest wanted line.
    let mut buf: Vec<u8> = Vec::new();
    let mut newlines = 0usize;
    let mut cursor = len;

    while cursor > 0 && newlines <= n {
        let take = cursor.min(CHUNK);
        cursor -= take;

        file.seek(io::SeekFrom::Start(cursor)).await?;
        let mut chunk = vec![0u8; take as usize];
        file.read_exact(&mut chunk).await?;

        newlines += chunk.iter().filter(|&&b| b == b'\n').count();

        chunk.extend_from_slice(&buf);
        buf = chunk;
    }

    let text = String::from_utf8_lossy(&buf);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let lines: Vec<&str> = text.split('\n').collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].iter().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn zero_lines_is_empty() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "a").unwrap();
        f.flush().unwrap();
        assert!(tail_lines(f.path(), 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_file_is_empty() {
        let f = NamedTempFile::new().unwrap();
        assert!(tail_lines(f.path(), 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fewer_lines_than_requested_returns_all() {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f, "one").unwrap();
        writeln!(f, "two").unwrap();
        f.flush().unwrap();
        assert_eq!(tail_lines(f.path(), 50).await.unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn returns_newest_lines_oldest_first() {
        let mut f = NamedTempFile::new().unwrap();
        for i in 0..500 {
            writeln!(f, "line{}", i).unwrap();
        }
        f.flush().unwrap();

        let lines = tail_lines(f.path(), 3).await.unwrap();
        assert_eq!(lines, vec!["line497", "line498", "line499"]);
    }

    #[tokio::test]
    async fn no_trailing_newline_still_counts_last_line() {
        let mut f = NamedTempFile::new().unwrap();
        write!(f, "a\nb\nc").unwrap();
        f.flush().unwrap();
        assert_eq!(tail_lines(f.path(), 2).await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn lines_longer_than_chunk_are_reassembled() {
        let mut f = NamedTempFile::new().unwrap();
        let big_a = "A".repeat(20_000);
        let big_b = "B".repeat(24_000);
        writeln!(f, "{}", big_a).unwrap();
        writeln!(f, "{}", big_b).unwrap();
        f.flush().unwrap();

        let lines = tail_lines(f.path(), 1).await.unwrap();
        assert_eq!(lines, vec![big_b]);
    }
}
