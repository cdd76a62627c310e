use crate::record::BenchRecord;
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

/// Incremental reader over an append-only JSON-lines file.
///
/// Only complete JSON objects are consumed. A trailing object that is still
/// being written stays unread until a later poll sees it whole; a malformed
/// line that is followed by more data is skipped.
#[derive(Debug)]
pub struct JsonTail {
    path: PathBuf,
    offset: u64,
}

impl JsonTail {
    /// Tail from the beginning of the file.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
        }
    }

    /// Tail from the current end of the file, so only records appended from
    /// now on are returned. A missing file starts at offset zero.
    pub fn from_end(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offset = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Self { path, offset }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read every complete record appended since the last poll.
    ///
    /// Absent or unreadable files yield no records rather than an error.
    pub async fn poll(&mut self) -> Vec<BenchRecord> {
        let buf = match self.read_new_bytes().await {
            Ok(buf) => buf,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read results file");
                return Vec::new();
            }
        };

        let mut records = Vec::new();
        let mut consumed = 0usize;
        let mut start = 0usize;
        while start < buf.len() {
            let (end, terminated) = match buf[start..].iter().position(|b| *b == b'\n') {
                Some(i) => (start + i, true),
                None => (buf.len(), false),
            };
            let next = if terminated { end + 1 } else { end };
            let line = String::from_utf8_lossy(&buf[start..end]);

            if line.trim().is_empty() {
                consumed = next;
            } else if let Some(record) = BenchRecord::parse_line(&line) {
                records.push(record);
                consumed = next;
            } else if terminated {
                debug!(path = %self.path.display(), "Skipping malformed results line");
                consumed = next;
            } else {
                // Still being written
                break;
            }
            start = next;
        }

        self.offset += consumed as u64;
        records
    }

    async fn read_new_bytes(&mut self) -> std::io::Result<Vec<u8>> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        let len = file.metadata().await?.len();
        if len < self.offset {
            debug!(
                path = %self.path.display(),
                offset = self.offset,
                len,
                "Results file shrank; rereading from the start"
            );
            self.offset = 0;
        }
        file.seek(std::io::SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn append(path: &Path, s: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(s.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_missing_file_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let mut tail = JsonTail::new(dir.path().join("absent.json"));
        assert!(tail.poll().await.is_empty());
        assert_eq!(tail.offset(), 0);
    }

    #[tokio::test]
    async fn test_partial_record_waits_for_completion() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");

        append(&path, "{\"concurrency\": 1}\n{\"concurrency\": ");
        let mut tail = JsonTail::new(&path);
        let first = tail.poll().await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].concurrency(), Some(1));

        append(&path, "2}");
        let second = tail.poll().await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].concurrency(), Some(2));

        assert!(tail.poll().await.is_empty());
    }

    #[tokio::test]
    async fn test_from_end_ignores_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        append(&path, "{\"concurrency\": 1}");

        let mut tail = JsonTail::from_end(&path);
        assert!(tail.poll().await.is_empty());

        append(&path, "\n{\"concurrency\": 4}");
        let records = tail.poll().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].concurrency(), Some(4));
    }

    #[tokio::test]
    async fn test_malformed_line_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        append(&path, "not json\n{\"concurrency\": 8}\n");

        let mut tail = JsonTail::new(&path);
        let records = tail.poll().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].concurrency(), Some(8));
    }

    #[tokio::test]
    async fn test_truncation_resets_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.json");
        append(&path, "{\"concurrency\": 16, \"padding\": \"xxxxxxxxxxxxxxxx\"}\n");

        let mut tail = JsonTail::new(&path);
        assert_eq!(tail.poll().await.len(), 1);

        std::fs::write(&path, "{\"concurrency\": 2}\n").unwrap();
        let records = tail.poll().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].concurrency(), Some(2));
    }
}
