use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, BufReader};

use super::{OutputSource, ReadOutcome};
use crate::decode::Utf8Decoder;
use crate::error::Result;

/// Size of one raw block read
pub const BLOCK_SIZE: usize = 4096;

/// How file content is cut into output units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// One unit per line, trailing `\n` / `\r` stripped
    #[default]
    Lines,
    /// Fixed-size blocks, exact bytes preserved
    Blocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    #[default]
    Beginning,
    End,
}

/// Byte offset of the next read into the tailed file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cursor {
    pub offset: u64,
}

/// Follows a growing file, like `tail -f` from the first byte
pub struct FileTailSource {
    path: PathBuf,
    reader: BufReader<File>,
    cursor: Cursor,
    framing: Framing,
    pending: Vec<u8>,
    decoder: Utf8Decoder,
    block: Vec<u8>,
    requires_observer: bool,
}

impl FileTailSource {
    /// Open `path` for tailing from offset 0
    pub async fn open(path: impl Into<PathBuf>, framing: Framing) -> Result<Self> {
        Self::open_at(path, framing, StartPosition::Beginning).await
    }

    pub async fn open_at(
        path: impl Into<PathBuf>,
        framing: Framing,
        start: StartPosition,
    ) -> Result<Self> {
        let path = path.into();
        let file = File::open(&path).await?;
        let mut reader = BufReader::new(file);

        let offset = match start {
            StartPosition::Beginning => 0,
            StartPosition::End => reader.seek(SeekFrom::End(0)).await?,
        };

        Ok(Self {
            path,
            reader,
            cursor: Cursor { offset },
            framing,
            pending: Vec::new(),
            decoder: Utf8Decoder::new(),
            block: vec![0; BLOCK_SIZE],
            requires_observer: true,
        })
    }

    /// Keep reading even when no observer is admitted
    pub fn without_observer(mut self) -> Self {
        self.requires_observer = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> Cursor {
        self.cursor
    }

    /// Start over from offset 0 if the file shrank below the cursor.
    ///
    /// The path is reopened, so a file rotated away and replaced by a new one
    /// is followed rather than re-read. Returns whether the cursor was reset.
    async fn check_truncation(&mut self) -> Result<bool> {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Error checking file");
                return Ok(false);
            }
        };

        if self.cursor.offset <= size {
            return Ok(false);
        }

        tracing::info!(
            path = %self.path.display(),
            offset = self.cursor.offset,
            size,
            "File truncated, reading from the start"
        );
        match File::open(&self.path).await {
            Ok(file) => self.reader = BufReader::new(file),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Reopen failed, rewinding");
                self.reader.seek(SeekFrom::Start(0)).await?;
            }
        }
        self.cursor = Cursor::default();
        Ok(true)
    }

    async fn read_line(&mut self) -> Result<ReadOutcome<String>> {
        // At most one retry, right after the cursor was reset.
        for _ in 0..2 {
            let n = self.reader.read_until(b'\n', &mut self.pending).await?;
            self.cursor.offset += n as u64;

            if self.pending.last() == Some(&b'\n') {
                let line = std::mem::take(&mut self.pending);
                return Ok(ReadOutcome::Data(decode_line(&line)));
            }

            // A line without its newline stays pending until the writer finishes it.
            if n > 0 || !self.check_truncation().await? {
                break;
            }
            if let Some(partial) = self.flush() {
                return Ok(ReadOutcome::Data(partial));
            }
        }
        Ok(ReadOutcome::Idle)
    }

    async fn read_block(&mut self) -> Result<ReadOutcome<String>> {
        for _ in 0..2 {
            let n = self.reader.read(&mut self.block).await?;
            if n > 0 {
                self.cursor.offset += n as u64;
                let text = self.decoder.decode(&self.block[..n]);
                if text.is_empty() {
                    return Ok(ReadOutcome::Idle);
                }
                return Ok(ReadOutcome::Data(text));
            }

            if !self.check_truncation().await? {
                break;
            }
            if let Some(partial) = self.flush() {
                return Ok(ReadOutcome::Data(partial));
            }
        }
        Ok(ReadOutcome::Idle)
    }
}

#[async_trait]
impl OutputSource for FileTailSource {
    async fn read_chunk(&mut self) -> Result<ReadOutcome<String>> {
        match self.framing {
            Framing::Lines => self.read_line().await,
            Framing::Blocks => self.read_block().await,
        }
    }

    fn flush(&mut self) -> Option<String> {
        match self.framing {
            Framing::Lines if !self.pending.is_empty() => {
                let partial = std::mem::take(&mut self.pending);
                Some(decode_line(&partial))
            }
            Framing::Lines => None,
            Framing::Blocks => self.decoder.finish(),
        }
    }

    fn requires_observer(&self) -> bool {
        self.requires_observer
    }
}

fn decode_line(line: &[u8]) -> String {
    String::from_utf8_lossy(line)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, bytes: &[u8]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
    }

    /// Read until the source reports idle
    async fn read_available(source: &mut FileTailSource) -> Vec<String> {
        let mut out = Vec::new();
        while let ReadOutcome::Data(text) = source.read_chunk().await.unwrap() {
            out.push(text);
        }
        out
    }

    #[tokio::test]
    async fn test_lines_strip_delimiters() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nextflow.out");
        append(&path, b"first\nsecond\r\n\nthird\n");

        let mut source = FileTailSource::open(&path, Framing::Lines).await.unwrap();
        let lines = read_available(&mut source).await;

        assert_eq!(lines, vec!["first", "second", "", "third"]);
        assert_eq!(source.cursor().offset, 22);
    }

    #[tokio::test]
    async fn test_partial_line_held_until_newline() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nextflow.out");
        append(&path, b"exec");

        let mut source = FileTailSource::open(&path, Framing::Lines).await.unwrap();
        assert!(read_available(&mut source).await.is_empty());

        append(&path, b"utor > local\nnext");
        assert_eq!(read_available(&mut source).await, vec!["executor > local"]);

        assert_eq!(source.flush().as_deref(), Some("next"));
        assert_eq!(source.flush(), None);
    }

    #[tokio::test]
    async fn test_picks_up_appended_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nextflow.out");
        append(&path, b"one\n");

        let mut source = FileTailSource::open(&path, Framing::Lines).await.unwrap();
        assert_eq!(read_available(&mut source).await, vec!["one"]);
        assert_eq!(source.read_chunk().await.unwrap(), ReadOutcome::Idle);

        append(&path, b"two\n");
        assert_eq!(read_available(&mut source).await, vec!["two"]);
    }

    #[tokio::test]
    async fn test_truncation_resets_cursor() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nextflow.out");
        append(&path, b"aaaa\nbbbb\n");

        let mut source = FileTailSource::open(&path, Framing::Lines).await.unwrap();
        assert_eq!(read_available(&mut source).await, vec!["aaaa", "bbbb"]);
        assert_eq!(source.cursor().offset, 10);

        std::fs::write(&path, b"c\n").unwrap();

        assert_eq!(read_available(&mut source).await, vec!["c"]);
        assert_eq!(source.cursor().offset, 2);
    }

    #[tokio::test]
    async fn test_rotated_file_is_followed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nextflow.out");
        append(&path, b"old run line one\nold run line two\n");

        let mut source = FileTailSource::open(&path, Framing::Lines).await.unwrap();
        assert_eq!(
            read_available(&mut source).await,
            vec!["old run line one", "old run line two"]
        );

        std::fs::rename(&path, dir.path().join("nextflow.out.1")).unwrap();
        append(&path, b"fresh\n");

        assert_eq!(read_available(&mut source).await, vec!["fresh"]);
        assert_eq!(source.cursor().offset, 6);

        append(&path, b"more\n");
        assert_eq!(read_available(&mut source).await, vec!["more"]);
    }

    #[tokio::test]
    async fn test_blocks_reconstruct_exact_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nextflow.out");

        let mut content = String::new();
        while content.len() < BLOCK_SIZE * 3 {
            content.push_str("\x1b[2K\x1b[1A[a1/b2c3] process > ALIGN (☃ sample) [ 42%]\r\n");
        }
        append(&path, content.as_bytes());

        let mut source = FileTailSource::open(&path, Framing::Blocks).await.unwrap();
        let mut out = read_available(&mut source).await.concat();
        if let Some(rest) = source.flush() {
            out.push_str(&rest);
        }

        assert_eq!(out, content);
        assert_eq!(source.cursor().offset, content.len() as u64);
    }

    #[tokio::test]
    async fn test_invalid_bytes_never_fail_the_stream() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nextflow.out");
        append(&path, b"bad \xff byte\nok\n");

        let mut source = FileTailSource::open(&path, Framing::Lines).await.unwrap();
        assert_eq!(
            read_available(&mut source).await,
            vec!["bad \u{FFFD} byte", "ok"]
        );
    }

    #[tokio::test]
    async fn test_start_at_end_skips_existing_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".nextflow.log");
        append(&path, b"old line\n");

        let mut source = FileTailSource::open_at(&path, Framing::Lines, StartPosition::End)
            .await
            .unwrap()
            .without_observer();
        assert!(!source.requires_observer());
        assert!(read_available(&mut source).await.is_empty());

        append(&path, b"new line\n");
        assert_eq!(read_available(&mut source).await, vec!["new line"]);
    }

    #[tokio::test]
    async fn test_open_missing_file_fails() {
        let dir = TempDir::new().unwrap();
        let result = FileTailSource::open(dir.path().join("missing"), Framing::Lines).await;
        assert!(result.is_err());
    }
}
