//! Rotation-tolerant log file follower
//!
//! Reads a file from the beginning and keeps polling it for new lines.
//! Truncation restarts reading at offset 0, including an in-place rewrite
//! that grows past the old offset between polls, which is caught by comparing
//! the leading bytes of the file. When the path is replaced by a
//! different file (same name, new inode) the old handle is drained first and
//! the new file is then read from its start.

use std::collections::VecDeque;
use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Leading bytes kept to recognise the file's content
const FINGERPRINT_SIZE: usize = 1024;

#[derive(Debug, Error)]
pub enum FollowError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Debug)]
pub struct FollowConfig {
    /// How long to wait before checking an idle file again
    pub poll_interval: Duration,

    /// Longer lines are cut to this many bytes
    pub max_line_bytes: usize,
}

impl Default for FollowConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// Device and inode of an open file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileId {
    dev: u64,
    ino: u64,
}

impl FileId {
    #[cfg(unix)]
    fn of(metadata: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;

        Some(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }

    #[cfg(not(unix))]
    fn of(_metadata: &std::fs::Metadata) -> Option<Self> {
        None
    }
}

/// Follows a single log file line by line
pub struct LogFollower {
    path: PathBuf,
    config: FollowConfig,
    file: File,
    id: Option<FileId>,

    /// Bytes consumed from the current file
    offset: u64,

    /// Bytes of a line whose newline has not arrived yet
    partial: Vec<u8>,

    /// Complete lines not handed out yet
    pending: VecDeque<String>,

    /// First bytes read from the current file
    fingerprint: Vec<u8>,

    /// Read position may differ from `offset` after an interrupted check
    reposition: bool,

    /// The last read reached the end of the data written so far
    caught_up: bool,

    buf: Box<[u8]>,
}

impl LogFollower {
    /// Open `path` for following from its first byte
    ///
    /// The file must exist; it may be empty.
    pub async fn open(path: impl AsRef<Path>, config: FollowConfig) -> Result<Self, FollowError> {
        let path = path.as_ref().to_path_buf();
        let (file, id) = open_with_id(&path).await.map_err(|source| FollowError::Open {
            path: path.clone(),
            source,
        })?;

        Ok(Self {
            path,
            config,
            file,
            id,
            offset: 0,
            partial: Vec::new(),
            pending: VecDeque::new(),
            fingerprint: Vec::new(),
            reposition: false,
            caught_up: false,
            buf: vec![0; READ_CHUNK_SIZE].into_boxed_slice(),
        })
    }

    /// Bytes consumed from the file currently open
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Next complete, non-empty line, waiting for one to be written
    ///
    /// Returns `Ok(None)` once `cancel` fires.
    pub async fn next_line(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, FollowError> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Ok(Some(line));
            }
            if cancel.is_cancelled() {
                return Ok(None);
            }

            // The writer may have truncated, rewritten or replaced the file
            // since we last caught up with it
            if self.caught_up {
                self.check_rotation().await?;
                if !self.pending.is_empty() {
                    continue;
                }
            }

            let read = self.read_chunk().await?;
            self.caught_up = read < self.buf.len();
            if read > 0 {
                continue;
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
    }

    /// Read whatever is available, returning the number of bytes read
    async fn read_chunk(&mut self) -> Result<usize, FollowError> {
        if self.reposition {
            self.file
                .seek(SeekFrom::Start(self.offset))
                .await
                .map_err(|source| self.read_error(source))?;
            self.reposition = false;
        }

        let read = self
            .file
            .read(&mut self.buf)
            .await
            .map_err(|source| self.read_error(source))?;

        // Offset equals the fingerprint length until the fingerprint is full
        if self.fingerprint.len() < FINGERPRINT_SIZE {
            let take = (FINGERPRINT_SIZE - self.fingerprint.len()).min(read);
            self.fingerprint.extend_from_slice(&self.buf[..take]);
        }

        self.offset += read as u64;
        split_lines(
            &self.buf[..read],
            &mut self.partial,
            &mut self.pending,
            self.config.max_line_bytes,
        );
        Ok(read)
    }

    async fn check_rotation(&mut self) -> Result<(), FollowError> {
        let len = self
            .file
            .metadata()
            .await
            .map_err(|source| self.read_error(source))?
            .len();

        if len < self.offset || !self.fingerprint_matches().await? {
            info!(path = %self.path.display(), len, offset = self.offset, "file truncated, reading from start");
            self.file
                .seek(SeekFrom::Start(0))
                .await
                .map_err(|source| self.read_error(source))?;
            self.offset = 0;
            self.reposition = false;
            self.partial.clear();
            self.fingerprint.clear();
            return Ok(());
        }

        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "file gone, waiting for it to reappear");
                return Ok(());
            }
            Err(source) => return Err(self.read_error(source)),
        };

        if FileId::of(&metadata) == self.id {
            return Ok(());
        }

        let (file, id) = match open_with_id(&self.path).await {
            Ok(opened) => opened,
            // Replaced again between stat and open; retry on the next poll
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(FollowError::Open {
                    path: self.path.clone(),
                    source,
                });
            }
        };

        info!(path = %self.path.display(), "file replaced, reopening");
        while self.read_chunk().await? > 0 {}
        self.flush_partial();
        self.file = file;
        self.id = id;
        self.offset = 0;
        self.reposition = false;
        self.fingerprint.clear();
        Ok(())
    }

    /// Whether the file still starts with the bytes first read from it
    ///
    /// Leaves the read position at the current offset.
    async fn fingerprint_matches(&mut self) -> Result<bool, FollowError> {
        if self.fingerprint.is_empty() {
            return Ok(true);
        }

        let mut head = vec![0u8; self.fingerprint.len()];
        let mut filled = 0;
        self.reposition = true;
        self.file
            .seek(SeekFrom::Start(0))
            .await
            .map_err(|source| self.read_error(source))?;
        while filled < head.len() {
            let read = self
                .file
                .read(&mut head[filled..])
                .await
                .map_err(|source| self.read_error(source))?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        self.file
            .seek(SeekFrom::Start(self.offset))
            .await
            .map_err(|source| self.read_error(source))?;
        self.reposition = false;

        Ok(head[..filled] == self.fingerprint[..])
    }

    /// Hand out a trailing unterminated line from a file that will not grow again
    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let line = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            self.pending.push_back(line);
        }
    }

    fn read_error(&self, source: io::Error) -> FollowError {
        FollowError::Read {
            path: self.path.clone(),
            source,
        }
    }
}

async fn open_with_id(path: &Path) -> io::Result<(File, Option<FileId>)> {
    let file = File::open(path).await?;
    let id = FileId::of(&file.metadata().await?);
    Ok((file, id))
}

/// Append `bytes` to the line in progress, moving completed lines to `lines`
fn split_lines(bytes: &[u8], partial: &mut Vec<u8>, lines: &mut VecDeque<String>, max: usize) {
    let mut rest = bytes;
    while let Some(newline) = rest.iter().position(|b| *b == b'\n') {
        append_capped(partial, &rest[..newline], max);
        if !partial.is_empty() {
            lines.push_back(String::from_utf8_lossy(partial).into_owned());
            partial.clear();
        }
        rest = &rest[newline + 1..];
    }
    append_capped(partial, rest, max);
}

fn append_capped(partial: &mut Vec<u8>, bytes: &[u8], max: usize) {
    let room = max.saturating_sub(partial.len());
    partial.extend_from_slice(&bytes[..bytes.len().min(room)]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fast() -> FollowConfig {
        FollowConfig {
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn append(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    async fn next(follower: &mut LogFollower) -> String {
        tokio::time::timeout(
            Duration::from_secs(5),
            follower.next_line(&CancellationToken::new()),
        )
        .await
        .expect("timed out waiting for a line")
        .unwrap()
        .unwrap()
    }

    #[test]
    fn test_split_lines() {
        let mut partial = Vec::new();
        let mut lines = VecDeque::new();

        split_lines(b"one\n\ntwo\nthr", &mut partial, &mut lines, 1024);
        assert_eq!(lines, ["one", "two"]);
        assert_eq!(partial, b"thr");

        split_lines(b"ee\n", &mut partial, &mut lines, 1024);
        assert_eq!(lines, ["one", "two", "three"]);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_split_lines_caps_long_lines() {
        let mut partial = Vec::new();
        let mut lines = VecDeque::new();

        split_lines(b"abcdefgh\nxy\n", &mut partial, &mut lines, 4);
        assert_eq!(lines, ["abcd", "xy"]);
    }

    #[tokio::test]
    async fn test_reads_existing_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "first\nsecond\n").unwrap();

        let mut follower = LogFollower::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut follower).await, "first");
        assert_eq!(next(&mut follower).await, "second");
        assert_eq!(follower.offset(), 13);
    }

    #[tokio::test]
    async fn test_follows_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let mut follower = LogFollower::open(&path, fast()).await.unwrap();
        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                append(&path, "later\n");
            })
        };

        assert_eq!(next(&mut follower).await, "later");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_buffers_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "par").unwrap();

        let mut follower = LogFollower::open(&path, fast()).await.unwrap();
        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                append(&path, "tial\n");
            })
        };

        assert_eq!(next(&mut follower).await, "partial");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_restarts_after_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\n").unwrap();

        let mut follower = LogFollower::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut follower).await, "one");
        assert_eq!(next(&mut follower).await, "two");

        std::fs::write(&path, "x\n").unwrap();
        assert_eq!(next(&mut follower).await, "x");
    }

    #[tokio::test]
    async fn test_restarts_after_rewrite_past_old_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "aaaa\n").unwrap();

        let mut follower = LogFollower::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut follower).await, "aaaa");

        // Truncated and rewritten in place, longer than before, between polls
        std::fs::write(&path, "first-after-truncate\nsecond\n").unwrap();
        assert_eq!(next(&mut follower).await, "first-after-truncate");
        assert_eq!(next(&mut follower).await, "second");
    }

    #[tokio::test]
    async fn test_growing_file_keeps_offset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\n").unwrap();

        let mut follower = LogFollower::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut follower).await, "one");

        // Idle polls compare the fingerprint without moving the offset
        let idle = tokio::time::timeout(
            Duration::from_millis(50),
            follower.next_line(&CancellationToken::new()),
        )
        .await;
        assert!(idle.is_err());
        assert_eq!(follower.offset(), 4);

        append(&path, "two\n");
        assert_eq!(next(&mut follower).await, "two");
        assert_eq!(follower.offset(), 8);
    }

    #[tokio::test]
    async fn test_reopens_replaced_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old\n").unwrap();

        let mut follower = LogFollower::open(&path, fast()).await.unwrap();
        assert_eq!(next(&mut follower).await, "old");

        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&path, "new file content\n").unwrap();

        assert_eq!(next(&mut follower).await, "new file content");
    }

    #[tokio::test]
    async fn test_cancel_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "").unwrap();

        let mut follower = LogFollower::open(&path, fast()).await.unwrap();
        let cancel = CancellationToken::new();
        let waiter = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            waiter.cancel();
        });

        let line = tokio::time::timeout(Duration::from_secs(5), follower.next_line(&cancel))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(line, None);
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = LogFollower::open(dir.path().join("missing.log"), fast())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, FollowError::Open { .. }));
    }
}
