//! Change detection for the tailed file.
//!
//! Each tick compares the file's size with the offset already delivered. The
//! poller sits WAITING between ticks and moves to READING only when the size
//! grew, fetching exactly `[offset, size)` before returning to WAITING.

use std::fs::Metadata;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tokio::fs::{metadata, File};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::SourceEvents;
use crate::reader::read_range;
use crate::{Chunk, Registry, TailError};

/// Outcome of a single poll.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Tick {
    /// Size matches the tracked offset.
    Unchanged,
    /// The file grew; the chunk holds every appended byte.
    Grew(Chunk),
    /// The file shrank below the tracked offset. Tracking restarts at `to`.
    Truncated { from: u64, to: u64 },
    /// A different file now sits at the source path, e.g. after rotation.
    /// Tracking restarts at 0 so the new file is read from its beginning.
    Replaced { from: u64 },
}

/// Device and inode of the tracked file, where the platform exposes them.
type FileId = (u64, u64);

/// Tracks one source file and turns its growth into chunks.
#[derive(Debug)]
pub struct Poller {
    path: PathBuf,
    offset: u64,
    file_id: Option<FileId>,
    last_checked: Option<Instant>,
    interval: Duration,
    watch_events: bool,
}

impl Poller {
    /// Starts tracking `path` from its current end, so only bytes appended
    /// from now on are reported.
    pub async fn new(path: impl Into<PathBuf>) -> Result<Self, TailError> {
        let path = path.into();
        let (offset, file_id) = stat(&path).await?;

        let mut poller = Poller::starting_at(path, offset);
        poller.file_id = file_id;
        Ok(poller)
    }

    /// Starts tracking `path` from `offset`.
    pub fn starting_at(path: impl Into<PathBuf>, offset: u64) -> Self {
        Poller {
            path: path.into(),
            offset,
            file_id: None,
            last_checked: None,
            interval: Duration::from_secs(1),
            watch_events: false,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Also poll as soon as the filesystem reports a change to the source.
    pub fn with_watch_events(mut self, enabled: bool) -> Self {
        self.watch_events = enabled;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// End of the bytes already reported.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// When the source was last stat'ed successfully.
    pub fn last_checked(&self) -> Option<Instant> {
        self.last_checked
    }

    /// Checks the source once and reads whatever was appended.
    ///
    /// On error the offset is left untouched, so the next call retries the
    /// same range. A missing file is reported as [`TailError::SourceGone`];
    /// deciding whether that is final is left to the caller.
    pub async fn poll_once(&mut self) -> Result<Tick, TailError> {
        let (size, file_id) = stat(&self.path).await?;
        self.last_checked = Some(Instant::now());

        match (self.file_id, file_id) {
            (Some(known), Some(current)) if known != current => {
                let from = self.offset;
                self.offset = 0;
                self.file_id = Some(current);
                return Ok(Tick::Replaced { from });
            }
            (None, current) => self.file_id = current,
            _ => {}
        }

        if size == self.offset {
            return Ok(Tick::Unchanged);
        }

        if size < self.offset {
            let from = self.offset;
            self.offset = size;
            return Ok(Tick::Truncated { from, to: size });
        }

        let mut file = File::open(&self.path).await.map_err(|e| gone_or_io(&self.path, e))?;
        let opened = file_identity(&file.metadata().await?);
        if opened.is_some() && opened != self.file_id {
            // Swapped between the stat and the open; the next tick sees it.
            return Err(TailError::Io(io::Error::new(
                io::ErrorKind::Other,
                "source replaced during read",
            )));
        }

        let data = read_range(&mut file, self.offset, size).await?;
        let chunk = Chunk::new(self.offset, data);
        self.offset = size;

        Ok(Tick::Grew(chunk))
    }

    /// Polls until `shutdown` fires or the source disappears, handing each
    /// chunk to `registry`.
    ///
    /// Transient I/O errors are logged and retried on the next tick. A source
    /// that goes missing is given one full poll interval to reappear, which
    /// covers rename-and-recreate rotation; after that the loop ends with
    /// [`TailError::SourceGone`].
    pub async fn run(mut self, registry: Registry, shutdown: CancellationToken) -> Result<(), TailError> {
        info!(path = %self.path.display(), offset = self.offset, "tailing");

        let mut events = if self.watch_events {
            match SourceEvents::new(&self.path) {
                Ok(events) => Some(events),
                Err(e) => {
                    warn!(path = %self.path.display(), error = %e, "change events unavailable, polling only");
                    None
                }
            }
        } else {
            None
        };

        let mut ticker = time::interval(self.interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut missing_since: Option<Instant> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(path = %self.path.display(), "stopped tailing");
                    return Ok(());
                }
                _ = ticker.tick() => {}
                event = next_event(&mut events) => match event {
                    Some(kind) => debug!(path = %self.path.display(), ?kind, "change event"),
                    None => {
                        debug!(path = %self.path.display(), "change events closed");
                        events = None;
                    }
                },
            }

            let mut repoll = true;
            while repoll {
                repoll = false;
                let res = self.poll_once().await;
                if !matches!(res, Err(TailError::SourceGone(_))) {
                    missing_since = None;
                }

                match res {
                    Ok(Tick::Unchanged) => {}
                    Ok(Tick::Grew(chunk)) => {
                        let (from, to) = (chunk.start(), chunk.end());
                        let observers = registry.broadcast(chunk).await;
                        debug!(from, to, observers, "broadcast");
                    }
                    Ok(Tick::Truncated { from, to }) => {
                        info!(path = %self.path.display(), from, to, "source truncated");
                        registry.reset_watermark(to).await;
                    }
                    Ok(Tick::Replaced { from }) => {
                        info!(path = %self.path.display(), from, "source replaced");
                        registry.reset_watermark(0).await;
                        // Pick up whatever the new file already holds.
                        repoll = true;
                    }
                    Err(TailError::SourceGone(path)) => {
                        let since = *missing_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= self.interval {
                            error!(path = %path.display(), "source lost");
                            return Err(TailError::SourceGone(path));
                        }
                        debug!(path = %path.display(), "source missing, waiting for it to reappear");
                    }
                    Err(e @ TailError::Seek { .. }) => {
                        error!(path = %self.path.display(), error = %e, "offset out of bounds");
                    }
                    Err(e) => {
                        warn!(path = %self.path.display(), error = %e, "poll failed, retrying");
                    }
                }
            }
        }
    }
}

async fn next_event(events: &mut Option<SourceEvents>) -> Option<notify::EventKind> {
    match events {
        Some(events) => events.changed().await,
        None => std::future::pending().await,
    }
}

async fn stat(path: &Path) -> Result<(u64, Option<FileId>), TailError> {
    metadata(path)
        .await
        .map(|m| (m.len(), file_identity(&m)))
        .map_err(|e| gone_or_io(path, e))
}

#[cfg(unix)]
fn file_identity(m: &Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;

    Some((m.dev(), m.ino()))
}

#[cfg(not(unix))]
fn file_identity(_: &Metadata) -> Option<FileId> {
    None
}

fn gone_or_io(path: &Path, e: io::Error) -> TailError {
    if e.kind() == io::ErrorKind::NotFound {
        TailError::SourceGone(path.to_path_buf())
    } else {
        TailError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn append(path: &Path, data: &[u8]) {
        let mut file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data).unwrap();
    }

    #[tokio::test]
    async fn test_starts_at_end() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"old\n").unwrap();

        let mut poller = Poller::new(&path).await.unwrap();
        assert_eq!(poller.path(), path.as_path());
        assert_eq!(poller.offset(), 4);
        assert!(poller.last_checked().is_none());
        assert_eq!(poller.poll_once().await.unwrap(), Tick::Unchanged);
        assert!(poller.last_checked().is_some());
    }

    #[tokio::test]
    async fn test_reads_exactly_the_delta() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"a\n").unwrap();
        let mut poller = Poller::new(&path).await.unwrap();

        append(&path, b"b\nc\n");
        assert_eq!(
            poller.poll_once().await.unwrap(),
            Tick::Grew(Chunk::new(2, &b"b\nc\n"[..]))
        );
        assert_eq!(poller.offset(), 6);
        assert_eq!(poller.poll_once().await.unwrap(), Tick::Unchanged);
    }

    #[tokio::test]
    async fn test_no_gap_no_overlap() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();
        let mut poller = Poller::new(&path).await.unwrap();

        let appends: Vec<Vec<u8>> = (0..25)
            .map(|i| format!("entry {i}{}", if i % 3 == 0 { "" } else { "\n" }).into_bytes())
            .collect();
        let mut expected = Vec::new();
        let mut received = Vec::new();
        let mut next_start = 0;

        for (i, data) in appends.iter().enumerate() {
            append(&path, data);
            expected.extend_from_slice(data);
            // Skip some polls so deltas span several appends.
            if i % 4 == 3 {
                continue;
            }
            if let Tick::Grew(chunk) = poller.poll_once().await.unwrap() {
                assert_eq!(chunk.start(), next_start);
                next_start = chunk.end();
                received.extend_from_slice(chunk.data());
            }
        }
        if let Tick::Grew(chunk) = poller.poll_once().await.unwrap() {
            assert_eq!(chunk.start(), next_start);
            received.extend_from_slice(chunk.data());
        }

        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn test_truncation_resets_to_new_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"0123456789\n").unwrap();
        let mut poller = Poller::new(&path).await.unwrap();

        std::fs::write(&path, b"new\n").unwrap();
        assert_eq!(
            poller.poll_once().await.unwrap(),
            Tick::Truncated { from: 11, to: 4 }
        );
        assert_eq!(poller.offset(), 4);

        append(&path, b"more\n");
        assert_eq!(
            poller.poll_once().await.unwrap(),
            Tick::Grew(Chunk::new(4, &b"more\n"[..]))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replaced_file_restarts_at_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"old content\n").unwrap();
        let mut poller = Poller::new(&path).await.unwrap();

        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        std::fs::write(&path, b"ab\n").unwrap();

        assert_eq!(poller.poll_once().await.unwrap(), Tick::Replaced { from: 12 });
        assert_eq!(poller.offset(), 0);
        assert_eq!(
            poller.poll_once().await.unwrap(),
            Tick::Grew(Chunk::new(0, &b"ab\n"[..]))
        );
    }

    #[tokio::test]
    async fn test_run_survives_brief_absence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"x\n").unwrap();
        let poller = Poller::new(&path)
            .await
            .unwrap()
            .with_interval(Duration::from_millis(300))
            .with_watch_events(true);
        let registry = Registry::new(2);
        let (observer, mut rx) = crate::Observer::channel(4);
        registry.register(observer).await;

        let task = tokio::spawn(poller.run(registry.clone(), CancellationToken::new()));
        time::sleep(Duration::from_millis(50)).await;
        std::fs::rename(&path, dir.path().join("app.log.1")).unwrap();
        time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&path, b"new\n").unwrap();

        let frame = time::timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
        assert_eq!(frame, Some(crate::Frame::Data(Chunk::new(0, &b"new\n"[..]))));
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn test_missing_source_is_terminal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"x\n").unwrap();
        let mut poller = Poller::new(&path).await.unwrap();

        std::fs::remove_file(&path).unwrap();
        let err = poller.poll_once().await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(poller.offset(), 2);
    }

    #[tokio::test]
    async fn test_new_on_missing_file_fails() {
        let dir = tempdir().unwrap();
        match Poller::new(dir.path().join("nope.log")).await {
            Err(TailError::SourceGone(_)) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();
        let poller = Poller::new(&path)
            .await
            .unwrap()
            .with_interval(Duration::from_millis(10));
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(poller.run(Registry::new(0), shutdown.clone()));
        shutdown.cancel();
        let res = time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(res.is_ok());
    }

    #[tokio::test]
    async fn test_run_reports_source_loss() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, b"").unwrap();
        let poller = Poller::new(&path)
            .await
            .unwrap()
            .with_interval(Duration::from_millis(10));

        let task = tokio::spawn(poller.run(Registry::new(0), CancellationToken::new()));
        std::fs::remove_file(&path).unwrap();
        let res = time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
        assert!(matches!(res, Err(TailError::SourceGone(_))));
    }
}
