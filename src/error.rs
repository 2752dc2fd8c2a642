//! Error types shared by the locator, poller and broadcast registry.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or tracking the tailed file.
#[derive(Debug, Error)]
pub enum TailError {
    /// Open, stat or read failed. The poller retries on its next tick.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A computed read position lies outside the file.
    ///
    /// Offsets are clamped before seeking, so seeing this means the tracked
    /// offset and the file disagree in a way the poller cannot explain.
    #[error("invalid seek to offset {offset} in file of length {len}")]
    Seek { offset: u64, len: u64 },
    /// The tailed file no longer exists at its path.
    #[error("source file {} disappeared", .0.display())]
    SourceGone(PathBuf),
}

impl TailError {
    /// Returns `true` if the poller should stop tailing the source once the
    /// condition outlasts a poll interval.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TailError::SourceGone(_))
    }
}

/// Reasons a single observer could not be reached.
///
/// These never leave the registry or the observer's session; they are logged
/// and turned into removal of that observer.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("observer queue is full")]
    QueueFull,
    #[error("observer channel closed")]
    Closed,
    #[error("send exceeded liveness deadline")]
    Timeout,
    #[error("sink error: {0}")]
    Sink(String),
}

/// Installing the filesystem watcher failed. Polling continues without it.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("failed to resolve watch path: {0}")]
    Path(#[from] io::Error),
}
