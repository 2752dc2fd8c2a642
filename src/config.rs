use std::path::PathBuf;
use std::time::Duration;

use crate::reader::DEFAULT_CHUNK_SIZE;

/// Settings for one tailed file and the observers attached to it.
///
/// The source path is supplied by whatever front end embeds the engine; the
/// remaining fields have defaults suited to a log viewer refreshing once a
/// second.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// File to tail.
    pub path: PathBuf,
    /// Number of trailing lines sent to a newly connected observer.
    pub lines: usize,
    /// Bytes read per backward step while locating the initial tail.
    pub chunk_size: usize,
    /// Interval between size checks of the source file.
    pub poll_interval: Duration,
    /// Interval between keepalive frames sent to each observer.
    pub keepalive_interval: Duration,
    /// Liveness deadline for a single send to an observer's sink.
    pub send_timeout: Duration,
    /// Frames buffered per observer before it counts as too slow and is
    /// dropped.
    pub observer_queue: usize,
    /// Wake the poller early on filesystem change events.
    pub watch_events: bool,
}

impl Config {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Config {
            path: path.into(),
            ..Config::default()
        }
    }

    pub fn with_lines(mut self, lines: usize) -> Self {
        self.lines = lines;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_keepalive_interval(mut self, interval: Duration) -> Self {
        self.keepalive_interval = interval;
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    pub fn with_observer_queue(mut self, frames: usize) -> Self {
        // tokio's bounded channels reject a zero capacity.
        self.observer_queue = frames.max(1);
        self
    }

    pub fn with_watch_events(mut self, enabled: bool) -> Self {
        self.watch_events = enabled;
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            path: PathBuf::new(),
            lines: 4,
            chunk_size: DEFAULT_CHUNK_SIZE,
            poll_interval: Duration::from_secs(1),
            keepalive_interval: Duration::from_secs(1),
            send_timeout: Duration::from_secs(5),
            observer_queue: 64,
            watch_events: true,
        }
    }
}
