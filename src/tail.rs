//! The engine tying one source file to its observers.

use std::fmt;

use std::path::Path;

use bytes::{Bytes, BytesMut};
use futures_util::sink::Sink;
use tokio::fs::File;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::reader::{locate_with_chunk_size, snapshot_range, tail_lines_with_chunk_size};
use crate::session::Session;
use crate::{Chunk, Config, Frame, Observer, Poller, Registry, SessionHandle, TailError};

/// Tails one file and streams what is appended to every connected observer.
///
/// ```no_run
/// use tailcast::{Config, Frame, LogTail};
///
/// # async fn run() -> Result<(), tailcast::TailError> {
/// let mut tail = LogTail::new(Config::new("/var/log/app.log")).await?;
/// let _poller = tail.spawn_poller();
///
/// let (tx, mut rx) = tokio::sync::mpsc::channel::<Frame>(16);
/// let session = tail.connect(tokio_util::sync::PollSender::new(tx)).await?;
/// while let Some(frame) = rx.recv().await {
///     if let Frame::Data(chunk) = frame {
///         print!("{}", String::from_utf8_lossy(chunk.data()));
///     }
/// }
/// session.close();
/// # Ok(())
/// # }
/// ```
pub struct LogTail {
    config: Config,
    registry: Registry,
    poller: Option<Poller>,
    shutdown: CancellationToken,
}

impl fmt::Debug for LogTail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogTail")
            .field("path", &self.config.path)
            .field("poller_started", &self.poller.is_none())
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl LogTail {
    /// Opens the source named by `config` and starts tracking it from its
    /// current end.
    pub async fn new(config: Config) -> Result<Self, TailError> {
        let poller = Poller::new(config.path.clone())
            .await?
            .with_interval(config.poll_interval)
            .with_watch_events(config.watch_events);
        let registry = Registry::new(poller.offset());

        Ok(LogTail {
            config,
            registry,
            poller: Some(poller),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Spawns the change poller. Returns `None` if it was already spawned.
    ///
    /// The task ends with `Ok(())` on [`shutdown`](Self::shutdown) and with
    /// [`TailError::SourceGone`] if the file disappears.
    pub fn spawn_poller(&mut self) -> Option<JoinHandle<Result<(), TailError>>> {
        let poller = self.poller.take()?;
        Some(tokio::spawn(
            poller.run(self.registry.clone(), self.shutdown.child_token()),
        ))
    }

    /// Attaches a consumer.
    ///
    /// The consumer's first frame is the last `lines` lines of the file, up
    /// to the point the live stream continues from; every later chunk follows
    /// on without gap or overlap. Keepalives are interleaved on the
    /// configured interval.
    pub async fn connect<S>(&self, sink: S) -> Result<SessionHandle, TailError>
    where
        S: Sink<Frame> + Send + 'static,
        S::Error: fmt::Display,
    {
        let (observer, frames) = Observer::channel(self.config.observer_queue);
        let path = &self.config.path;

        // Read without the registry lock so broadcasts are not held up by a
        // large tail; only the seam with the watermark is fixed up under it.
        let initial = InitialTail::read(path, self.config.lines, self.config.chunk_size).await?;
        let id = self
            .registry
            .register_with_prelude(observer, |watermark| initial.align(watermark, path))
            .await?;

        let cancel = self.shutdown.child_token();
        let session = Session::new(
            id,
            frames,
            sink,
            self.registry.clone(),
            cancel.clone(),
            self.shutdown.clone(),
            self.config.keepalive_interval,
            self.config.send_timeout,
        );
        debug!(observer = %id, "session started");

        Ok(SessionHandle::new(id, cancel, tokio::spawn(session.run())))
    }

    /// The last `lines` lines of the file as they are right now, for
    /// embedding in an initial page render.
    pub async fn tail_text(&self) -> Result<Bytes, TailError> {
        tail_lines_with_chunk_size(&self.config.path, self.config.lines, self.config.chunk_size).await
    }

    pub async fn observer_count(&self) -> usize {
        self.registry.len().await
    }

    /// Stops the poller and closes every session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.clear().await;
    }
}

/// The last lines of the source as read before registration, ending at
/// whatever the file length was at that moment.
#[derive(Debug)]
struct InitialTail {
    start: u64,
    data: BytesMut,
}

impl InitialTail {
    async fn read(path: &Path, lines: usize, chunk_size: usize) -> Result<Self, TailError> {
        let mut file = File::open(path).await?;
        let len = file.metadata().await?.len();
        let start = locate_with_chunk_size(&mut file, lines, chunk_size).await?.min(len);
        let data = snapshot_range(&mut file, start, len).await?;

        Ok(InitialTail {
            start,
            data: BytesMut::from(&data[..]),
        })
    }

    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    /// Makes the tail end exactly at `watermark`.
    ///
    /// A watermark behind the tail cuts it short; one ahead of it means chunks
    /// were broadcast since the read, and only those missing bytes are fetched.
    async fn align(mut self, watermark: u64, path: &Path) -> Result<Option<Chunk>, TailError> {
        let end = self.end();
        if watermark <= end {
            let keep = watermark.saturating_sub(self.start) as usize;
            self.data.truncate(keep);
        } else {
            let mut file = File::open(path).await?;
            let len = file.metadata().await?.len();
            // Before the poller notices a truncation the watermark can lie
            // past the end of the file.
            let missing = snapshot_range(&mut file, end, watermark.min(len).max(end)).await?;
            self.data.extend_from_slice(&missing);
        }

        let chunk = Chunk::new(self.start, self.data.freeze());
        Ok(Some(chunk).filter(|chunk| !chunk.is_empty()))
    }
}

impl Drop for LogTail {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
