//! A library for live tailing of a growing log file, broadcast to any number
//! of connected observers.
//!
//! New observers first receive the last few lines of the file, located by
//! scanning backward from its end in fixed-size chunks. From then on a
//! polling loop reads each appended byte range and fans it out through a
//! registry that drops any observer it cannot reach.
//!
//! ## Example
//!
//! ```no_run
//! use tailcast::{Config, Frame, LogTail};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tailcast::TailError> {
//!     let mut tail = LogTail::new(Config::new("some/file.log").with_lines(10)).await?;
//!     let poller = tail.spawn_poller();
//!
//!     // Any `futures::Sink<Frame>` works; a websocket sink would map
//!     // `Frame::Data` to a text message and `Frame::Keepalive` to a ping.
//!     let (tx, mut rx) = tokio::sync::mpsc::channel(16);
//!     let _session = tail.connect(tokio_util::sync::PollSender::new(tx)).await?;
//!
//!     while let Some(frame) = rx.recv().await {
//!         if let Frame::Data(chunk) = frame {
//!             print!("{}", String::from_utf8_lossy(chunk.data()));
//!         }
//!     }
//!     drop(poller);
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! Delivery is best effort. An observer whose queue fills up, or whose sink
//! misses the send deadline, is dropped rather than buffered. A truncated
//! source is followed from its new end; the rewritten content before that
//! point is not replayed.

mod config;
mod error;
mod events;
mod poller;
mod reader;
mod registry;
mod session;
mod tail;

pub use config::Config;
pub use error::{DeliveryError, TailError, WatchError};
pub use events::SourceEvents;
pub use poller::{Poller, Tick};
pub use reader::{
    locate, locate_with_chunk_size, snapshot, snapshot_range, tail_lines, Chunk,
    DEFAULT_CHUNK_SIZE,
};
pub use registry::{Observer, ObserverId, Registry};
pub use session::{CloseReason, Frame, SessionHandle, SessionState};
pub use tail::LogTail;

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
