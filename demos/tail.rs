//! Follows a file the way a connected browser would see it.
//!
//! Usage:
//!     tail /path/to/file.log [lines]
//!
//! Prints the initial tail, then every appended chunk as it is broadcast.
//! Set `RUST_LOG=tailcast=debug` to watch the poller and sessions.

use tailcast::{Config, Frame, LogTail};
use tokio::sync::mpsc;
use tokio_util::sync::PollSender;
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let path = args.next().ok_or("usage: tail <file> [lines]")?;
    let lines = match args.next() {
        Some(n) => n.parse()?,
        None => Config::default().lines,
    };

    let mut tail = LogTail::new(Config::new(path).with_lines(lines)).await?;
    let poller = tail.spawn_poller().ok_or("poller already running")?;

    let (tx, mut rx) = mpsc::channel(64);
    let session = tail.connect(PollSender::new(tx)).await?;

    let printer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                Frame::Data(chunk) => print!("{}", String::from_utf8_lossy(chunk.data())),
                Frame::Keepalive => {}
            }
        }
    });

    // Runs until the source disappears.
    let res = poller.await?;
    session.close();
    let _ = printer.await;

    Ok(res?)
}
