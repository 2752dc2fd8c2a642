//! Filesystem change notifications for the tailed file.
//!
//! The poller's size check stays authoritative. Events only wake it ahead of
//! its next tick, so a missed or spurious event costs latency, never bytes.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};

use notify::{EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::debug;

use crate::WatchError;

/// Watches the parent directory of the source and yields whenever the source
/// itself is created, modified or removed.
///
/// Watching the directory rather than the file keeps events flowing across
/// rotation, when the original inode is replaced by a new file of the same
/// name.
pub struct SourceEvents {
    _watcher: notify::RecommendedWatcher,
    path: PathBuf,
    directory: PathBuf,
    event_stream: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
}

impl Debug for SourceEvents {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("SourceEvents")
            .field("path", &self.path)
            .field("directory", &self.directory)
            .finish()
    }
}

impl SourceEvents {
    /// Starts watching `path`, which need not exist yet.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, WatchError> {
        let path = absolutify(path.as_ref())?;
        let directory = path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "source has no parent"))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            // Only fails once the receiver is gone, at which point nobody is
            // waiting for the event anyway.
            let _ = tx.send(res);
        })
        .map_err(|source| WatchError::Watch {
            path: directory.clone(),
            source,
        })?;

        watcher
            .watch(&directory, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch {
                path: directory.clone(),
                source,
            })?;

        Ok(SourceEvents {
            _watcher: watcher,
            path,
            directory,
            event_stream: rx,
        })
    }

    /// The normalised path events are matched against.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits for the next event touching the source.
    ///
    /// Returns `None` once the watcher has shut down.
    pub async fn changed(&mut self) -> Option<EventKind> {
        while let Some(res) = self.event_stream.recv().await {
            match res {
                Ok(event) => {
                    if let Some(kind) = self.relevant(&event) {
                        return Some(kind);
                    }
                }
                Err(e) => {
                    debug!(path = %self.path.display(), error = %e, "watch error");
                }
            }
        }

        None
    }

    fn relevant(&self, event: &notify::Event) -> Option<EventKind> {
        let touches_source = event.paths.iter().any(|p| p == &self.path);
        match event.kind {
            EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) if touches_source => {
                Some(event.kind)
            }
            _ => None,
        }
    }
}

/// Resolves `path` to an absolute one with a canonical parent, keeping the
/// file name as given so a file that does not exist yet still matches the
/// paths notify reports once it is created.
fn absolutify(path: &Path) -> io::Result<PathBuf> {
    let parent = match path.parent() {
        None => std::env::current_dir()?,
        Some(parent) if parent == Path::new("") => std::env::current_dir()?,
        Some(parent) => parent.to_path_buf(),
    };
    let filename = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?;

    let parent = parent.canonicalize().unwrap_or(parent);

    Ok(parent.join(filename))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    #[test]
    fn test_absolutify_keeps_missing_filename() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("not-yet.log");
        let abs = absolutify(&missing).unwrap();
        assert!(abs.is_absolute());
        assert_eq!(abs.file_name().unwrap(), "not-yet.log");
        assert_eq!(abs.parent().unwrap(), dir.path().canonicalize().unwrap());
    }

    #[test]
    fn test_absolutify_rejects_dotdot() {
        let dir = tempdir().unwrap();
        assert!(absolutify(&dir.path().join("..")).is_err());
    }

    #[tokio::test]
    async fn test_missing_parent_fails() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone").join("app.log");
        assert!(SourceEvents::new(&path).is_err());
    }

    #[tokio::test]
    async fn test_write_wakes_watcher() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let mut events = SourceEvents::new(&path).unwrap();
        assert_eq!(events.path().file_name().unwrap(), "app.log");

        let mut file = tokio::fs::File::create(&path).await.unwrap();
        file.write_all(b"hello\n").await.unwrap();
        file.sync_all().await.unwrap();

        let kind = timeout(Duration::from_secs(2), events.changed())
            .await
            .expect("no event within timeout");
        assert!(kind.is_some());
    }

    #[tokio::test]
    async fn test_sibling_files_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("app.log");
        let mut events = SourceEvents::new(&path).unwrap();

        tokio::fs::write(dir.path().join("other.log"), b"noise\n")
            .await
            .unwrap();

        assert!(timeout(Duration::from_millis(300), events.changed())
            .await
            .is_err());
    }
}
