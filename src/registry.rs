//! The live set of observers and fan-out of chunks to them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use crate::session::Frame;
use crate::{Chunk, DeliveryError, TailError};

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a connected observer.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ObserverId(u64);

impl ObserverId {
    fn next() -> Self {
        ObserverId(NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Registry entry for one consumer: its identity and the bounded queue its
/// session drains.
#[derive(Debug)]
pub struct Observer {
    id: ObserverId,
    queue: mpsc::Sender<Frame>,
}

impl Observer {
    /// Creates an observer with room for `capacity` undelivered frames, and
    /// the receiving end for its session.
    pub fn channel(capacity: usize) -> (Observer, mpsc::Receiver<Frame>) {
        let (queue, frames) = mpsc::channel(capacity.max(1));
        let observer = Observer {
            id: ObserverId::next(),
            queue,
        };

        (observer, frames)
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Queues `frame` without waiting. A full queue means the consumer has
    /// fallen behind and counts as a failed delivery.
    fn deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        self.queue.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Debug)]
struct Shared {
    observers: HashMap<ObserverId, Observer>,
    /// End offset of the last chunk handed to observers.
    watermark: u64,
}

/// Owns the set of connected observers.
///
/// Registration, removal and each broadcast run one at a time under a single
/// lock, so a broadcast never races a concurrent insert or removal. Cloning
/// yields another handle to the same set.
#[derive(Clone, Debug)]
pub struct Registry {
    shared: Arc<Mutex<Shared>>,
}

impl Registry {
    /// Creates an empty registry whose broadcasts will continue from
    /// `watermark`.
    pub fn new(watermark: u64) -> Self {
        Registry {
            shared: Arc::new(Mutex::new(Shared {
                observers: HashMap::new(),
                watermark,
            })),
        }
    }

    /// Adds `observer` to the set. Any chunk broadcast afterwards reaches it.
    pub async fn register(&self, observer: Observer) -> ObserverId {
        let id = observer.id();
        let mut shared = self.shared.lock().await;
        shared.observers.insert(id, observer);
        debug!(observer = %id, observers = shared.observers.len(), "registered");

        id
    }

    /// Adds `observer` after queueing it the chunk produced by `prelude`.
    ///
    /// `prelude` receives the current watermark and runs while the lock is
    /// held, so no broadcast can slip between the prelude and registration.
    /// A prelude ending exactly at the watermark therefore joins the live
    /// stream without gap or overlap.
    ///
    /// Every broadcast waits on the prelude, so it should only reconcile work
    /// prepared beforehand with the watermark, not do the bulk of the reading.
    pub async fn register_with_prelude<F, Fut>(
        &self,
        observer: Observer,
        prelude: F,
    ) -> Result<ObserverId, TailError>
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = Result<Option<Chunk>, TailError>>,
    {
        let id = observer.id();
        let mut shared = self.shared.lock().await;

        if let Some(chunk) = prelude(shared.watermark).await? {
            if let Err(e) = observer.deliver(Frame::Data(chunk)) {
                debug!(observer = %id, error = %e, "observer gone before registration");
                return Ok(id);
            }
        }

        shared.observers.insert(id, observer);
        debug!(observer = %id, observers = shared.observers.len(), "registered");

        Ok(id)
    }

    /// Removes the observer with `id`. Returns `false` if it was not present.
    pub async fn unregister(&self, id: ObserverId) -> bool {
        let mut shared = self.shared.lock().await;
        let removed = shared.observers.remove(&id).is_some();
        if removed {
            debug!(observer = %id, observers = shared.observers.len(), "unregistered");
        }

        removed
    }

    /// Queues `chunk` for every registered observer and advances the
    /// watermark to its end.
    ///
    /// An observer that cannot take the chunk is removed on the spot; the
    /// others still receive it. Returns the number of observers reached.
    pub async fn broadcast(&self, chunk: Chunk) -> usize {
        let mut shared = self.shared.lock().await;
        shared.watermark = chunk.end();

        shared.observers.retain(|id, observer| {
            match observer.deliver(Frame::Data(chunk.clone())) {
                Ok(()) => true,
                Err(e) => {
                    debug!(observer = %id, error = %e, "dropping observer");
                    false
                }
            }
        });

        shared.observers.len()
    }

    /// Moves the watermark without delivering anything, after the source was
    /// truncated.
    pub async fn reset_watermark(&self, offset: u64) {
        self.shared.lock().await.watermark = offset;
    }

    pub async fn watermark(&self) -> u64 {
        self.shared.lock().await.watermark
    }

    pub async fn contains(&self, id: ObserverId) -> bool {
        self.shared.lock().await.observers.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.shared.lock().await.observers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drops every observer. Their sessions see their queues close and exit.
    pub async fn clear(&self) {
        self.shared.lock().await.observers.clear();
    }
}
