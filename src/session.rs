//! Per-connection task that moves frames from an observer's queue to the
//! consumer's sink and keeps the connection proven alive.

use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use futures_util::sink::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Chunk, DeliveryError, ObserverId, Registry};

/// A message for one consumer.
///
/// The transport decides the wire form, e.g. a text message for `Data` and a
/// ping for `Keepalive`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Data(Chunk),
    Keepalive,
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    /// Content could not be delivered, either by the sink or because the
    /// registry evicted the observer.
    Delivery,
    /// A keepalive could not be delivered.
    Keepalive,
    /// The consumer side cancelled the session.
    Cancelled,
    /// The engine is shutting down.
    Shutdown,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Active,
    Closed,
}

pub(crate) struct Session<S> {
    id: ObserverId,
    frames: mpsc::Receiver<Frame>,
    sink: Pin<Box<S>>,
    registry: Registry,
    cancel: CancellationToken,
    shutdown: CancellationToken,
    keepalive_interval: Duration,
    send_timeout: Duration,
}

impl<S> Session<S>
where
    S: Sink<Frame> + Send + 'static,
    S::Error: fmt::Display,
{
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ObserverId,
        frames: mpsc::Receiver<Frame>,
        sink: S,
        registry: Registry,
        cancel: CancellationToken,
        shutdown: CancellationToken,
        keepalive_interval: Duration,
        send_timeout: Duration,
    ) -> Self {
        Session {
            id,
            frames,
            sink: Box::pin(sink),
            registry,
            cancel,
            shutdown,
            keepalive_interval,
            send_timeout,
        }
    }

    /// Drives the session until it closes, then removes it from the registry.
    pub(crate) async fn run(mut self) -> CloseReason {
        let period = self.keepalive_interval.max(Duration::from_millis(1));
        let mut keepalive = time::interval_at(Instant::now() + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => break CloseReason::Shutdown,
                _ = self.cancel.cancelled() => break CloseReason::Cancelled,
                frame = self.frames.recv() => match frame {
                    Some(frame) => match self.send(frame).await {
                        Ok(()) => {}
                        Err(Interrupt::Closed(reason)) => break reason,
                        Err(Interrupt::Failed(e)) => {
                            debug!(observer = %self.id, error = %e, "delivery failed");
                            break CloseReason::Delivery;
                        }
                    },
                    // Evicted by the registry.
                    None => break CloseReason::Delivery,
                },
                _ = keepalive.tick() => match self.send(Frame::Keepalive).await {
                    Ok(()) => {}
                    Err(Interrupt::Closed(reason)) => break reason,
                    Err(Interrupt::Failed(e)) => {
                        debug!(observer = %self.id, error = %e, "keepalive failed");
                        break CloseReason::Keepalive;
                    }
                },
            }
        };

        self.registry.unregister(self.id).await;
        let _ = time::timeout(self.send_timeout, self.sink.close()).await;
        debug!(observer = %self.id, reason = ?reason, "session closed");

        reason
    }

    /// Sends one frame, giving up early if the session is cancelled or the
    /// engine shuts down while the sink is still busy.
    async fn send(&mut self, frame: Frame) -> Result<(), Interrupt> {
        tokio::select! {
            biased;

            _ = self.shutdown.cancelled() => Err(Interrupt::Closed(CloseReason::Shutdown)),
            _ = self.cancel.cancelled() => Err(Interrupt::Closed(CloseReason::Cancelled)),
            res = time::timeout(self.send_timeout, self.sink.send(frame)) => match res {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(Interrupt::Failed(DeliveryError::Sink(e.to_string()))),
                Err(_) => Err(Interrupt::Failed(DeliveryError::Timeout)),
            },
        }
    }
}

/// Why a send did not complete.
#[derive(Debug)]
enum Interrupt {
    Closed(CloseReason),
    Failed(DeliveryError),
}

/// Owner's handle to a running observer session.
///
/// Dropping the handle leaves the session running; it still ends on delivery
/// failure or shutdown.
#[derive(Debug)]
pub struct SessionHandle {
    id: ObserverId,
    cancel: CancellationToken,
    task: JoinHandle<CloseReason>,
}

impl SessionHandle {
    pub(crate) fn new(id: ObserverId, cancel: CancellationToken, task: JoinHandle<CloseReason>) -> Self {
        SessionHandle { id, cancel, task }
    }

    pub fn id(&self) -> ObserverId {
        self.id
    }

    /// Signals that the consumer disconnected.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Token that closes this session when cancelled, for handing to the task
    /// reading the consumer side of the connection.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> SessionState {
        if self.task.is_finished() {
            SessionState::Closed
        } else {
            SessionState::Active
        }
    }

    /// Waits for the session to end.
    pub async fn join(self) -> CloseReason {
        // A panicked or aborted task is reported as torn down with the runtime.
        self.task.await.unwrap_or(CloseReason::Shutdown)
    }
}
