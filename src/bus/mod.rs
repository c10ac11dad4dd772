//! Event streams shared between the orchestrator and external services.
//!
//! Two streams matter here: ingestion events announcing that a captured
//! exposure has landed in the image repository, and completion events
//! published by the execution service for every finished job.
//!
//! Both are broadcast fan-in: every subscriber gets its own copy of every
//! event, so no component can steal an event another component is waiting
//! for. Matching is purely filter-based on the subscriber side.

use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::JobId;

/// Default capacity for event channels.
///
/// A full calibration run produces at most a few hundred ingestion events
/// per batch (exposures × detectors) and a handful of completion events, so
/// this leaves ample slack before a slow subscriber lags.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Notification that a captured exposure became available in the repository.
///
/// One event arrives per exposure per detector. The obs-id carries an
/// instrument prefix, e.g. `CC_O_20210708_000019`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngestionEvent {
    /// Archiver obs-id of the ingested image.
    pub obs_id: String,
}

/// Completion event for a remote pipeline job.
///
/// The payload is the service's raw JSON result; the job id is lifted out
/// at the service boundary so correlation never re-parses payloads it is
/// about to discard.
#[derive(Clone, Debug)]
pub struct CompletionEvent {
    /// Correlation key of the finished job.
    pub job_id: JobId,
    /// Raw JSON result payload from the execution service.
    pub payload: String,
}

/// Errors from waiting on an event subscription.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StreamError {
    /// No event arrived within the allowed wait.
    #[error("no event within {0:?}")]
    TimedOut(Duration),

    /// The stream's publisher side has gone away.
    #[error("event stream closed")]
    Closed,
}

/// Publisher side of a broadcast event stream.
///
/// Cheap to clone; all clones publish into the same stream.
#[derive(Clone, Debug)]
pub struct EventStream<T> {
    tx: broadcast::Sender<T>,
}

impl<T: Clone> EventStream<T> {
    /// Creates a stream with the default channel capacity.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a stream with an explicit channel capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all current subscribers.
    ///
    /// Publishing with no subscribers is not an error; the event is simply
    /// dropped, matching the fan-in semantics of the real event bus.
    pub fn publish(&self, event: T) {
        let _ = self.tx.send(event);
    }

    /// Opens a new subscription that sees events published from now on.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            rx: self.tx.subscribe(),
        }
    }
}

impl<T: Clone> Default for EventStream<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A single subscriber's view of an event stream.
///
/// Dropping the subscription releases it; a correlation timeout therefore
/// never leaks a listener.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Discards every event already buffered for this subscriber.
    ///
    /// Used to clear stale events from a previous batch before issuing new
    /// requests.
    pub fn flush(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }

    /// Waits for the next event, up to `timeout`.
    ///
    /// A lagged subscriber skips the overwritten events and keeps reading;
    /// the orchestrator sizes channels so this does not happen in practice.
    pub async fn next(&mut self, timeout: Duration) -> Result<T, StreamError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(StreamError::TimedOut(timeout));
            }
            match tokio::time::timeout(remaining, self.rx.recv()).await {
                Ok(Ok(event)) => return Ok(event),
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) => return Err(StreamError::Closed),
                Err(_) => return Err(StreamError::TimedOut(timeout)),
            }
        }
    }
}
