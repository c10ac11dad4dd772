//! Completion-event correlation.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, trace};

use super::JobOutcome;
use crate::bus::{CompletionEvent, StreamError, Subscription};
use crate::model::JobId;

/// Errors from awaiting a job's completion event.
#[derive(Debug, Error)]
pub enum CorrelationError {
    /// No matching completion event arrived within the wait.
    #[error("no completion event for job {job_id} within {timeout:?}")]
    TimedOut {
        /// The job that was awaited.
        job_id: JobId,
        /// How long the correlator waited.
        timeout: Duration,
    },

    /// The completion stream's publisher went away mid-wait.
    #[error("completion stream closed while awaiting job {job_id}")]
    StreamClosed {
        /// The job that was awaited.
        job_id: JobId,
    },

    /// A matching event arrived but its payload could not be parsed.
    #[error("malformed completion payload for job {job_id}: {source}")]
    MalformedPayload {
        /// The job the event belonged to.
        job_id: JobId,
        /// Parse failure detail.
        #[source]
        source: serde_json::Error,
    },
}

/// Matches completion events on the shared stream to a dispatched job id.
///
/// Every correlator owns its own subscription, so concurrent correlators
/// never steal each other's events: unrelated events are simply read and
/// discarded. Dropping the correlator (timeout included) releases the
/// subscription without leaking a listener.
pub struct ResultCorrelator {
    subscription: Subscription<CompletionEvent>,
}

impl ResultCorrelator {
    /// Creates a correlator over a fresh completion-stream subscription.
    ///
    /// Subscribe *before* dispatching the job being awaited, otherwise a
    /// fast completion can be missed.
    pub fn new(subscription: Subscription<CompletionEvent>) -> Self {
        Self { subscription }
    }

    /// Waits for the completion event of `job_id`, up to `timeout`.
    ///
    /// Events for other jobs are discarded without error, whatever their
    /// origin; delivery order across concurrent jobs is irrelevant.
    pub async fn await_result(
        &mut self,
        job_id: &JobId,
        timeout: Duration,
    ) -> Result<JobOutcome, CorrelationError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(CorrelationError::TimedOut {
                    job_id: job_id.clone(),
                    timeout,
                });
            }

            let event = match self.subscription.next(remaining).await {
                Ok(event) => event,
                Err(StreamError::TimedOut(_)) => {
                    return Err(CorrelationError::TimedOut {
                        job_id: job_id.clone(),
                        timeout,
                    });
                }
                Err(StreamError::Closed) => {
                    return Err(CorrelationError::StreamClosed {
                        job_id: job_id.clone(),
                    });
                }
            };

            if &event.job_id != job_id {
                trace!(
                    wanted = %job_id,
                    got = %event.job_id,
                    "Discarding completion event for unrelated job"
                );
                continue;
            }

            let outcome = JobOutcome::from_event(&event).map_err(|source| {
                CorrelationError::MalformedPayload {
                    job_id: job_id.clone(),
                    source,
                }
            })?;
            debug!(job_id = %job_id, phase = %outcome.phase, "Job completion correlated");
            return Ok(outcome);
        }
    }
}
