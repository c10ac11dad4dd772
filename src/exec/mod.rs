//! Execution-service boundary.
//!
//! The execution service runs named pipelines remotely. Submissions are
//! acknowledged with a JSON payload carrying the assigned job id, and every
//! finished job publishes a completion event onto one shared stream.
//!
//! This module keeps the service's wire formats at the boundary: payloads
//! are parsed into typed values here and nothing downstream touches raw
//! JSON.

mod correlator;
mod dispatcher;

pub use correlator::{CorrelationError, ResultCorrelator};
pub use dispatcher::{DispatchError, JobDispatcher, PipelineSpec};

use std::future::Future;

use serde::Deserialize;
use thiserror::Error;

use crate::bus::{CompletionEvent, Subscription};
use crate::model::JobId;

/// A pipeline submission request, in the service's wire terms.
///
/// The data selection is carried as the rendered query predicate; the
/// typed [`Selection`](crate::model::Selection) it was rendered from stays
/// on the dispatched [`Job`](crate::model::Job).
#[derive(Clone, Debug)]
pub struct SubmitRequest {
    /// Resolved pipeline path.
    pub pipeline: String,
    /// Configuration string passed through to the pipeline run.
    pub config_string: String,
    /// Rendered data-query predicate selecting what the pipeline runs on.
    pub data_query: String,
}

/// The in-progress acknowledgment returned for a submission.
///
/// Carries the service's raw JSON result; [`SubmitAck::job_id`] extracts
/// the assigned id.
#[derive(Clone, Debug)]
pub struct SubmitAck {
    /// Raw acknowledgment payload, e.g. `{"job_id": "af3c1e9b"}`.
    pub result: String,
}

#[derive(Deserialize)]
struct AckPayload {
    job_id: String,
}

impl SubmitAck {
    /// Extracts the job id from the acknowledgment payload.
    ///
    /// Returns `None` when the payload is not the expected JSON shape; the
    /// dispatcher turns that into a hard error rather than guessing.
    pub fn job_id(&self) -> Option<JobId> {
        serde_json::from_str::<AckPayload>(&self.result)
            .ok()
            .map(|ack| JobId::new(ack.job_id))
    }
}

/// Errors from pipeline submission.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The service rejected the submission.
    #[error("submission rejected: {0}")]
    Rejected(String),

    /// The service is unreachable.
    #[error("execution service unavailable: {0}")]
    Unavailable(String),
}

/// Terminal phase reported in a completion event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobPhase {
    /// The job finished successfully.
    Completed,
    /// The job ran and failed.
    Failed,
    /// Any other service-reported phase (held verbatim for diagnostics).
    Other(String),
}

impl JobPhase {
    fn from_wire(phase: &str) -> Self {
        match phase {
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns true if the job finished successfully.
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

#[derive(Deserialize)]
struct OutcomePayload {
    #[serde(rename = "jobId")]
    _job_id: Option<String>,
    phase: String,
}

/// Parsed result of a finished job.
#[derive(Clone, Debug)]
pub struct JobOutcome {
    /// Correlation key of the finished job.
    pub job_id: JobId,
    /// Terminal phase the service reported.
    pub phase: JobPhase,
    /// Full result payload, for logging and diagnostics.
    pub raw: serde_json::Value,
}

impl JobOutcome {
    /// Parses a completion event's payload into a typed outcome.
    pub fn from_event(event: &CompletionEvent) -> Result<Self, serde_json::Error> {
        let parsed: OutcomePayload = serde_json::from_str(&event.payload)?;
        let raw = serde_json::from_str(&event.payload)?;
        Ok(Self {
            job_id: event.job_id.clone(),
            phase: JobPhase::from_wire(&parsed.phase),
            raw,
        })
    }
}

/// Remote pipeline-execution service.
///
/// Implementations wrap the observatory's pipeline-execution remote. The
/// completion stream is shared by every job the service runs, including
/// jobs dispatched by unrelated components.
pub trait ExecutionService: Send + Sync + 'static {
    /// Submits a pipeline run and resolves with the in-progress
    /// acknowledgment that carries the job id.
    ///
    /// Does not wait for the job to finish.
    fn submit(
        &self,
        request: SubmitRequest,
    ) -> impl Future<Output = Result<SubmitAck, SubmitError>> + Send;

    /// Returns whether a pipeline file exists at the given path.
    fn pipeline_exists(&self, path: &str) -> impl Future<Output = bool> + Send;

    /// Opens a subscription on the shared completion-event stream.
    fn completion_events(&self) -> Subscription<CompletionEvent>;
}
