//! Pipeline submission and acknowledgment handling.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use super::{ExecutionService, SubmitError, SubmitRequest};
use crate::model::{Job, Selection};

/// Errors from dispatching a pipeline job.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The submission itself failed.
    #[error(transparent)]
    Submit(#[from] SubmitError),

    /// No in-progress acknowledgment arrived in time.
    #[error("no acknowledgment for pipeline {pipeline} within {timeout:?}")]
    AckTimeout {
        /// Pipeline path that was submitted.
        pipeline: String,
        /// How long the dispatcher waited.
        timeout: Duration,
    },

    /// The acknowledgment payload did not carry a job id.
    #[error("malformed acknowledgment for pipeline {pipeline}: {payload}")]
    MalformedAck {
        /// Pipeline path that was submitted.
        pipeline: String,
        /// The raw payload, for diagnostics.
        payload: String,
    },
}

/// A pipeline to dispatch: a root directory and a file name.
///
/// The root is the service-side pipeline directory, e.g.
/// `${CP_PIPE_DIR}/pipelines`; resolution prefers an instrument-specific
/// subdirectory when one exists.
#[derive(Clone, Copy, Debug)]
pub struct PipelineSpec<'a> {
    /// Pipeline directory on the service side.
    pub root: &'a str,
    /// Pipeline file name, e.g. `cpBias.yaml`.
    pub file: &'a str,
}

/// Submits pipelines to the execution service and waits for the
/// acknowledgment that carries the job id.
///
/// The dispatcher never waits for job completion; that is the
/// [`ResultCorrelator`](super::ResultCorrelator)'s job.
pub struct JobDispatcher<'a, S> {
    service: &'a S,
    instrument: &'a str,
}

impl<'a, S: ExecutionService> JobDispatcher<'a, S> {
    /// Creates a dispatcher for the given service and instrument.
    pub fn new(service: &'a S, instrument: &'a str) -> Self {
        Self {
            service,
            instrument,
        }
    }

    /// Resolves the pipeline path, preferring the instrument-specific
    /// location and falling back to the generic one.
    ///
    /// The choice is made once per dispatch and does not change afterwards.
    async fn resolve_pipeline(&self, spec: PipelineSpec<'_>) -> String {
        let specific = format!("{}/{}/{}", spec.root, self.instrument, spec.file);
        if self.service.pipeline_exists(&specific).await {
            specific
        } else {
            format!("{}/{}", spec.root, spec.file)
        }
    }

    /// Dispatches a pipeline run and returns the acknowledged [`Job`].
    ///
    /// Resolves the pipeline location, submits, and waits up to
    /// `ack_timeout` for exactly one in-progress acknowledgment. A
    /// malformed acknowledgment is an error; the dispatcher never guesses
    /// a job id.
    pub async fn dispatch(
        &self,
        spec: PipelineSpec<'_>,
        config_string: &str,
        selection: Selection,
        ack_timeout: Duration,
    ) -> Result<Job, DispatchError> {
        let pipeline = self.resolve_pipeline(spec).await;
        debug!(
            pipeline = %pipeline,
            instrument = %self.instrument,
            "Submitting pipeline"
        );

        let request = SubmitRequest {
            pipeline: pipeline.clone(),
            config_string: config_string.to_string(),
            data_query: selection.data_query(),
        };

        let ack = tokio::time::timeout(ack_timeout, self.service.submit(request))
            .await
            .map_err(|_| DispatchError::AckTimeout {
                pipeline: pipeline.clone(),
                timeout: ack_timeout,
            })??;

        let job_id = ack.job_id().ok_or_else(|| DispatchError::MalformedAck {
            pipeline: pipeline.clone(),
            payload: ack.result.clone(),
        })?;

        debug!(pipeline = %pipeline, job_id = %job_id, "Pipeline acknowledged");
        Ok(Job::acknowledged(pipeline, config_string, selection, job_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{CompletionEvent, EventStream, Subscription};
    use crate::exec::SubmitAck;
    use crate::model::{ExposureId, JobId};
    use std::sync::Mutex;

    struct StubService {
        /// Paths reported as existing.
        known_pipelines: Vec<String>,
        /// Ack payload to return, or None to reject.
        ack: Option<String>,
        /// Submitted requests, for assertions.
        submitted: Mutex<Vec<SubmitRequest>>,
        completions: EventStream<CompletionEvent>,
    }

    impl StubService {
        fn new(known: &[&str], ack: Option<&str>) -> Self {
            Self {
                known_pipelines: known.iter().map(|s| s.to_string()).collect(),
                ack: ack.map(|s| s.to_string()),
                submitted: Mutex::new(Vec::new()),
                completions: EventStream::new(),
            }
        }
    }

    impl ExecutionService for StubService {
        async fn submit(&self, request: SubmitRequest) -> Result<SubmitAck, SubmitError> {
            self.submitted.lock().unwrap().push(request);
            match &self.ack {
                Some(result) => Ok(SubmitAck {
                    result: result.clone(),
                }),
                None => Err(SubmitError::Rejected("no quota".to_string())),
            }
        }

        async fn pipeline_exists(&self, path: &str) -> bool {
            self.known_pipelines.iter().any(|p| p == path)
        }

        fn completion_events(&self) -> Subscription<CompletionEvent> {
            self.completions.subscribe()
        }
    }

    fn selection() -> Selection {
        Selection::new("LATISS", vec![0], vec![ExposureId::new(2021070800019)])
    }

    const SPEC: PipelineSpec<'static> = PipelineSpec {
        root: "pipelines",
        file: "cpBias.yaml",
    };

    #[tokio::test]
    async fn test_dispatch_prefers_instrument_specific_pipeline() {
        let service = StubService::new(
            &["pipelines/LATISS/cpBias.yaml"],
            Some(r#"{"job_id": "j-1"}"#),
        );
        let dispatcher = JobDispatcher::new(&service, "LATISS");

        let job = dispatcher
            .dispatch(SPEC, "-j 8", selection(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(job.pipeline(), "pipelines/LATISS/cpBias.yaml");
        assert_eq!(job.id(), &JobId::new("j-1"));
    }

    #[tokio::test]
    async fn test_dispatch_falls_back_to_generic_pipeline() {
        let service = StubService::new(&[], Some(r#"{"job_id": "j-2"}"#));
        let dispatcher = JobDispatcher::new(&service, "LATISS");

        let job = dispatcher
            .dispatch(SPEC, "-j 8", selection(), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(job.pipeline(), "pipelines/cpBias.yaml");
        let submitted = service.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].pipeline, "pipelines/cpBias.yaml");
    }

    #[tokio::test]
    async fn test_dispatch_sends_rendered_data_query() {
        let service = StubService::new(&[], Some(r#"{"job_id": "j-3"}"#));
        let dispatcher = JobDispatcher::new(&service, "LATISS");

        dispatcher
            .dispatch(SPEC, "-j 8", selection(), Duration::from_secs(1))
            .await
            .unwrap();

        let submitted = service.submitted.lock().unwrap();
        assert_eq!(
            submitted[0].data_query,
            "instrument='LATISS' AND detector IN (0) AND exposure IN (2021070800019)"
        );
        assert_eq!(submitted[0].config_string, "-j 8");
    }

    #[tokio::test]
    async fn test_dispatch_errors_on_malformed_ack() {
        let service = StubService::new(&[], Some(r#"{"status": "ok"}"#));
        let dispatcher = JobDispatcher::new(&service, "LATISS");

        let err = dispatcher
            .dispatch(SPEC, "-j 8", selection(), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::MalformedAck { .. }));
    }

    #[tokio::test]
    async fn test_dispatch_propagates_rejection() {
        let service = StubService::new(&[], None);
        let dispatcher = JobDispatcher::new(&service, "LATISS");

        let err = dispatcher
            .dispatch(SPEC, "-j 8", selection(), Duration::from_secs(1))
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Submit(SubmitError::Rejected(_))));
    }
}
