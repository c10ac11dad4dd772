//! Remote job bookkeeping.

use super::ids::JobId;
use super::selection::Selection;

/// Lifecycle state of a remote pipeline job.
///
/// A job owns exactly one external [`JobId`], assigned when the execution
/// service acknowledges the submission; all later correlation uses that id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobState {
    /// Submitted, no acknowledgment yet.
    Submitted,
    /// Acknowledged by the service; the job id is known.
    Acknowledged,
    /// A non-terminal status event has been observed.
    Running,
    /// Terminal: the service reported successful completion.
    Completed,
    /// Terminal: the service reported failure.
    Failed,
    /// Terminal: no completion event arrived within the correlation window.
    TimedOut,
}

impl JobState {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }
}

/// A dispatched pipeline job and its lifecycle.
///
/// Created by the dispatcher once the in-progress acknowledgment arrives,
/// and discarded after its terminal completion event is consumed.
#[derive(Clone, Debug)]
pub struct Job {
    pipeline: String,
    config_string: String,
    selection: Selection,
    job_id: JobId,
    state: JobState,
}

impl Job {
    /// Creates an acknowledged job carrying its service-assigned id.
    pub fn acknowledged(
        pipeline: impl Into<String>,
        config_string: impl Into<String>,
        selection: Selection,
        job_id: JobId,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            config_string: config_string.into(),
            selection,
            job_id,
            state: JobState::Acknowledged,
        }
    }

    /// Returns the resolved pipeline path this job runs.
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Returns the configuration string passed to the service.
    pub fn config_string(&self) -> &str {
        &self.config_string
    }

    /// Returns the data selection this job operates on.
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Returns the service-assigned correlation id.
    pub fn id(&self) -> &JobId {
        &self.job_id
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Marks the job as observed running.
    pub fn mark_running(&mut self) {
        self.state = JobState::Running;
    }

    /// Marks the job completed.
    pub fn mark_completed(&mut self) {
        self.state = JobState::Completed;
    }

    /// Marks the job failed.
    pub fn mark_failed(&mut self) {
        self.state = JobState::Failed;
    }

    /// Marks the job timed out waiting for its completion event.
    pub fn mark_timed_out(&mut self) {
        self.state = JobState::TimedOut;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExposureId;

    fn sample_job() -> Job {
        Job::acknowledged(
            "pipelines/cpBias.yaml",
            "-j 8",
            Selection::new("LATISS", vec![0], vec![ExposureId::new(1)]),
            JobId::new("j-1"),
        )
    }

    #[test]
    fn test_job_starts_acknowledged() {
        let job = sample_job();
        assert_eq!(*job.state(), JobState::Acknowledged);
        assert_eq!(job.id(), &JobId::new("j-1"));
        assert!(!job.state().is_terminal());
    }

    #[test]
    fn test_job_state_transitions() {
        let mut job = sample_job();
        job.mark_running();
        assert_eq!(*job.state(), JobState::Running);
        job.mark_completed();
        assert!(job.state().is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::TimedOut.is_terminal());
        assert!(!JobState::Submitted.is_terminal());
        assert!(!JobState::Acknowledged.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }
}
