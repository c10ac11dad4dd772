//! Calibration certification.
//!
//! Certifying publishes a generated product into a long-lived calibration
//! collection over a validity time range, by invoking an external
//! repository tool. The tool gives no idempotency guarantee: repeated
//! calls may create overlapping validity ranges, and that is left to the
//! tool's operators, not handled here.

use std::future::Future;
use std::path::PathBuf;
use std::process::Output;

use chrono::NaiveDate;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Errors from the certification step.
#[derive(Debug, Error)]
pub enum CertifyError {
    /// The tool could not be spawned.
    #[error("failed to run certification tool: {0}")]
    Io(#[from] std::io::Error),

    /// The tool ran and exited non-zero.
    #[error("certification tool failed (status {status:?}): {stderr}")]
    ToolFailed {
        /// Exit status code, when one exists.
        status: Option<i32>,
        /// Captured standard output.
        stdout: String,
        /// Captured standard error.
        stderr: String,
    },
}

/// One certification request.
#[derive(Clone, Debug)]
pub struct CertifyRequest {
    /// Repository the collections live in.
    pub repo: String,
    /// Source collection (the generation job's output).
    pub source_collection: String,
    /// Long-lived calibration collection to publish into.
    pub dest_collection: String,
    /// Start of the validity range.
    pub begin_date: NaiveDate,
    /// End of the validity range.
    pub end_date: NaiveDate,
    /// Dataset type being certified, e.g. `bias` or `defects`.
    pub dataset_type: String,
}

/// External certification operation.
pub trait CertifyTool: Send + Sync + 'static {
    /// Certifies the product; any failure exit is an error carrying the
    /// tool's captured diagnostic output.
    fn certify(
        &self,
        request: &CertifyRequest,
    ) -> impl Future<Output = Result<(), CertifyError>> + Send;
}

/// Certifier driving the repository's `certify-calibrations` command.
#[derive(Clone, Debug)]
pub struct ButlerCertifier {
    program: PathBuf,
}

impl ButlerCertifier {
    /// Creates a certifier invoking the `butler` binary on `PATH`.
    pub fn new() -> Self {
        Self::with_program("butler")
    }

    /// Creates a certifier invoking an explicit binary.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for ButlerCertifier {
    fn default() -> Self {
        Self::new()
    }
}

/// Renders the tool's argument vector for a request.
fn command_args(request: &CertifyRequest) -> Vec<String> {
    vec![
        "certify-calibrations".to_string(),
        request.repo.clone(),
        request.source_collection.clone(),
        request.dest_collection.clone(),
        "--begin-date".to_string(),
        request.begin_date.to_string(),
        "--end-date".to_string(),
        request.end_date.to_string(),
        request.dataset_type.clone(),
    ]
}

impl CertifyTool for ButlerCertifier {
    async fn certify(&self, request: &CertifyRequest) -> Result<(), CertifyError> {
        let args = command_args(request);
        info!(
            dataset_type = %request.dataset_type,
            source = %request.source_collection,
            dest = %request.dest_collection,
            "Certifying calibration"
        );
        debug!(program = ?self.program, args = ?args, "Running certification tool");

        let Output {
            status,
            stdout,
            stderr,
        } = Command::new(&self.program).args(&args).output().await?;

        if !status.success() {
            return Err(CertifyError::ToolFailed {
                status: status.code(),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            });
        }
        Ok(())
    }
}
