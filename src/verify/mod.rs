//! Verification analysis and the certification decision.
//!
//! After a verify job completes, its summary is read back from the data
//! repository and run through a threshold-based accept/reject rule. The
//! rule deliberately tolerates scattered failures (a "soft pass with
//! warnings"): a calibration is only rejected when a majority of exposures
//! each concentrate enough failures of one test to exceed the per-exposure
//! threshold.

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{ExposureId, ImageType, JobId};
use crate::repository::{DataRepository, RepositoryError, VerificationSummary};

/// Errors from verification analysis.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// The summary read failed.
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Per-test failure limits used by the decision rule.
///
/// Each limit is the accepted number of failures of one test type on one
/// detector. Tests without an explicit entry use the default.
#[derive(Clone, Debug)]
pub struct Thresholds {
    /// Default per-detector failure limit.
    pub default_max_failures_per_detector: u32,
    /// Per-test overrides, keyed by test name.
    pub per_test: BTreeMap<String, u32>,
}

impl Thresholds {
    /// Creates thresholds with a uniform per-detector limit.
    pub fn uniform(max_failures_per_detector: u32) -> Self {
        Self {
            default_max_failures_per_detector: max_failures_per_detector,
            per_test: BTreeMap::new(),
        }
    }

    /// Returns the per-detector limit for a test name.
    pub fn limit_for(&self, test_name: &str) -> u32 {
        self.per_test
            .get(test_name)
            .copied()
            .unwrap_or(self.default_max_failures_per_detector)
    }
}

/// The threshold values a decision was reached with, for reporting.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecisionThresholds {
    /// The default per-detector, per-test failure limit.
    pub max_failures_per_detector_per_test: u32,
    /// Detectors allowed to fail: `n_detectors / 2 + 1`.
    pub max_failed_detectors: usize,
    /// Per-exposure failure threshold derived from the default limit.
    ///
    /// Tests with an overridden per-detector limit are judged against
    /// their entry in `per_test_thresholds` instead.
    pub failure_threshold_per_exposure: u32,
    /// Effective per-exposure thresholds for tests with overridden limits,
    /// keyed by test name.
    pub per_test_thresholds: BTreeMap<String, u32>,
    /// Exposures allowed to fail: `n_exposures / 2 + 1`.
    pub max_failed_exposures_allowed: usize,
}

/// Outcome of one verification pass.
///
/// Computed once per pass and never mutated; a fresh decision is computed
/// for every pass.
#[derive(Clone, Debug)]
pub struct CertificationDecision {
    /// Whether the calibration product should be certified.
    pub certify: bool,
    /// Per-exposure, per-test failure counts; `None` on a clean pass.
    pub failures: Option<BTreeMap<ExposureId, BTreeMap<String, u32>>>,
    /// Exposures that individually exceeded the per-exposure threshold.
    pub failed_exposures: Vec<ExposureId>,
    /// The thresholds the decision was reached with.
    pub thresholds: DecisionThresholds,
}

impl CertificationDecision {
    /// Returns true when the product certifies despite recorded failures.
    pub fn is_soft_pass(&self) -> bool {
        self.certify && self.failures.is_some()
    }
}

/// Applies the decision rule to a verification summary.
///
/// The rule, reproduced exactly:
/// 1. `max_failed_detectors = n_detectors / 2 + 1`
/// 2. a test's per-exposure threshold is its per-detector limit times
///    `max_failed_detectors`
/// 3. `max_failed_exposures_allowed = n_exposures / 2 + 1`
/// 4. an exposure fails iff any single test name reaches its per-exposure
///    threshold within that exposure
/// 5. do not certify iff the failed-exposure count reaches
///    `max_failed_exposures_allowed`
///
/// Deterministic and idempotent for fixed inputs.
pub fn decide(
    summary: &VerificationSummary,
    thresholds: &Thresholds,
    n_detectors: usize,
) -> CertificationDecision {
    let n_exposures = summary.exposures.len();
    let max_failed_detectors = n_detectors / 2 + 1;
    let max_failed_exposures_allowed = n_exposures / 2 + 1;
    let decision_thresholds = DecisionThresholds {
        max_failures_per_detector_per_test: thresholds.default_max_failures_per_detector,
        max_failed_detectors,
        failure_threshold_per_exposure: thresholds.default_max_failures_per_detector
            * max_failed_detectors as u32,
        per_test_thresholds: thresholds
            .per_test
            .iter()
            .map(|(name, limit)| (name.clone(), limit * max_failed_detectors as u32))
            .collect(),
        max_failed_exposures_allowed,
    };

    if summary.success {
        return CertificationDecision {
            certify: true,
            failures: None,
            failed_exposures: Vec::new(),
            thresholds: decision_thresholds,
        };
    }

    // Tally failures per exposure per test name.
    let mut tally: BTreeMap<ExposureId, BTreeMap<String, u32>> = BTreeMap::new();
    for (&exposure, entry) in &summary.exposures {
        if entry.success {
            continue;
        }
        let counts = tally.entry(exposure).or_default();
        for record in &entry.failures {
            *counts.entry(record.test_name.clone()).or_insert(0) += 1;
        }
    }

    let mut failed_exposures = Vec::new();
    for (&exposure, counts) in &tally {
        let over_threshold = counts.iter().any(|(test_name, &count)| {
            let threshold = thresholds.limit_for(test_name) * max_failed_detectors as u32;
            count >= threshold
        });
        if over_threshold {
            failed_exposures.push(exposure);
        }
    }

    let certify = failed_exposures.len() < max_failed_exposures_allowed;
    CertificationDecision {
        certify,
        failures: Some(tally),
        failed_exposures,
        thresholds: decision_thresholds,
    }
}

/// Reads verification output and decides whether to certify.
pub struct VerificationAnalyzer<'a, R> {
    repository: &'a R,
    thresholds: &'a Thresholds,
    n_detectors: usize,
}

impl<'a, R: DataRepository> VerificationAnalyzer<'a, R> {
    /// Creates an analyzer over the repository and decision thresholds.
    pub fn new(repository: &'a R, thresholds: &'a Thresholds, n_detectors: usize) -> Self {
        Self {
            repository,
            thresholds,
            n_detectors,
        }
    }

    /// Reads the verify job's summary and applies the decision rule.
    ///
    /// The summary is read from the verify job's output collection, plus
    /// the generation job's collection when one exists. A clean overall
    /// flag short-circuits to certify with no failure tally.
    pub async fn check_verification(
        &self,
        image_type: ImageType,
        instrument: &str,
        verify_job_id: &JobId,
        generation_job_id: Option<&JobId>,
    ) -> Result<CertificationDecision, VerifyError> {
        let mut collections = vec![verify_job_id.output_collection()];
        if let Some(gen_id) = generation_job_id {
            collections.push(gen_id.output_collection());
        }

        let summary = self
            .repository
            .verification_summary(instrument, &collections)
            .await?;
        debug!(
            image_type = %image_type,
            verify_job = %verify_job_id,
            exposures = summary.exposures.len(),
            overall_success = summary.success,
            "Verification summary read"
        );

        let decision = decide(&summary, self.thresholds, self.n_detectors);
        if decision.certify && decision.failures.is_none() {
            info!(image_type = %image_type, verify_job = %verify_job_id, "Verification clean");
        } else if decision.certify {
            warn!(
                image_type = %image_type,
                verify_job = %verify_job_id,
                failed_exposures = ?decision.failed_exposures,
                "Verification passed with warnings"
            );
        } else {
            warn!(
                image_type = %image_type,
                verify_job = %verify_job_id,
                failed_exposures = ?decision.failed_exposures,
                max_allowed = decision.thresholds.max_failed_exposures_allowed,
                "Verification rejected"
            );
        }
        Ok(decision)
    }
}
