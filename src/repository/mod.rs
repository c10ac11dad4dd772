//! Data-repository seam and typed verification summaries.
//!
//! The repository stores pipeline outputs under named collections. The
//! orchestrator only reads one thing from it: the verification summary a
//! verify job wrote for an instrument. Summaries arrive as JSON whose
//! failure entries are space-separated description strings
//! (`"R22_S21 C17 NOISE"`); that wire form is parsed into typed records
//! here and nowhere else.

use std::collections::BTreeMap;
use std::future::Future;

use serde::Deserialize;
use thiserror::Error;

use crate::model::ExposureId;

/// Errors from repository reads.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// No summary exists under the given collections.
    #[error("no verification summary in collections {collections:?}")]
    NotFound {
        /// The collections that were searched.
        collections: Vec<String>,
    },

    /// The stored summary could not be parsed.
    #[error("malformed verification summary: {0}")]
    Malformed(String),

    /// The repository is unreachable.
    #[error("data repository unavailable: {0}")]
    Unavailable(String),
}

/// One test failure on one detector amplifier.
///
/// The wire form is a space-separated description; the typed form is
/// canonical everywhere past this boundary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FailureRecord {
    /// Detector name, e.g. `R22_S21`.
    pub detector: String,
    /// Amplifier name, e.g. `C17`.
    pub amplifier: String,
    /// Name of the failed test, e.g. `NOISE`.
    pub test_name: String,
}

impl FailureRecord {
    /// Parses the wire form `"<detector> <amplifier> ... <test>"`.
    ///
    /// The test name is the last token; anything with fewer than three
    /// tokens is not a valid failure description.
    pub fn from_wire(description: &str) -> Option<Self> {
        let tokens: Vec<&str> = description.split_whitespace().collect();
        if tokens.len() < 3 {
            return None;
        }
        Some(Self {
            detector: tokens[0].to_string(),
            amplifier: tokens[1].to_string(),
            test_name: tokens[tokens.len() - 1].to_string(),
        })
    }
}

/// Verification results for one exposure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExposureVerification {
    /// True when every test on this exposure passed.
    pub success: bool,
    /// Failure records, empty when `success` is true.
    pub failures: Vec<FailureRecord>,
}

/// Verification summary for a verify job's output collection.
///
/// Entries exist only for exposures actually included in the verify job's
/// data selection.
#[derive(Clone, Debug, Default)]
pub struct VerificationSummary {
    /// Overall flag: true when every exposure passed every test.
    pub success: bool,
    /// Per-exposure results, keyed by exposure id.
    pub exposures: BTreeMap<ExposureId, ExposureVerification>,
}

#[derive(Deserialize)]
struct WireExposure {
    success: bool,
    #[serde(default)]
    failures: Vec<String>,
}

#[derive(Deserialize)]
struct WireSummary {
    success: bool,
    #[serde(default)]
    exposures: BTreeMap<String, WireExposure>,
}

impl VerificationSummary {
    /// Parses the repository's JSON wire form.
    ///
    /// Failure descriptions that do not parse are rejected: a summary with
    /// unreadable failures cannot support a certification decision.
    pub fn from_json(payload: &str) -> Result<Self, RepositoryError> {
        let wire: WireSummary = serde_json::from_str(payload)
            .map_err(|e| RepositoryError::Malformed(e.to_string()))?;

        let mut exposures = BTreeMap::new();
        for (raw_id, entry) in wire.exposures {
            let id: u64 = raw_id.parse().map_err(|_| {
                RepositoryError::Malformed(format!("bad exposure id: {raw_id}"))
            })?;
            let mut failures = Vec::with_capacity(entry.failures.len());
            for description in &entry.failures {
                let record = FailureRecord::from_wire(description).ok_or_else(|| {
                    RepositoryError::Malformed(format!(
                        "bad failure description: {description:?}"
                    ))
                })?;
                failures.push(record);
            }
            exposures.insert(
                ExposureId::new(id),
                ExposureVerification {
                    success: entry.success,
                    failures,
                },
            );
        }

        Ok(Self {
            success: wire.success,
            exposures,
        })
    }
}

/// Read access to the data repository, scoped by collection and instrument.
pub trait DataRepository: Send + Sync + 'static {
    /// Reads the verification summary for `instrument` from the given
    /// collections (the verify job's output collection, plus the
    /// generation job's when one exists).
    fn verification_summary(
        &self,
        instrument: &str,
        collections: &[String],
    ) -> impl Future<Output = Result<VerificationSummary, RepositoryError>> + Send;
}
