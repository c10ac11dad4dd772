//! Opaque identifiers for exposures and remote jobs.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a single instrument exposure.
///
/// The instrument reports exposures as packed integers of the form
/// `<DAYOBS><SEQNUM>`, e.g. `2021070800019` (day-obs 20210708, sequence
/// number 19). The image archiver announces the same exposure under an
/// obs-id string, e.g. `CC_O_20210708_000019`, whose last 15 characters
/// are the day-obs and a zero-padded 6-digit sequence number.
///
/// This type stores the packed integer and derives the obs-id form for
/// ingestion-event matching.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExposureId(u64);

/// Divisor that splits a packed exposure id into day-obs and sequence number.
const SEQNUM_MODULUS: u64 = 100_000;

impl ExposureId {
    /// Creates an exposure id from the instrument's packed integer form.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the packed integer form, as used in data-query predicates.
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// Returns the archiver obs-id form: `<DAYOBS>_<SEQNUM:06>`.
    pub fn obs_id(&self) -> String {
        let day_obs = self.0 / SEQNUM_MODULUS;
        let seq_num = self.0 % SEQNUM_MODULUS;
        format!("{day_obs}_{seq_num:06}")
    }

    /// Returns true if an archiver obs-id string refers to this exposure.
    ///
    /// Archiver obs-ids carry an instrument prefix (e.g. `CC_O_`), so the
    /// match is on the trailing `<DAYOBS>_<SEQNUM>` portion.
    pub fn matches_obs_id(&self, obs_id: &str) -> bool {
        obs_id.ends_with(&self.obs_id())
    }
}

impl fmt::Display for ExposureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for ExposureId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Correlation key assigned by the execution service at acknowledgment time.
///
/// Every completion event on the shared stream carries one of these; result
/// correlation is purely a filter on this value.
#[derive(Clone, Debug, Hash, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Creates a job id from the service-assigned string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string value of this job id.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns the output collection the execution service writes this
    /// job's products into.
    pub fn output_collection(&self) -> String {
        format!("u/ocps/{}", self.0)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exposure_id_obs_id_form() {
        let id = ExposureId::new(2021070800019);
        assert_eq!(id.obs_id(), "20210708_000019");
    }

    #[test]
    fn test_exposure_id_obs_id_pads_sequence_number() {
        let id = ExposureId::new(2022010100001);
        assert_eq!(id.obs_id(), "20220101_000001");
    }

    #[test]
    fn test_exposure_id_matches_archiver_obs_id() {
        let id = ExposureId::new(2021070800019);
        assert!(id.matches_obs_id("CC_O_20210708_000019"));
        assert!(id.matches_obs_id("AT_O_20210708_000019"));
        assert!(!id.matches_obs_id("CC_O_20210708_000020"));
    }

    #[test]
    fn test_exposure_id_display_is_raw() {
        let id = ExposureId::new(2021070800019);
        assert_eq!(format!("{id}"), "2021070800019");
        assert_eq!(id.raw(), 2021070800019);
    }

    #[test]
    fn test_job_id_output_collection() {
        let id = JobId::new("af3c1e9b");
        assert_eq!(id.output_collection(), "u/ocps/af3c1e9b");
    }

    #[test]
    fn test_job_id_equality() {
        assert_eq!(JobId::new("a"), JobId::from("a"));
        assert_ne!(JobId::new("a"), JobId::new("b"));
    }

    #[test]
    fn test_job_id_display() {
        assert_eq!(format!("{}", JobId::new("job-7")), "job-7");
    }
}
