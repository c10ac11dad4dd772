//! Data-selection predicates for execution-service submissions.

use super::ids::ExposureId;

/// The data a submitted pipeline operates on: an instrument, a detector set
/// and an exposure set.
///
/// Rendered as a data-query predicate string at the execution-service
/// boundary; internally the parts stay typed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    instrument: String,
    detectors: Vec<u32>,
    exposures: Vec<ExposureId>,
}

impl Selection {
    /// Creates a selection over the given detectors and exposures.
    pub fn new(
        instrument: impl Into<String>,
        detectors: Vec<u32>,
        exposures: Vec<ExposureId>,
    ) -> Self {
        Self {
            instrument: instrument.into(),
            detectors,
            exposures,
        }
    }

    /// Returns the instrument name.
    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    /// Returns the detector ids in this selection.
    pub fn detectors(&self) -> &[u32] {
        &self.detectors
    }

    /// Returns the exposures in this selection.
    pub fn exposures(&self) -> &[ExposureId] {
        &self.exposures
    }

    /// Renders the data-query predicate the execution service consumes.
    ///
    /// Example: `instrument='LSSTComCam' AND detector IN (0, 1) AND
    /// exposure IN (2021070800019, 2021070800020)`.
    pub fn data_query(&self) -> String {
        let detectors = self
            .detectors
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let exposures = self
            .exposures
            .iter()
            .map(|e| e.raw().to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "instrument='{}' AND detector IN ({detectors}) AND exposure IN ({exposures})",
            self.instrument
        )
    }
}
