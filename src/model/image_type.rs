//! Calibration image types and their associated pipeline files.

use std::fmt;
use std::str::FromStr;

/// The calibration image types the orchestrator can process.
///
/// Processing order is always BIAS, then DARK, then FLAT: darks are
/// corrected with the bias product, flats with both, so the sequence below
/// is load-bearing.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ImageType {
    /// Zero-second exposures measuring the detector readout floor.
    Bias,
    /// Shuttered exposures measuring thermal signal.
    Dark,
    /// Illuminated exposures measuring pixel response.
    Flat,
}

impl ImageType {
    /// All image types in processing order.
    pub const ALL: [ImageType; 3] = [ImageType::Bias, ImageType::Dark, ImageType::Flat];

    /// Returns the upper-case wire form used by the instrument proxy.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bias => "BIAS",
            Self::Dark => "DARK",
            Self::Flat => "FLAT",
        }
    }

    /// Returns the dataset-type name used by the certification tool.
    pub fn dataset_type(&self) -> &'static str {
        match self {
            Self::Bias => "bias",
            Self::Dark => "dark",
            Self::Flat => "flat",
        }
    }

    /// Returns the pipeline file that generates this calibration product.
    pub fn generation_pipeline_file(&self) -> &'static str {
        match self {
            Self::Bias => "cpBias.yaml",
            Self::Dark => "cpDark.yaml",
            Self::Flat => "cpFlat.yaml",
        }
    }

    /// Returns the pipeline file that verifies this calibration product.
    pub fn verification_pipeline_file(&self) -> &'static str {
        match self {
            Self::Bias => "verifyBias.yaml",
            Self::Dark => "verifyDark.yaml",
            Self::Flat => "verifyFlat.yaml",
        }
    }
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ImageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "BIAS" => Ok(Self::Bias),
            "DARK" => Ok(Self::Dark),
            "FLAT" => Ok(Self::Flat),
            other => Err(format!("unknown image type: {other}")),
        }
    }
}
