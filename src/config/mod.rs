//! Run configuration.
//!
//! The orchestrator is configuration-driven: counts and exposure times per
//! image type, collection names, thresholds and timeouts all come from one
//! YAML document. The document is parsed into typed structs, unknown
//! fields are rejected at the parse boundary, and the whole configuration
//! is validated once at load time rather than at point of use.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;
use thiserror::Error;

use crate::logging::LogSettings;
use crate::model::{ImageType, JobId};
use crate::verify::Thresholds;

/// Errors from loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path that was read.
        path: String,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },

    /// The YAML did not match the schema (unknown fields included).
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// The parsed config is internally inconsistent.
    #[error("invalid config: {field}: {reason}")]
    Invalid {
        /// The offending field.
        field: String,
        /// Why it is rejected.
        reason: String,
    },
}

fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Which image types a run processes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptMode {
    /// BIAS only.
    Bias,
    /// BIAS then DARK.
    BiasDark,
    /// BIAS, DARK, then FLAT.
    #[default]
    BiasDarkFlat,
}

impl ScriptMode {
    /// Returns the image types this mode processes, in order.
    pub fn image_types(&self) -> &'static [ImageType] {
        match self {
            Self::Bias => &[ImageType::Bias],
            Self::BiasDark => &[ImageType::Bias, ImageType::Dark],
            Self::BiasDarkFlat => &[ImageType::Bias, ImageType::Dark, ImageType::Flat],
        }
    }
}

/// Exposure times: a scalar broadcast over the image count, or one value
/// per image.
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
pub enum ExpTimes {
    /// Same duration for every exposure.
    Scalar(f64),
    /// One duration per exposure.
    List(Vec<f64>),
}

impl Default for ExpTimes {
    fn default() -> Self {
        Self::Scalar(0.0)
    }
}

fn default_true() -> bool {
    true
}

/// Per-image-type settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageTypeSettings {
    /// Number of exposures to take.
    pub n_images: usize,

    /// Exposure time(s), seconds.
    #[serde(default)]
    pub exp_times: ExpTimes,

    /// Leading exposures to discard (hardware settling).
    #[serde(default)]
    pub n_discard: usize,

    /// Comma-separated input collections for the generation pipeline.
    pub input_collections: String,

    /// Comma-separated input collections for the verification pipeline.
    pub verify_input_collections: String,

    /// Extra options appended to the generation pipeline config string.
    #[serde(default)]
    pub config_options: String,

    /// Extra options appended to the verification pipeline config string.
    #[serde(default)]
    pub verify_config_options: String,

    /// Whether to run verification before certification.
    #[serde(default = "default_true")]
    pub do_verify: bool,
}

impl ImageTypeSettings {
    /// Returns the resolved exposure-time list (scalar broadcast).
    ///
    /// Call after validation; a mismatched list never survives
    /// [`RunConfig::validate`].
    pub fn exposure_times(&self) -> Vec<f64> {
        match &self.exp_times {
            ExpTimes::Scalar(t) => vec![*t; self.n_images],
            ExpTimes::List(times) => times.clone(),
        }
    }

    fn validate(&self, section: &str) -> Result<(), ConfigError> {
        if self.n_images == 0 {
            return Err(invalid(
                &format!("{section}.n_images"),
                "must be at least 1",
            ));
        }
        if self.n_discard >= self.n_images {
            return Err(invalid(
                &format!("{section}.n_discard"),
                format!(
                    "discard count {} leaves no usable exposures out of {}",
                    self.n_discard, self.n_images
                ),
            ));
        }
        if let ExpTimes::List(times) = &self.exp_times {
            if times.len() != self.n_images {
                return Err(invalid(
                    &format!("{section}.exp_times"),
                    format!(
                        "{} exposure times given for {} images",
                        times.len(),
                        self.n_images
                    ),
                ));
            }
        }
        Ok(())
    }
}

fn default_max_failures() -> u32 {
    8
}

/// Verification decision thresholds.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdSettings {
    /// Default accepted failures per detector per test type.
    #[serde(default = "default_max_failures")]
    pub max_failures_per_detector_per_test: u32,

    /// Per-test overrides, keyed by test name.
    #[serde(default)]
    pub per_test: BTreeMap<String, u32>,
}

impl Default for ThresholdSettings {
    fn default() -> Self {
        Self {
            max_failures_per_detector_per_test: default_max_failures(),
            per_test: BTreeMap::new(),
        }
    }
}

fn default_n_processes() -> u32 {
    8
}

fn default_generation_pipeline_root() -> String {
    "${CP_PIPE_DIR}/pipelines".to_string()
}

fn default_verification_pipeline_root() -> String {
    "${CP_VERIFY_DIR}/pipelines".to_string()
}

fn default_begin_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1950, 1, 1).unwrap_or_default()
}

fn default_end_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2050, 1, 1).unwrap_or_default()
}

fn default_ingest_timeout_secs() -> u64 {
    600
}

fn default_background_task_timeout_secs() -> u64 {
    300
}

fn default_ack_timeout_secs() -> u64 {
    30
}

/// Complete configuration for one calibration run.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    /// Instrument name, as known to the pipelines.
    pub instrument: String,

    /// Repository the pipelines and certification operate on.
    pub repo: String,

    /// Detector ids to process.
    pub detectors: Vec<u32>,

    /// Which image types to run.
    #[serde(default)]
    pub script_mode: ScriptMode,

    /// Processes per pipeline run.
    #[serde(default = "default_n_processes")]
    pub n_processes: u32,

    /// Service-side directory of generation pipelines.
    #[serde(default = "default_generation_pipeline_root")]
    pub generation_pipeline_root: String,

    /// Service-side directory of verification pipelines.
    #[serde(default = "default_verification_pipeline_root")]
    pub verification_pipeline_root: String,

    /// Calibration collection certified products are published into.
    pub calib_collection: String,

    /// Start of the certification validity range.
    #[serde(default = "default_begin_date")]
    pub certify_begin_date: NaiveDate,

    /// End of the certification validity range.
    #[serde(default = "default_end_date")]
    pub certify_end_date: NaiveDate,

    /// Overall wait for a batch's ingestion events, seconds.
    #[serde(default = "default_ingest_timeout_secs")]
    pub ingest_timeout_secs: u64,

    /// Wait for a submission acknowledgment, seconds.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,

    /// Per-task budget for post-processing and extra-product tasks,
    /// seconds. The aggregate wait is this times the task count.
    #[serde(default = "default_background_task_timeout_secs")]
    pub background_task_timeout_secs: u64,

    /// BIAS settings (always required).
    pub bias: ImageTypeSettings,

    /// DARK settings (required for bias_dark and bias_dark_flat modes).
    #[serde(default)]
    pub dark: Option<ImageTypeSettings>,

    /// FLAT settings (required for bias_dark_flat mode).
    #[serde(default)]
    pub flat: Option<ImageTypeSettings>,

    /// Generate a defects product after the basic types.
    #[serde(default)]
    pub do_defects: bool,

    /// Generate a photon-transfer-curve product after the basic types.
    #[serde(default)]
    pub do_ptc: bool,

    /// Measure gain from flat pairs after the basic types.
    #[serde(default)]
    pub do_gain_from_flat_pairs: bool,

    /// Verification decision thresholds.
    #[serde(default)]
    pub thresholds: ThresholdSettings,

    /// Log output settings.
    #[serde(default)]
    pub log: LogSettings,
}

impl RunConfig {
    /// Parses and validates a YAML config document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a YAML config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&yaml)
    }

    /// Validates cross-field consistency.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.detectors.is_empty() {
            return Err(invalid("detectors", "at least one detector is required"));
        }
        if self.certify_begin_date >= self.certify_end_date {
            return Err(invalid(
                "certify_begin_date",
                format!(
                    "validity range is empty: {} >= {}",
                    self.certify_begin_date, self.certify_end_date
                ),
            ));
        }

        for image_type in self.script_mode.image_types() {
            match self.settings_for(*image_type) {
                Some(settings) => settings.validate(image_type.dataset_type())?,
                None => {
                    return Err(invalid(
                        image_type.dataset_type(),
                        format!("required for script mode {:?}", self.script_mode),
                    ));
                }
            }
        }

        let needs_flat = self.do_defects || self.do_ptc || self.do_gain_from_flat_pairs;
        if needs_flat && self.script_mode != ScriptMode::BiasDarkFlat {
            return Err(invalid(
                "script_mode",
                "extra products need flats: use bias_dark_flat",
            ));
        }
        Ok(())
    }

    /// Returns the settings for an image type, when configured.
    pub fn settings_for(&self, image_type: ImageType) -> Option<&ImageTypeSettings> {
        match image_type {
            ImageType::Bias => Some(&self.bias),
            ImageType::Dark => self.dark.as_ref(),
            ImageType::Flat => self.flat.as_ref(),
        }
    }

    /// Builds the generation pipeline config string for an image type.
    pub fn generation_config_string(&self, settings: &ImageTypeSettings) -> String {
        format!(
            "-j {} -i {} --register-dataset-types {}",
            self.n_processes, settings.input_collections, settings.config_options
        )
        .trim_end()
        .to_string()
    }

    /// Builds the verification pipeline config string, with the generation
    /// job's output collection as an extra input.
    pub fn verification_config_string(
        &self,
        settings: &ImageTypeSettings,
        generation_job: &JobId,
    ) -> String {
        format!(
            "-j {} -i {} -i {} --register-dataset-types {}",
            self.n_processes,
            settings.verify_input_collections,
            generation_job.output_collection(),
            settings.verify_config_options
        )
        .trim_end()
        .to_string()
    }

    /// Returns the decision thresholds in the analyzer's form.
    pub fn decision_thresholds(&self) -> Thresholds {
        Thresholds {
            default_max_failures_per_detector: self.thresholds.max_failures_per_detector_per_test,
            per_test: self.thresholds.per_test.clone(),
        }
    }

    /// Overall ingestion wait per batch.
    pub fn ingest_timeout(&self) -> Duration {
        Duration::from_secs(self.ingest_timeout_secs)
    }

    /// Wait for a submission acknowledgment.
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    /// Per-task budget for spawned pipeline tasks.
    pub fn background_task_timeout(&self) -> Duration {
        Duration::from_secs(self.background_task_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
instrument: LATISS
repo: /repo/main
detectors: [0]
script_mode: bias
calib_collection: calib/daily
bias:
  n_images: 20
  n_discard: 1
  input_collections: LATISS/raw/all
  verify_input_collections: LATISS/calib
"#;

    #[test]
    fn test_minimal_config_loads_with_defaults() {
        let config = RunConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.instrument, "LATISS");
        assert_eq!(config.script_mode, ScriptMode::Bias);
        assert_eq!(config.n_processes, 8);
        assert_eq!(config.ingest_timeout(), Duration::from_secs(600));
        assert_eq!(config.thresholds.max_failures_per_detector_per_test, 8);
        assert_eq!(config.certify_begin_date.to_string(), "1950-01-01");
        assert_eq!(config.certify_end_date.to_string(), "2050-01-01");
        assert_eq!(config.log.dir, "logs");
    }

    #[test]
    fn test_log_section_overrides_and_defaults() {
        let yaml = format!("{MINIMAL}\nlog:\n  dir: /var/log/calforge\n");
        let config = RunConfig::from_yaml(&yaml).unwrap();
        assert_eq!(config.log.dir, "/var/log/calforge");
        assert_eq!(config.log.file_prefix, "calforge.log");
        assert_eq!(config.log.filter, "info");
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let yaml = format!("{MINIMAL}\nunknown_option: 3\n");
        assert!(matches!(
            RunConfig::from_yaml(&yaml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_script_mode_requires_sections() {
        let yaml = MINIMAL.replace("script_mode: bias", "script_mode: bias_dark");
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "dark"));
    }

    #[test]
    fn test_exposure_time_scalar_broadcast() {
        let settings = ImageTypeSettings {
            n_images: 3,
            exp_times: ExpTimes::Scalar(15.0),
            n_discard: 0,
            input_collections: String::new(),
            verify_input_collections: String::new(),
            config_options: String::new(),
            verify_config_options: String::new(),
            do_verify: true,
        };
        assert_eq!(settings.exposure_times(), vec![15.0, 15.0, 15.0]);
    }

    #[test]
    fn test_exposure_time_list_length_mismatch_rejected() {
        let yaml = MINIMAL.replace("n_images: 20", "n_images: 20\n  exp_times: [1.0, 2.0]");
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "bias.exp_times"));
    }

    #[test]
    fn test_discard_exceeding_count_rejected() {
        let yaml = MINIMAL.replace("n_discard: 1", "n_discard: 20");
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "bias.n_discard"));
    }

    #[test]
    fn test_empty_validity_range_rejected() {
        let yaml = format!("{MINIMAL}\ncertify_begin_date: 2050-01-01\n");
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(
            matches!(err, ConfigError::Invalid { ref field, .. } if field == "certify_begin_date")
        );
    }

    #[test]
    fn test_empty_detectors_rejected() {
        let yaml = MINIMAL.replace("detectors: [0]", "detectors: []");
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "detectors"));
    }

    #[test]
    fn test_extra_products_need_flat_mode() {
        let yaml = format!("{MINIMAL}\ndo_ptc: true\n");
        let err = RunConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref field, .. } if field == "script_mode"));
    }

    #[test]
    fn test_config_string_builders() {
        let config = RunConfig::from_yaml(MINIMAL).unwrap();
        let generation = config.generation_config_string(&config.bias);
        assert_eq!(generation, "-j 8 -i LATISS/raw/all --register-dataset-types");

        let verification = config.verification_config_string(&config.bias, &JobId::new("g-1"));
        assert_eq!(
            verification,
            "-j 8 -i LATISS/calib -i u/ocps/g-1 --register-dataset-types"
        );
    }

    #[test]
    fn test_config_string_includes_options() {
        let yaml = MINIMAL.replace(
            "verify_input_collections: LATISS/calib",
            "verify_input_collections: LATISS/calib\n  config_options: \"-c isr:doDefect=False\"",
        );
        let config = RunConfig::from_yaml(&yaml).unwrap();
        assert_eq!(
            config.generation_config_string(&config.bias),
            "-j 8 -i LATISS/raw/all --register-dataset-types -c isr:doDefect=False"
        );
    }

    #[test]
    fn test_from_file_round_trip() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = RunConfig::from_file(file.path()).unwrap();
        assert_eq!(config.repo, "/repo/main");
    }

    #[test]
    fn test_from_file_missing_path() {
        assert!(matches!(
            RunConfig::from_file("/nonexistent/calforge.yaml"),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn test_full_config_with_all_sections() {
        let yaml = r#"
instrument: LSSTComCam
repo: /repo/main
detectors: [0, 1, 2, 3, 4, 5, 6, 7, 8]
script_mode: bias_dark_flat
calib_collection: calib/daily
do_defects: true
do_ptc: true
thresholds:
  max_failures_per_detector_per_test: 8
  per_test:
    NOISE: 12
bias:
  n_images: 20
  n_discard: 1
  input_collections: raw/all
  verify_input_collections: calib
dark:
  n_images: 10
  exp_times: 30.0
  n_discard: 1
  input_collections: raw/all
  verify_input_collections: calib
flat:
  n_images: 6
  exp_times: [5.0, 5.0, 10.0, 10.0, 20.0, 20.0]
  input_collections: raw/all
  verify_input_collections: calib
  do_verify: false
"#;
        let config = RunConfig::from_yaml(yaml).unwrap();
        assert_eq!(
            config.script_mode.image_types(),
            &[ImageType::Bias, ImageType::Dark, ImageType::Flat]
        );
        let flat = config.settings_for(ImageType::Flat).unwrap();
        assert!(!flat.do_verify);
        assert_eq!(flat.exposure_times().len(), 6);
        assert_eq!(config.decision_thresholds().limit_for("NOISE"), 12);
        assert_eq!(config.decision_thresholds().limit_for("MEAN"), 8);
    }
}
