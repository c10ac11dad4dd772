//! Instrument proxy seam.
//!
//! The orchestrator never talks to camera hardware directly; it receives an
//! already-constructed [`InstrumentProxy`] at coordinator construction time
//! and drives it through this trait.

use std::future::Future;

use thiserror::Error;

use crate::bus::{IngestionEvent, Subscription};
use crate::model::{ExposureId, ImageType};

/// Errors from exposure requests.
#[derive(Debug, Error)]
pub enum InstrumentError {
    /// The instrument rejected the exposure request.
    #[error("exposure request rejected: {0}")]
    Rejected(String),

    /// The instrument proxy is unreachable.
    #[error("instrument unavailable: {0}")]
    Unavailable(String),
}

/// Remote proxy for the instrument taking calibration exposures.
///
/// Implementations wrap the observatory's camera remote. Each successful
/// request captures one exposure; its ingestion into the image repository
/// is announced separately on the ingestion-event stream, one event per
/// detector.
pub trait InstrumentProxy: Send + Sync + 'static {
    /// Requests one exposure of the given type and duration (seconds).
    ///
    /// Returns the packed exposure id the instrument assigned.
    fn take_exposure(
        &self,
        image_type: ImageType,
        exposure_time: f64,
    ) -> impl Future<Output = Result<ExposureId, InstrumentError>> + Send;

    /// Opens a subscription on the ingestion-event stream.
    fn ingestion_events(&self) -> Subscription<IngestionEvent>;

    /// Returns the instrument name for logging.
    fn name(&self) -> &str;
}
