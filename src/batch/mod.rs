//! Exposure batch taking.
//!
//! Requests a sequence of exposures from the instrument and waits for every
//! one to be reported as ingested into the image repository, with a bounded
//! overall timeout and exact partial-success accounting.

use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::bus::StreamError;
use crate::instrument::{InstrumentError, InstrumentProxy};
use crate::model::{ExposureId, ImageType};

/// A completed (or sealed-partial) batch of ingested exposures.
///
/// The exposure list is in request order and already has the leading
/// discard exposures stripped; those exist to let the hardware settle and
/// are never fed to the pipelines.
#[derive(Clone, Debug)]
pub struct ExposureBatch {
    image_type: ImageType,
    exposure_times: Vec<f64>,
    discard_count: usize,
    exposures: Vec<ExposureId>,
}

impl ExposureBatch {
    fn new(
        image_type: ImageType,
        exposure_times: Vec<f64>,
        discard_count: usize,
        ingested: Vec<ExposureId>,
    ) -> Self {
        let exposures = ingested
            .into_iter()
            .skip(discard_count)
            .collect();
        Self {
            image_type,
            exposure_times,
            discard_count,
            exposures,
        }
    }

    /// Returns the image type of this batch.
    pub fn image_type(&self) -> ImageType {
        self.image_type
    }

    /// Returns the requested exposure durations, in seconds.
    pub fn exposure_times(&self) -> &[f64] {
        &self.exposure_times
    }

    /// Returns how many leading exposures were discarded.
    pub fn discard_count(&self) -> usize {
        self.discard_count
    }

    /// Returns the ingested exposure ids, in request order, discards
    /// stripped.
    pub fn exposures(&self) -> &[ExposureId] {
        &self.exposures
    }

    /// Returns true if no usable exposures remain.
    pub fn is_empty(&self) -> bool {
        self.exposures.is_empty()
    }
}

/// Errors from taking a batch.
#[derive(Debug, Error)]
pub enum BatchError {
    /// An exposure request failed.
    #[error(transparent)]
    Instrument(#[from] InstrumentError),

    /// Not every requested exposure was ingested before the timeout.
    ///
    /// Carries the partial batch (what did arrive, discards stripped) so
    /// the run can proceed with it, and the exact missing ids so nothing
    /// is silently dropped.
    #[error("exposures not ingested within {timeout:?}: {missing:?}")]
    IngestionTimeout {
        /// What was ingested before the deadline.
        batch: ExposureBatch,
        /// Exposures never (fully) ingested, in request order.
        missing: Vec<ExposureId>,
        /// The overall wait that elapsed.
        timeout: Duration,
    },

    /// The ingestion-event stream closed mid-wait.
    #[error("ingestion event stream closed while awaiting {image_type} batch")]
    StreamClosed {
        /// The batch's image type.
        image_type: ImageType,
    },
}

/// Takes exposure batches and waits for their ingestion.
///
/// Precondition (documented, not enforced by lock): nothing else requests
/// exposures of the same type concurrently, since the ingestion stream is
/// flushed before each new batch.
pub struct BatchTaker<'a, I> {
    instrument: &'a I,
    detector_count: usize,
}

impl<'a, I: InstrumentProxy> BatchTaker<'a, I> {
    /// Creates a batch taker for an instrument with `detector_count`
    /// detectors.
    pub fn new(instrument: &'a I, detector_count: usize) -> Self {
        Self {
            instrument,
            detector_count,
        }
    }

    /// Takes one batch: request every exposure, then wait until all of
    /// them are ingested or `timeout` elapses.
    ///
    /// Each exposure produces one ingestion event per detector, so the
    /// expected event count is `exposure_times.len() * detector_count`.
    /// Discarded leading exposures still count toward that total. On
    /// timeout the partial batch and the exact missing ids are returned in
    /// [`BatchError::IngestionTimeout`].
    pub async fn take_batch(
        &self,
        image_type: ImageType,
        exposure_times: &[f64],
        discard_count: usize,
        timeout: Duration,
    ) -> Result<ExposureBatch, BatchError> {
        // Subscribe before requesting so no ingestion event can be missed,
        // and flush so stale events from a previous batch are not
        // misattributed to this one.
        let mut events = self.instrument.ingestion_events();
        events.flush();

        let expected = exposure_times.len() * self.detector_count;
        info!(
            image_type = %image_type,
            exposures = exposure_times.len(),
            detectors = self.detector_count,
            expected_events = expected,
            "Taking exposure batch"
        );

        let mut requested: Vec<ExposureId> = Vec::with_capacity(exposure_times.len());
        for &exposure_time in exposure_times {
            let id = self
                .instrument
                .take_exposure(image_type, exposure_time)
                .await?;
            debug!(image_type = %image_type, exposure = %id, exposure_time, "Exposure requested");
            requested.push(id);
        }

        // Per-exposure countdown of outstanding detector ingestions, in
        // request order.
        let mut remaining: Vec<(ExposureId, usize)> = requested
            .iter()
            .map(|&id| (id, self.detector_count))
            .collect();
        let mut outstanding = expected;

        let deadline = Instant::now() + timeout;
        while outstanding > 0 {
            let window = deadline.saturating_duration_since(Instant::now());
            if window.is_zero() {
                break;
            }
            match events.next(window).await {
                Ok(event) => {
                    // Events for exposures we did not request are stale or
                    // foreign; they match no requested id and are ignored.
                    if let Some((_, count)) = remaining
                        .iter_mut()
                        .find(|(id, _)| id.matches_obs_id(&event.obs_id))
                    {
                        if *count > 0 {
                            *count -= 1;
                            outstanding -= 1;
                        }
                    }
                }
                Err(StreamError::TimedOut(_)) => break,
                Err(StreamError::Closed) => {
                    return Err(BatchError::StreamClosed { image_type });
                }
            }
        }

        if outstanding == 0 {
            let batch = ExposureBatch::new(
                image_type,
                exposure_times.to_vec(),
                discard_count,
                requested,
            );
            info!(
                image_type = %image_type,
                ingested = batch.exposures().len() + discard_count,
                usable = batch.exposures().len(),
                "Batch complete"
            );
            return Ok(batch);
        }

        let mut ingested = Vec::new();
        let mut missing = Vec::new();
        for &(id, count) in &remaining {
            if count == 0 {
                ingested.push(id);
            } else {
                missing.push(id);
            }
        }
        warn!(
            image_type = %image_type,
            missing = ?missing,
            "Batch incomplete: ingestion timeout"
        );
        Err(BatchError::IngestionTimeout {
            batch: ExposureBatch::new(image_type, exposure_times.to_vec(), discard_count, ingested),
            missing,
            timeout,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventStream, IngestionEvent, Subscription};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Instrument fake: returns sequential exposure ids and optionally
    /// announces ingestion events for each detector as soon as the
    /// exposure is requested.
    struct FakeInstrument {
        next_seq: AtomicU64,
        ingestion: EventStream<IngestionEvent>,
        detector_count: usize,
        /// Exposures (by request index, 0-based) that never ingest.
        drop_ingestion_for: Vec<u64>,
    }

    impl FakeInstrument {
        fn new(detector_count: usize) -> Self {
            Self {
                next_seq: AtomicU64::new(1),
                ingestion: EventStream::new(),
                detector_count,
                drop_ingestion_for: Vec::new(),
            }
        }

        fn dropping(detector_count: usize, drop_for: Vec<u64>) -> Self {
            Self {
                drop_ingestion_for: drop_for,
                ..Self::new(detector_count)
            }
        }
    }

    impl InstrumentProxy for FakeInstrument {
        async fn take_exposure(
            &self,
            _image_type: ImageType,
            _exposure_time: f64,
        ) -> Result<ExposureId, InstrumentError> {
            let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
            let id = ExposureId::new(2021070800000 + seq);
            if !self.drop_ingestion_for.contains(&seq) {
                for _ in 0..self.detector_count {
                    self.ingestion.publish(IngestionEvent {
                        obs_id: format!("CC_O_{}", id.obs_id()),
                    });
                }
            }
            Ok(id)
        }

        fn ingestion_events(&self) -> Subscription<IngestionEvent> {
            self.ingestion.subscribe()
        }

        fn name(&self) -> &str {
            "FakeInstrument"
        }
    }

    #[tokio::test]
    async fn test_successful_batch_returns_n_minus_discard_ids_in_order() {
        let instrument = FakeInstrument::new(3);
        let taker = BatchTaker::new(&instrument, 3);

        let batch = taker
            .take_batch(ImageType::Bias, &[0.0; 20], 1, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(batch.exposures().len(), 19);
        // Request order, first exposure stripped.
        let raws: Vec<u64> = batch.exposures().iter().map(|e| e.raw()).collect();
        let expected: Vec<u64> = (2..=20).map(|s| 2021070800000 + s).collect();
        assert_eq!(raws, expected);
    }

    #[tokio::test]
    async fn test_zero_discard_keeps_all_exposures() {
        let instrument = FakeInstrument::new(2);
        let taker = BatchTaker::new(&instrument, 2);

        let batch = taker
            .take_batch(ImageType::Dark, &[15.0, 15.0], 0, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(batch.exposures().len(), 2);
        assert_eq!(batch.exposure_times(), &[15.0, 15.0]);
    }

    #[tokio::test]
    async fn test_partial_batch_lists_exactly_the_missing_ids() {
        // Exposures 2 and 4 (request indices 1 and 3) never ingest.
        let instrument = FakeInstrument::dropping(2, vec![2, 4]);
        let taker = BatchTaker::new(&instrument, 2);

        let err = taker
            .take_batch(ImageType::Bias, &[0.0; 5], 0, Duration::from_millis(50))
            .await
            .unwrap_err();

        let BatchError::IngestionTimeout { batch, missing, .. } = err else {
            panic!("expected ingestion timeout");
        };
        let missing_raws: Vec<u64> = missing.iter().map(|e| e.raw()).collect();
        assert_eq!(missing_raws, vec![2021070800002, 2021070800004]);
        let got_raws: Vec<u64> = batch.exposures().iter().map(|e| e.raw()).collect();
        assert_eq!(got_raws, vec![2021070800001, 2021070800003, 2021070800005]);
    }

    #[tokio::test]
    async fn test_partially_ingested_exposure_counts_as_missing() {
        // One detector's event missing still leaves the exposure missing.
        struct HalfIngest {
            inner: FakeInstrument,
        }
        impl InstrumentProxy for HalfIngest {
            async fn take_exposure(
                &self,
                _image_type: ImageType,
                _exposure_time: f64,
            ) -> Result<ExposureId, InstrumentError> {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
                let id = ExposureId::new(2021070800000 + seq);
                // Publish one event instead of the expected two.
                self.inner.ingestion.publish(IngestionEvent {
                    obs_id: format!("CC_O_{}", id.obs_id()),
                });
                Ok(id)
            }
            fn ingestion_events(&self) -> Subscription<IngestionEvent> {
                self.inner.ingestion.subscribe()
            }
            fn name(&self) -> &str {
                "HalfIngest"
            }
        }

        let instrument = HalfIngest {
            inner: FakeInstrument::new(2),
        };
        let taker = BatchTaker::new(&instrument, 2);

        let err = taker
            .take_batch(ImageType::Bias, &[0.0], 0, Duration::from_millis(50))
            .await
            .unwrap_err();

        let BatchError::IngestionTimeout { batch, missing, .. } = err else {
            panic!("expected ingestion timeout");
        };
        assert_eq!(missing.len(), 1);
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn test_unprefixed_obs_id_events_still_count() {
        // Some archivers report the bare `<DAYOBS>_<SEQNUM>` form with no
        // instrument prefix; the match is on the exposure id either way.
        struct BareObsId {
            inner: FakeInstrument,
        }
        impl InstrumentProxy for BareObsId {
            async fn take_exposure(
                &self,
                _image_type: ImageType,
                _exposure_time: f64,
            ) -> Result<ExposureId, InstrumentError> {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
                let id = ExposureId::new(2021070800000 + seq);
                self.inner.ingestion.publish(IngestionEvent { obs_id: id.obs_id() });
                Ok(id)
            }
            fn ingestion_events(&self) -> Subscription<IngestionEvent> {
                self.inner.ingestion.subscribe()
            }
            fn name(&self) -> &str {
                "BareObsId"
            }
        }

        let instrument = BareObsId {
            inner: FakeInstrument::new(1),
        };
        let taker = BatchTaker::new(&instrument, 1);

        let batch = taker
            .take_batch(ImageType::Bias, &[0.0, 0.0], 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(batch.exposures().len(), 2);
    }

    #[tokio::test]
    async fn test_stale_events_are_flushed_before_requests() {
        let instrument = FakeInstrument::new(1);
        // A stale event for an exposure this batch will also request would
        // otherwise be double-counted.
        instrument.ingestion.publish(IngestionEvent {
            obs_id: "CC_O_20210708_000001".to_string(),
        });

        let taker = BatchTaker::new(&instrument, 1);
        let batch = taker
            .take_batch(ImageType::Bias, &[0.0, 0.0], 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(batch.exposures().len(), 2);
    }

    #[tokio::test]
    async fn test_foreign_events_are_ignored() {
        let instrument = FakeInstrument::new(1);
        let taker = BatchTaker::new(&instrument, 1);

        // Unrelated ingestion chatter mixed into the stream.
        instrument.ingestion.publish(IngestionEvent {
            obs_id: "AT_O_19990101_000001".to_string(),
        });
        instrument.ingestion.publish(IngestionEvent {
            obs_id: "short".to_string(),
        });

        let batch = taker
            .take_batch(ImageType::Flat, &[5.0], 0, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(batch.exposures().len(), 1);
    }
}
