//! Run coordination.
//!
//! The coordinator drives one calibration run end to end. It takes exposure
//! batches sequentially, one image type at a time, and hands each completed
//! batch to an independent post-processing task (generation, optional
//! verification, certification) so the next type's images can be taken while
//! the previous type is still being verified. Extra products (defects,
//! photon-transfer curve, gain from flat pairs) spawn as further independent
//! tasks once every basic type has been taken.
//!
//! Failure domains are isolated: a failed batch or task is logged and
//! reported in the final [`RunSummary`], and never aborts siblings or the
//! main sequence. Every spawned task is either awaited or cancelled before
//! [`RunCoordinator::execute`] returns; the whole task set shares one
//! aggregate deadline of `background_task_timeout * task_count`.

mod summary;

pub use summary::{Outcome, RunSummary};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::batch::{BatchError, BatchTaker};
use crate::certify::{CertifyError, CertifyRequest, CertifyTool};
use crate::config::{ImageTypeSettings, RunConfig};
use crate::exec::{
    CorrelationError, DispatchError, ExecutionService, JobDispatcher, JobPhase, PipelineSpec,
    ResultCorrelator,
};
use crate::instrument::InstrumentProxy;
use crate::model::{ExposureId, ImageType, Job, JobId, Selection};
use crate::repository::DataRepository;
use crate::verify::{VerificationAnalyzer, VerifyError};

/// Errors from one calibration pipeline (an image type's or an extra
/// product's generation-to-certification sequence).
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Submission or acknowledgment failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// No completion event arrived, or its payload was unreadable.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),

    /// The service reported the job finished unsuccessfully.
    #[error("job {job_id} ended in phase {phase}")]
    JobFailed {
        /// The failed job.
        job_id: JobId,
        /// Terminal phase the service reported.
        phase: JobPhase,
    },

    /// The verification summary could not be read.
    #[error(transparent)]
    Verify(#[from] VerifyError),

    /// The certification tool failed.
    #[error(transparent)]
    Certify(#[from] CertifyError),

    /// The task was cancelled by the aggregate timeout.
    #[error("task cancelled")]
    Cancelled,
}

/// Calibration products generated after the basic image types.
///
/// Each runs its own generation pipeline over already-taken exposures;
/// none of them is verified. Gain measurement produces no certifiable
/// dataset and stops after the pipeline completes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExtraProduct {
    /// Defect map, built from dark and flat exposures.
    Defects,
    /// Photon-transfer curve, built from flat exposures.
    Ptc,
    /// Gain measured from flat pairs; measurement only.
    GainFromFlatPairs,
}

impl ExtraProduct {
    /// Returns the pipeline file that generates this product.
    pub fn pipeline_file(&self) -> &'static str {
        match self {
            Self::Defects => "cpDefects.yaml",
            Self::Ptc => "cpPtc.yaml",
            Self::GainFromFlatPairs => "cpPtcGainFromFlatPairs.yaml",
        }
    }

    /// Returns the dataset type to certify, or `None` for measurement-only
    /// products.
    pub fn dataset_type(&self) -> Option<&'static str> {
        match self {
            Self::Defects => Some("defects"),
            Self::Ptc => Some("ptc"),
            Self::GainFromFlatPairs => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Defects => "DEFECTS",
            Self::Ptc => "PTC",
            Self::GainFromFlatPairs => "GAIN",
        }
    }
}

impl fmt::Display for ExtraProduct {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coordinator-owned mutable state for one run.
#[derive(Debug, Default)]
struct RunState {
    /// Exposures actually taken and ingested, discards included.
    images_taken: u64,
    /// Usable exposure ids per image type, in request order.
    exposures: Vec<(ImageType, Vec<ExposureId>)>,
}

impl RunState {
    fn record(&mut self, image_type: ImageType, ids: &[ExposureId]) {
        match self.exposures.iter_mut().find(|(ty, _)| *ty == image_type) {
            Some((_, existing)) => existing.extend_from_slice(ids),
            None => self.exposures.push((image_type, ids.to_vec())),
        }
    }

    fn exposures_for(&self, image_type: ImageType) -> &[ExposureId] {
        self.exposures
            .iter()
            .find(|(ty, _)| *ty == image_type)
            .map(|(_, ids)| ids.as_slice())
            .unwrap_or(&[])
    }
}

enum TaskLabel {
    Type(ImageType),
    Extra(ExtraProduct),
}

impl fmt::Display for TaskLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Type(ty) => write!(f, "{ty}"),
            Self::Extra(product) => write!(f, "{product}"),
        }
    }
}

struct SpawnedTask {
    label: TaskLabel,
    handle: tokio::task::JoinHandle<Result<Outcome, PipelineError>>,
}

/// Injected collaborators, shared with every spawned task.
struct Deps<I, X, R, C> {
    instrument: I,
    service: X,
    repository: R,
    certifier: C,
}

/// Drives one calibration run over injected, ready collaborators.
pub struct RunCoordinator<I, X, R, C> {
    deps: Arc<Deps<I, X, R, C>>,
    config: Arc<RunConfig>,
}

impl<I, X, R, C> RunCoordinator<I, X, R, C>
where
    I: InstrumentProxy,
    X: ExecutionService,
    R: DataRepository,
    C: CertifyTool,
{
    /// Creates a coordinator over already-constructed collaborators.
    pub fn new(instrument: I, service: X, repository: R, certifier: C, config: RunConfig) -> Self {
        Self {
            deps: Arc::new(Deps {
                instrument,
                service,
                repository,
                certifier,
            }),
            config: Arc::new(config),
        }
    }

    /// Runs the whole calibration sequence and returns the per-run summary.
    ///
    /// Returns only after every requested image type has been processed and
    /// every spawned task has been awaited or cancelled.
    pub async fn execute(&self) -> RunSummary {
        let mut state = RunState::default();
        let mut summary = RunSummary::default();
        let mut tasks: Vec<SpawnedTask> = Vec::new();
        let cancel = CancellationToken::new();

        info!(
            instrument = %self.config.instrument,
            mode = ?self.config.script_mode,
            detectors = self.config.detectors.len(),
            "Starting calibration run"
        );

        for &image_type in self.config.script_mode.image_types() {
            // Sections for every mode-selected type exist after validation.
            let Some(settings) = self.config.settings_for(image_type) else {
                continue;
            };
            let settings = settings.clone();

            match self.take_images(image_type, &settings, &mut state).await {
                Ok(exposures) if exposures.is_empty() => {
                    warn!(image_type = %image_type, "No usable exposures; skipping pipeline");
                    summary.image_types.push((
                        image_type,
                        Outcome::Failed {
                            error: "no usable exposures ingested".to_string(),
                        },
                    ));
                }
                Ok(exposures) => {
                    tasks.push(self.spawn_image_type(image_type, settings, exposures, &cancel));
                }
                Err(error) => {
                    error!(
                        image_type = %image_type,
                        error = %error,
                        "Batch failed; skipping image type"
                    );
                    summary.image_types.push((
                        image_type,
                        Outcome::Failed {
                            error: error.to_string(),
                        },
                    ));
                }
            }
        }

        for product in self.requested_extra_products() {
            let exposures = self.extra_product_exposures(product, &state);
            if exposures.is_empty() {
                warn!(product = %product, "No source exposures; skipping extra product");
                summary.extra_products.push((
                    product,
                    Outcome::Failed {
                        error: "no source exposures available".to_string(),
                    },
                ));
                continue;
            }
            // Extra products require bias_dark_flat mode, so the flat
            // section exists after validation.
            let Some(settings) = self.config.settings_for(ImageType::Flat) else {
                continue;
            };
            tasks.push(self.spawn_extra_product(product, settings.clone(), exposures, &cancel));
        }

        summary.images_taken = state.images_taken;

        if !tasks.is_empty() {
            self.await_tasks(tasks, cancel, &mut summary).await;
        }
        summary.image_types.sort_by_key(|(ty, _)| *ty);

        info!(
            images_taken = summary.images_taken,
            all_certified = summary.all_types_certified(),
            "Calibration run complete"
        );
        summary
    }

    /// Takes one image type's batch, proceeding with a partial batch on
    /// ingestion timeout.
    async fn take_images(
        &self,
        image_type: ImageType,
        settings: &ImageTypeSettings,
        state: &mut RunState,
    ) -> Result<Vec<ExposureId>, BatchError> {
        let exposure_times = settings.exposure_times();
        let taker = BatchTaker::new(&self.deps.instrument, self.config.detectors.len());

        match taker
            .take_batch(
                image_type,
                &exposure_times,
                settings.n_discard,
                self.config.ingest_timeout(),
            )
            .await
        {
            Ok(batch) => {
                state.record(image_type, batch.exposures());
                state.images_taken += exposure_times.len() as u64;
                Ok(batch.exposures().to_vec())
            }
            Err(BatchError::IngestionTimeout {
                batch,
                missing,
                timeout,
            }) => {
                warn!(
                    image_type = %image_type,
                    missing = ?missing,
                    timeout = ?timeout,
                    usable = batch.exposures().len(),
                    "Proceeding with partial batch"
                );
                state.record(image_type, batch.exposures());
                state.images_taken += (exposure_times.len() - missing.len()) as u64;
                Ok(batch.exposures().to_vec())
            }
            Err(error) => Err(error),
        }
    }

    fn spawn_image_type(
        &self,
        image_type: ImageType,
        settings: ImageTypeSettings,
        exposures: Vec<ExposureId>,
        cancel: &CancellationToken,
    ) -> SpawnedTask {
        let deps = Arc::clone(&self.deps);
        let config = Arc::clone(&self.config);
        let token = cancel.child_token();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(PipelineError::Cancelled),
                result = run_image_type_pipeline(
                    &deps.service,
                    &deps.repository,
                    &deps.certifier,
                    &config,
                    image_type,
                    &settings,
                    exposures,
                ) => result,
            }
        });

        SpawnedTask {
            label: TaskLabel::Type(image_type),
            handle,
        }
    }

    fn spawn_extra_product(
        &self,
        product: ExtraProduct,
        settings: ImageTypeSettings,
        exposures: Vec<ExposureId>,
        cancel: &CancellationToken,
    ) -> SpawnedTask {
        let deps = Arc::clone(&self.deps);
        let config = Arc::clone(&self.config);
        let token = cancel.child_token();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => Err(PipelineError::Cancelled),
                result = run_extra_product_pipeline(
                    &deps.service,
                    &deps.certifier,
                    &config,
                    product,
                    &settings,
                    exposures,
                ) => result,
            }
        });

        SpawnedTask {
            label: TaskLabel::Extra(product),
            handle,
        }
    }

    /// Awaits every spawned task under the aggregate deadline, cancelling
    /// whatever is still running when it fires. Completed tasks keep their
    /// results either way.
    async fn await_tasks(
        &self,
        tasks: Vec<SpawnedTask>,
        cancel: CancellationToken,
        summary: &mut RunSummary,
    ) {
        let aggregate = self.config.background_task_timeout() * tasks.len() as u32;
        let watchdog = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(aggregate).await;
                warn!(
                    timeout = ?aggregate,
                    "Aggregate background-task timeout; cancelling unfinished tasks"
                );
                cancel.cancel();
            }
        });

        let (labels, handles): (Vec<_>, Vec<_>) = tasks
            .into_iter()
            .map(|task| (task.label, task.handle))
            .unzip();
        let results = futures::future::join_all(handles).await;
        watchdog.abort();

        for (label, result) in labels.into_iter().zip(results) {
            let outcome = match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(PipelineError::Cancelled)) => {
                    warn!(task = %label, "Task cancelled");
                    Outcome::Cancelled
                }
                Ok(Err(error)) => {
                    error!(task = %label, error = %error, "Task failed");
                    Outcome::Failed {
                        error: error.to_string(),
                    }
                }
                Err(join_error) => {
                    error!(task = %label, error = %join_error, "Task aborted");
                    Outcome::Failed {
                        error: join_error.to_string(),
                    }
                }
            };
            match label {
                TaskLabel::Type(ty) => summary.image_types.push((ty, outcome)),
                TaskLabel::Extra(product) => summary.extra_products.push((product, outcome)),
            }
        }
    }

    fn requested_extra_products(&self) -> Vec<ExtraProduct> {
        let mut products = Vec::new();
        if self.config.do_defects {
            products.push(ExtraProduct::Defects);
        }
        if self.config.do_ptc {
            products.push(ExtraProduct::Ptc);
        }
        if self.config.do_gain_from_flat_pairs {
            products.push(ExtraProduct::GainFromFlatPairs);
        }
        products
    }

    /// Returns the already-taken exposures an extra product is built from.
    fn extra_product_exposures(&self, product: ExtraProduct, state: &RunState) -> Vec<ExposureId> {
        match product {
            ExtraProduct::Defects => {
                let mut ids = state.exposures_for(ImageType::Dark).to_vec();
                ids.extend_from_slice(state.exposures_for(ImageType::Flat));
                ids
            }
            ExtraProduct::Ptc | ExtraProduct::GainFromFlatPairs => {
                state.exposures_for(ImageType::Flat).to_vec()
            }
        }
    }
}

/// Awaits a job's terminal completion event, driving its lifecycle state
/// from the phases the service reports.
///
/// Non-terminal phases mark the job running and the wait continues under
/// the same overall deadline. `completed` and `failed` are terminal; a
/// correlation timeout marks the job timed out before the error
/// propagates.
async fn await_terminal_phase(
    correlator: &mut ResultCorrelator,
    job: &mut Job,
    timeout: Duration,
) -> Result<(), PipelineError> {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let outcome = match correlator.await_result(job.id(), remaining).await {
            Ok(outcome) => outcome,
            Err(error @ CorrelationError::TimedOut { .. }) => {
                job.mark_timed_out();
                return Err(error.into());
            }
            Err(error) => return Err(error.into()),
        };
        match outcome.phase {
            JobPhase::Completed => {
                job.mark_completed();
                return Ok(());
            }
            JobPhase::Failed => {
                job.mark_failed();
                return Err(PipelineError::JobFailed {
                    job_id: job.id().clone(),
                    phase: JobPhase::Failed,
                });
            }
            JobPhase::Other(phase) => {
                debug!(job_id = %job.id(), phase = %phase, "Interim status; job running");
                job.mark_running();
            }
        }
    }
}

/// One image type's post-processing: generation, optional verification, and
/// certification, in that order.
async fn run_image_type_pipeline<X, R, C>(
    service: &X,
    repository: &R,
    certifier: &C,
    config: &RunConfig,
    image_type: ImageType,
    settings: &ImageTypeSettings,
    exposures: Vec<ExposureId>,
) -> Result<Outcome, PipelineError>
where
    X: ExecutionService,
    R: DataRepository,
    C: CertifyTool,
{
    let selection = Selection::new(
        config.instrument.as_str(),
        config.detectors.clone(),
        exposures,
    );
    let dispatcher = JobDispatcher::new(service, &config.instrument);

    // Subscribe before dispatching so a fast completion is not missed.
    let mut correlator = ResultCorrelator::new(service.completion_events());
    let mut generation = dispatcher
        .dispatch(
            PipelineSpec {
                root: &config.generation_pipeline_root,
                file: image_type.generation_pipeline_file(),
            },
            &config.generation_config_string(settings),
            selection.clone(),
            config.ack_timeout(),
        )
        .await?;
    info!(
        image_type = %image_type,
        job_id = %generation.id(),
        pipeline = %generation.pipeline(),
        "Generation dispatched"
    );

    await_terminal_phase(
        &mut correlator,
        &mut generation,
        config.background_task_timeout(),
    )
    .await?;

    let decision = if settings.do_verify {
        let mut correlator = ResultCorrelator::new(service.completion_events());
        let mut verify = dispatcher
            .dispatch(
                PipelineSpec {
                    root: &config.verification_pipeline_root,
                    file: image_type.verification_pipeline_file(),
                },
                &config.verification_config_string(settings, generation.id()),
                selection,
                config.ack_timeout(),
            )
            .await?;
        info!(image_type = %image_type, job_id = %verify.id(), "Verification dispatched");

        await_terminal_phase(&mut correlator, &mut verify, config.background_task_timeout())
            .await?;

        let thresholds = config.decision_thresholds();
        let analyzer =
            VerificationAnalyzer::new(repository, &thresholds, config.detectors.len());
        let decision = analyzer
            .check_verification(
                image_type,
                &config.instrument,
                verify.id(),
                Some(generation.id()),
            )
            .await?;
        if !decision.certify {
            return Ok(Outcome::Rejected { decision });
        }
        Some(decision)
    } else {
        info!(image_type = %image_type, "Verification disabled; certifying directly");
        None
    };

    certify_product(
        certifier,
        config,
        image_type.dataset_type(),
        generation.id(),
    )
    .await?;
    Ok(Outcome::Certified { decision })
}

/// One extra product's pipeline: generation over already-taken exposures,
/// then certification when the product has a certifiable dataset type.
async fn run_extra_product_pipeline<X, C>(
    service: &X,
    certifier: &C,
    config: &RunConfig,
    product: ExtraProduct,
    settings: &ImageTypeSettings,
    exposures: Vec<ExposureId>,
) -> Result<Outcome, PipelineError>
where
    X: ExecutionService,
    C: CertifyTool,
{
    let selection = Selection::new(
        config.instrument.as_str(),
        config.detectors.clone(),
        exposures,
    );
    let dispatcher = JobDispatcher::new(service, &config.instrument);

    let mut correlator = ResultCorrelator::new(service.completion_events());
    let mut job = dispatcher
        .dispatch(
            PipelineSpec {
                root: &config.generation_pipeline_root,
                file: product.pipeline_file(),
            },
            &config.generation_config_string(settings),
            selection,
            config.ack_timeout(),
        )
        .await?;
    info!(product = %product, job_id = %job.id(), "Extra product dispatched");

    await_terminal_phase(&mut correlator, &mut job, config.background_task_timeout()).await?;

    match product.dataset_type() {
        Some(dataset_type) => {
            certify_product(certifier, config, dataset_type, job.id()).await?;
            Ok(Outcome::Certified { decision: None })
        }
        None => {
            info!(product = %product, job_id = %job.id(), "Measurement complete");
            Ok(Outcome::Completed)
        }
    }
}

async fn certify_product<C: CertifyTool>(
    certifier: &C,
    config: &RunConfig,
    dataset_type: &str,
    generation_job: &JobId,
) -> Result<(), CertifyError> {
    certifier
        .certify(&CertifyRequest {
            repo: config.repo.clone(),
            source_collection: generation_job.output_collection(),
            dest_collection: config.calib_collection.clone(),
            begin_date: config.certify_begin_date,
            end_date: config.certify_end_date,
            dataset_type: dataset_type.to_string(),
        })
        .await
}
