//! CalForge - calibration generation, verification, and certification
//! orchestration.
//!
//! CalForge drives the nightly calibration workflow for an instrument: it
//! takes batches of BIAS/DARK/FLAT exposures, waits for their ingestion into
//! the image repository, submits generation and verification pipelines to an
//! external execution service, correlates completion events on the service's
//! shared event stream, applies a threshold-based certification decision to
//! the verification results, and publishes accepted products into a
//! long-lived calibration collection.
//!
//! # High-Level API
//!
//! Construct a [`coordinator::RunCoordinator`] over ready collaborators and
//! a validated [`config::RunConfig`], then execute the run:
//!
//! ```ignore
//! use calforge::config::RunConfig;
//! use calforge::coordinator::RunCoordinator;
//! use calforge::certify::ButlerCertifier;
//! use calforge::logging::init_logging;
//!
//! let config = RunConfig::from_file("calforge.yaml")?;
//! let _log_guard = init_logging(&config.log)?;
//! let coordinator =
//!     RunCoordinator::new(instrument, service, repository, ButlerCertifier::new(), config);
//! let summary = coordinator.execute().await;
//! ```
//!
//! The instrument proxy, execution service, and data repository are trait
//! seams ([`instrument::InstrumentProxy`], [`exec::ExecutionService`],
//! [`repository::DataRepository`]); production implementations wrap the
//! observatory's control middleware and are injected at construction time.

pub mod batch;
pub mod bus;
pub mod certify;
pub mod config;
pub mod coordinator;
pub mod exec;
pub mod instrument;
pub mod logging;
pub mod model;
pub mod repository;
pub mod verify;

/// Version of the CalForge library.
///
/// The version is defined in `Cargo.toml` and injected at compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
