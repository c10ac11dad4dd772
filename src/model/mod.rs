//! Core domain types shared across the orchestrator.
//!
//! These types are deliberately small and owned: components receive only the
//! slices of state they need as parameters, and identifiers are opaque
//! newtypes so they cannot be mixed up at call sites.

mod ids;
mod image_type;
mod job;
mod selection;

pub use ids::{ExposureId, JobId};
pub use image_type::ImageType;
pub use job::{Job, JobState};
pub use selection::Selection;
