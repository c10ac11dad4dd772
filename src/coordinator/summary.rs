//! Per-run outcome reporting.

use crate::model::ImageType;
use crate::verify::CertificationDecision;

use super::ExtraProduct;

/// Terminal outcome of one calibration pipeline (an image type or an extra
/// product).
#[derive(Clone, Debug)]
pub enum Outcome {
    /// The product was certified into the calibration collection.
    ///
    /// The decision is `None` when verification was disabled for the type;
    /// otherwise it carries the tally the decision was reached with, which
    /// may record a soft pass.
    Certified {
        /// Verification decision, when verification ran.
        decision: Option<CertificationDecision>,
    },

    /// Verification rejected the product; it was not certified.
    Rejected {
        /// The rejecting decision, with its failure tally.
        decision: CertificationDecision,
    },

    /// The pipeline ran to completion with nothing to certify
    /// (measurement-only products).
    Completed,

    /// The pipeline failed; the error is rendered for reporting.
    Failed {
        /// Rendered failure.
        error: String,
    },

    /// The task was cancelled by the aggregate background-task timeout.
    Cancelled,
}

impl Outcome {
    /// Returns true when the product reached the calibration collection.
    pub fn is_certified(&self) -> bool {
        matches!(self, Self::Certified { .. })
    }

    /// Returns true when the product certified despite recorded failures.
    pub fn is_soft_pass(&self) -> bool {
        matches!(self, Self::Certified { decision: Some(d) } if d.is_soft_pass())
    }
}

/// Final per-run summary: what was certified, what was rejected, what
/// failed, and how many images were actually taken.
#[derive(Clone, Debug, Default)]
pub struct RunSummary {
    /// Outcome per requested image type, in processing order.
    pub image_types: Vec<(ImageType, Outcome)>,
    /// Outcome per requested extra product.
    pub extra_products: Vec<(ExtraProduct, Outcome)>,
    /// Count of exposures actually taken and ingested, discards included.
    pub images_taken: u64,
}

impl RunSummary {
    /// Returns true when every requested image type was certified.
    pub fn all_types_certified(&self) -> bool {
        !self.image_types.is_empty()
            && self
                .image_types
                .iter()
                .all(|(_, outcome)| outcome.is_certified())
    }

    /// Returns the outcome recorded for an image type, if it was requested.
    pub fn outcome_for(&self, image_type: ImageType) -> Option<&Outcome> {
        self.image_types
            .iter()
            .find(|(ty, _)| *ty == image_type)
            .map(|(_, outcome)| outcome)
    }

    /// Returns the outcome recorded for an extra product, if requested.
    pub fn extra_outcome_for(&self, product: ExtraProduct) -> Option<&Outcome> {
        self.extra_products
            .iter()
            .find(|(p, _)| *p == product)
            .map(|(_, outcome)| outcome)
    }
}
