//! Incremental losses.
//!
//! - [`L2Loss`]: scaled squared difference with configurable reduction
//! - [`BceDistillation`]: multi-label BCE with soft old-class targets
//! - [`CeL2Distillation`]: cross-entropy plus L2 distillation
//! - [`IncrementalLoss`]: the formulation chosen by configuration

pub mod bce;
pub mod ce_l2;
pub mod l2;

use candle_core::Tensor;

pub use bce::{bce_with_logits, BceDistillation, VARIANT_THREE_DIVISOR};
pub use ce_l2::{cross_entropy_sum, normalize_outputs, CeL2Distillation};
pub use l2::L2Loss;

use crate::config::{IcarlConfig, LossConfig};
use crate::error::{IcarlError, Result};
use crate::model::{FrozenModel, IncrementalModel};

/// Class range of one incremental step.
///
/// Classes `[start_label, end_label)` are introduced by the step; labels in
/// `new_classes` receive hard targets in the BCE formulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepClasses {
    /// First label introduced by this step.
    pub start_label: u32,
    /// One past the last label learned so far.
    pub end_label: u32,
    /// Labels newly introduced by this step.
    pub new_classes: Vec<u32>,
}

impl StepClasses {
    /// Step introducing every label in `[start_label, end_label)`.
    #[must_use]
    pub fn new(start_label: u32, end_label: u32) -> Self {
        Self {
            start_label,
            end_label,
            new_classes: (start_label..end_label).collect(),
        }
    }

    /// Override the set of labels treated as new.
    #[must_use]
    pub fn with_new_classes(mut self, new_classes: Vec<u32>) -> Self {
        self.new_classes = new_classes;
        self
    }

    /// Whether this is the first step (no previous model to distill from).
    #[must_use]
    pub const fn is_first(&self) -> bool {
        self.start_label == 0
    }

    /// Whether `label` was introduced by this step.
    #[must_use]
    pub fn is_new(&self, label: u32) -> bool {
        self.new_classes.contains(&label)
    }

    /// Check that the range is non-empty and ordered.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::InvalidConfig`] for an empty or reversed range.
    pub fn validate(&self) -> Result<()> {
        if self.end_label == 0 || self.start_label >= self.end_label {
            return Err(IcarlError::invalid_config(format!(
                "invalid class range [{}, {})",
                self.start_label, self.end_label
            )));
        }
        Ok(())
    }
}

/// Loss formulation resolved once from configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IncrementalLoss {
    /// Binary cross-entropy with distillation in the targets.
    Bce(BceDistillation),
    /// Cross-entropy plus L2 distillation.
    CeL2(CeL2Distillation),
}

impl IncrementalLoss {
    /// Resolve the loss described by a configuration.
    #[must_use]
    pub fn from_config(config: &IcarlConfig) -> Self {
        match config.loss {
            LossConfig::Bce { variant, reduction } => {
                Self::Bce(BceDistillation::new(variant, reduction, config.total_classes))
            }
            LossConfig::CeL2 {
                normalization,
                distillation_weight,
                alpha,
            } => Self::CeL2(CeL2Distillation::new(normalization, distillation_weight, alpha)),
        }
    }

    /// Compute the loss of `model` on one batch.
    ///
    /// `frozen` is required whenever `step.start_label > 0`.
    ///
    /// # Errors
    ///
    /// Propagates the errors of the selected formulation.
    pub fn forward<M: IncrementalModel>(
        &self,
        model: &M,
        frozen: Option<&FrozenModel<M>>,
        inputs: &Tensor,
        labels: &Tensor,
        step: &StepClasses,
    ) -> Result<Tensor> {
        match self {
            Self::Bce(loss) => loss.forward(model, frozen, inputs, labels, step),
            Self::CeL2(loss) => loss.forward(model, frozen, inputs, labels, step),
        }
    }
}
