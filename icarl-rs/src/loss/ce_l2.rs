//! Softmax cross-entropy with an L2 distillation term on old classes.

use candle_core::{DType, Tensor, D};

use crate::config::{OutputNormalization, Reduction};
use crate::error::{IcarlError, Result};
use crate::loss::l2::L2Loss;
use crate::loss::StepClasses;
use crate::model::{FrozenModel, IncrementalModel};

/// Summed cross-entropy of `(batch, classes)` logits against `u32` labels.
///
/// # Errors
///
/// Returns [`IcarlError::LabelOutOfRange`] if a label has no logit column.
#[allow(clippy::cast_possible_truncation)]
pub fn cross_entropy_sum(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let (_, classes) = logits.dims2()?;
    let labels = labels.to_dtype(DType::U32)?;
    if let Some(&label) = labels
        .to_vec1::<u32>()?
        .iter()
        .find(|&&label| label as usize >= classes)
    {
        return Err(IcarlError::LabelOutOfRange {
            label,
            limit: classes as u32,
        });
    }
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let picked = log_probs.gather(&labels.unsqueeze(1)?, 1)?;
    Ok(picked.sum_all()?.neg()?)
}

/// Apply the configured squashing over the class dimension.
///
/// # Errors
///
/// Propagates tensor errors.
pub fn normalize_outputs(normalization: OutputNormalization, logits: &Tensor) -> Result<Tensor> {
    Ok(match normalization {
        OutputNormalization::Sigmoid => candle_nn::ops::sigmoid(logits)?,
        OutputNormalization::Softmax => candle_nn::ops::softmax(logits, D::Minus1)?,
    })
}

/// Cross-entropy + L2 distillation incremental loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CeL2Distillation {
    normalization: OutputNormalization,
    distillation_weight: f64,
    l2: L2Loss,
}

impl CeL2Distillation {
    /// Create the loss. The L2 term always sums over the batch.
    #[must_use]
    pub const fn new(normalization: OutputNormalization, distillation_weight: f64, alpha: f64) -> Self {
        Self {
            normalization,
            distillation_weight,
            l2: L2Loss::new(Reduction::Sum, alpha),
        }
    }

    /// Configured normalization.
    #[must_use]
    pub const fn normalization(&self) -> OutputNormalization {
        self.normalization
    }

    /// Compute the loss for one batch.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::MissingFrozenModel`] on a non-first step without
    /// a frozen model, or shape/label errors.
    #[allow(clippy::cast_precision_loss)]
    pub fn forward<M: IncrementalModel>(
        &self,
        model: &M,
        frozen: Option<&FrozenModel<M>>,
        inputs: &Tensor,
        labels: &Tensor,
        step: &StepClasses,
    ) -> Result<Tensor> {
        let logits = model.logits(inputs, true)?;
        let (batch, outputs) = logits.dims2()?;
        if batch == 0 {
            return Err(IcarlError::EmptyInput("cross-entropy over an empty batch".into()));
        }
        let classification = cross_entropy_sum(&logits, labels)?;

        if step.is_first() {
            return Ok((classification / batch as f64)?);
        }

        let frozen = frozen.ok_or(IcarlError::MissingFrozenModel {
            start_label: step.start_label,
        })?;
        let start = step.start_label as usize;
        let old_logits = frozen.logits(inputs)?;
        let (_, old_outputs) = old_logits.dims2()?;
        if outputs < start || old_outputs < start {
            return Err(IcarlError::shape_mismatch(
                &[batch, start],
                &[batch, outputs.min(old_outputs)],
            ));
        }

        let current = normalize_outputs(self.normalization, &logits)?.narrow(1, 0, start)?;
        let previous = normalize_outputs(self.normalization, &old_logits)?.narrow(1, 0, start)?;
        let distillation = self.l2.forward(&current, &previous)?;

        if tracing::enabled!(tracing::Level::TRACE) {
            let ce = classification.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            let dist = distillation.to_dtype(DType::F32)?.to_scalar::<f32>()?;
            tracing::trace!(classification = ce, distillation = dist, "ce_l2 components");
        }

        let total = (classification + (distillation * self.distillation_weight)?)?;
        Ok((total / batch as f64)?)
    }
}
