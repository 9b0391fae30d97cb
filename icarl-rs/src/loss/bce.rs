//! Multi-label binary cross-entropy with distillation folded into the targets.
//!
//! Each class is treated as an independent detector. On later steps the
//! target columns of previously learned classes carry the frozen model's
//! sigmoid outputs, so one BCE call trains new classes and distills old ones.

use candle_core::{DType, Device, Tensor};

use crate::config::{BceVariant, Reduction};
use crate::error::{IcarlError, Result};
use crate::loss::StepClasses;
use crate::model::{FrozenModel, IncrementalModel};

/// Fixed divisor applied to the summed loss of [`BceVariant::Three`].
pub const VARIANT_THREE_DIVISOR: f64 = 128.0 * 100.0;

/// Numerically stable binary cross-entropy on logits.
///
/// Element loss is `max(x, 0) − x·z + ln(1 + e^{−|x|})`.
///
/// # Errors
///
/// Returns an error if shapes differ or the inputs are not rank 2.
pub fn bce_with_logits(logits: &Tensor, targets: &Tensor, reduction: Reduction) -> Result<Tensor> {
    if logits.dims() != targets.dims() {
        return Err(IcarlError::shape_mismatch(targets.dims(), logits.dims()));
    }
    let (batch, classes) = logits.dims2()?;
    if batch == 0 || classes == 0 {
        return Err(IcarlError::EmptyInput("BCE over an empty matrix".into()));
    }
    let softplus = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    let elementwise = ((logits.relu()? - logits.mul(targets)?)? + softplus)?;
    let total = elementwise.sum_all()?;
    Ok((total / reduction.divisor(batch, classes))?)
}

/// Binary cross-entropy incremental loss.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BceDistillation {
    variant: BceVariant,
    reduction: Reduction,
    total_classes: u32,
}

impl BceDistillation {
    /// Create the loss.
    ///
    /// `reduction` applies to variants one and two; variant three always
    /// sums and divides by [`VARIANT_THREE_DIVISOR`].
    #[must_use]
    pub const fn new(variant: BceVariant, reduction: Reduction, total_classes: u32) -> Self {
        Self {
            variant,
            reduction,
            total_classes,
        }
    }

    /// Configured variant.
    #[must_use]
    pub const fn variant(&self) -> BceVariant {
        self.variant
    }

    /// Number of target columns for a step ending at `end_label`.
    #[must_use]
    pub const fn target_width(&self, end_label: u32) -> u32 {
        match self.variant {
            BceVariant::Two => self.total_classes,
            BceVariant::One | BceVariant::Three => end_label,
        }
    }

    /// Target width for `step`, checked to cover every label the step names.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::LabelOutOfRange`] when the step's classes do not
    /// fit in the target width, e.g. variant two with `end_label` beyond
    /// `total_classes`.
    pub fn checked_width(&self, step: &StepClasses) -> Result<u32> {
        let width = self.target_width(step.end_label);
        let highest = step.end_label.max(step.start_label);
        if highest > width {
            return Err(IcarlError::LabelOutOfRange {
                label: highest - 1,
                limit: width,
            });
        }
        Ok(width)
    }

    /// Build the `(batch, width)` target matrix.
    ///
    /// `old_probs` holds the frozen model's sigmoid outputs for the columns
    /// below `step.start_label`; it must be present on every step but the
    /// first.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::LabelOutOfRange`] for labels or a step range
    /// beyond the width, or [`IcarlError::ShapeMismatch`] for malformed
    /// `old_probs`.
    pub fn build_targets(
        &self,
        labels: &[u32],
        old_probs: Option<&[Vec<f32>]>,
        step: &StepClasses,
        device: &Device,
    ) -> Result<Tensor> {
        let width = self.checked_width(step)?;
        let w = width as usize;
        let start = step.start_label as usize;
        let old_probs = match old_probs {
            _ if step.is_first() => &[][..],
            None => {
                return Err(IcarlError::MissingFrozenModel {
                    start_label: step.start_label,
                })
            }
            Some(probs) => {
                if probs.len() != labels.len() || probs.iter().any(|row| row.len() != start) {
                    let cols = probs.first().map_or(0, Vec::len);
                    return Err(IcarlError::shape_mismatch(
                        &[labels.len(), start],
                        &[probs.len(), cols],
                    ));
                }
                probs
            }
        };
        let mut targets = vec![0f32; labels.len() * w];

        for (i, &label) in labels.iter().enumerate() {
            if label >= width {
                return Err(IcarlError::LabelOutOfRange {
                    label,
                    limit: width,
                });
            }
            let row = &mut targets[i * w..(i + 1) * w];
            if step.is_first() {
                row[label as usize] = 1.0;
                continue;
            }
            if step.is_new(label) {
                row[label as usize] = 1.0;
            }
            row[..start].copy_from_slice(&old_probs[i]);
        }

        Ok(Tensor::from_vec(targets, (labels.len(), w), device)?)
    }

    /// Compute the loss for one batch.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::MissingFrozenModel`] on a non-first step without
    /// a frozen model, [`IcarlError::ShapeMismatch`] if the model emits fewer
    /// scores than the target width, or any tensor error.
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
        let width = self.checked_width(step)? as usize;
        if outputs < width {
            return Err(IcarlError::shape_mismatch(&[batch, width], &[batch, outputs]));
        }
        let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;

        let old_probs = if step.is_first() {
            None
        } else {
            let frozen = frozen.ok_or(IcarlError::MissingFrozenModel {
                start_label: step.start_label,
            })?;
            let start = step.start_label as usize;
            let old_logits = frozen.logits(inputs)?;
            let (_, old_outputs) = old_logits.dims2()?;
            if old_outputs < start {
                return Err(IcarlError::shape_mismatch(&[batch, start], &[batch, old_outputs]));
            }
            let probs = candle_nn::ops::sigmoid(&old_logits.narrow(1, 0, start)?)?;
            Some(probs.to_dtype(DType::F32)?.to_vec2::<f32>()?)
        };

        let targets = self
            .build_targets(&labels, old_probs.as_deref(), step, logits.device())?
            .to_dtype(logits.dtype())?;
        let scores = logits.narrow(1, 0, width)?;

        match self.variant {
            BceVariant::Three => {
                let loss = bce_with_logits(&scores, &targets, Reduction::Sum)?;
                Ok((loss / VARIANT_THREE_DIVISOR)?)
            }
            BceVariant::One | BceVariant::Two => bce_with_logits(&scores, &targets, self.reduction),
        }
    }
}
