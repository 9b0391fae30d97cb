//! Scaled squared-difference loss between two `(batch, classes)` matrices.

use candle_core::Tensor;

use crate::config::Reduction;
use crate::error::{IcarlError, Result};

/// L2 loss: per-row `Σ α·(output − target)²`, reduced across the batch.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use icarl_rs::{L2Loss, Reduction};
///
/// # fn main() -> icarl_rs::Result<()> {
/// let device = Device::Cpu;
/// let outputs = Tensor::new(&[[1.0f32, 2.0], [0.0, 0.0]], &device)?;
/// let targets = Tensor::new(&[[0.0f32, 0.0], [0.0, 1.0]], &device)?;
///
/// let loss = L2Loss::new(Reduction::Sum, 1.0).forward(&outputs, &targets)?;
/// assert_eq!(loss.to_scalar::<f32>()?, 6.0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct L2Loss {
    reduction: Reduction,
    alpha: f64,
}

impl Default for L2Loss {
    fn default() -> Self {
        Self {
            reduction: Reduction::Mean,
            alpha: 1.0,
        }
    }
}

impl L2Loss {
    /// Create a loss with the given reduction and scale.
    #[must_use]
    pub const fn new(reduction: Reduction, alpha: f64) -> Self {
        Self { reduction, alpha }
    }

    /// Configured reduction.
    #[must_use]
    pub const fn reduction(&self) -> Reduction {
        self.reduction
    }

    /// Configured scale.
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Per-row losses of shape `(batch,)`.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::ShapeMismatch`] if the inputs differ in shape or
    /// are not rank 2.
    pub fn per_row(&self, outputs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        if outputs.dims() != targets.dims() {
            return Err(IcarlError::shape_mismatch(outputs.dims(), targets.dims()));
        }
        outputs.dims2()?;
        let diff = (outputs - targets)?;
        Ok(diff.sqr()?.affine(self.alpha, 0.0)?.sum(1)?)
    }

    /// Reduced scalar loss.
    ///
    /// # Errors
    ///
    /// Returns an error on shape mismatch or an empty batch.
    pub fn forward(&self, outputs: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let per_row = self.per_row(outputs, targets)?;
        let (batch, classes) = outputs.dims2()?;
        if batch == 0 || classes == 0 {
            return Err(IcarlError::EmptyInput("L2 loss over an empty matrix".into()));
        }
        let total = per_row.sum_all()?;
        Ok((total / self.reduction.divisor(batch, classes))?)
    }
}
