//! Per-class prototypes: normalized means of normalized embeddings.

use candle_core::{DType, Device, Tensor};

use crate::error::{IcarlError, Result};
use crate::model::{normalized_features, IncrementalModel};
use crate::norm::{l2_normalize_rows, l2_normalize_slice};

/// Normalized mean embedding of every class, one row per label.
///
/// Always rebuilt wholesale by [`ClassMeans::compute`]; never merged.
#[derive(Debug, Clone)]
pub struct ClassMeans {
    means: Tensor,
    num_classes: usize,
    dim: usize,
}

impl ClassMeans {
    /// Wrap a `(classes, dim)` tensor, normalizing its rows.
    ///
    /// # Errors
    ///
    /// Returns an error if the tensor is not rank 2.
    pub fn from_tensor(means: &Tensor) -> Result<Self> {
        let (num_classes, dim) = means.dims2()?;
        Ok(Self {
            means: l2_normalize_rows(&means.to_dtype(DType::F32)?)?,
            num_classes,
            dim,
        })
    }

    /// Average normalized embeddings per class over every yielded batch.
    ///
    /// Sums accumulate in `f64`. Every class in `[0, ending_label)` must
    /// receive at least one sample.
    ///
    /// # Errors
    ///
    /// - [`IcarlError::EmptyInput`] if no batch is yielded
    /// - [`IcarlError::LabelOutOfRange`] for labels at or beyond `ending_label`
    /// - [`IcarlError::EmptyClass`] for a class without samples
    #[allow(clippy::cast_possible_truncation)]
    #[allow(clippy::cast_precision_loss)]
    pub fn compute<M, I>(model: &M, batches: I, ending_label: u32) -> Result<Self>
    where
        M: IncrementalModel,
        I: IntoIterator<Item = Result<(Tensor, Tensor)>>,
    {
        let classes = ending_label as usize;
        let mut sums: Vec<f64> = Vec::new();
        let mut counts = vec![0usize; classes];
        let mut dim = 0usize;
        let mut device: Option<Device> = None;

        for batch in batches {
            let (inputs, labels) = batch?;
            let features = normalized_features(model, &inputs)?;
            let rows = features.to_dtype(DType::F64)?.to_vec2::<f64>()?;
            let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
            if rows.len() != labels.len() {
                return Err(IcarlError::shape_mismatch(&[labels.len()], &[rows.len()]));
            }
            if device.is_none() {
                dim = features.dims2()?.1;
                sums = vec![0.0; classes * dim];
                device = Some(inputs.device().clone());
            }

            for (row, &label) in rows.iter().zip(labels.iter()) {
                if label >= ending_label {
                    return Err(IcarlError::LabelOutOfRange {
                        label,
                        limit: ending_label,
                    });
                }
                if row.len() != dim {
                    return Err(IcarlError::shape_mismatch(&[dim], &[row.len()]));
                }
                let c = label as usize;
                for (acc, v) in sums[c * dim..(c + 1) * dim].iter_mut().zip(row) {
                    *acc += v;
                }
                counts[c] += 1;
            }
        }

        let device = device
            .ok_or_else(|| IcarlError::EmptyInput("no batches to compute class means".into()))?;

        let mut means = Vec::with_capacity(classes * dim);
        for (c, &count) in counts.iter().enumerate() {
            if count == 0 {
                return Err(IcarlError::EmptyClass { label: c as u32 });
            }
            let mut mean: Vec<f64> = sums[c * dim..(c + 1) * dim]
                .iter()
                .map(|s| s / count as f64)
                .collect();
            l2_normalize_slice(&mut mean);
            means.extend(mean.into_iter().map(|v| v as f32));
        }

        tracing::debug!(classes, dim, samples = counts.iter().sum::<usize>(), "class means computed");

        Ok(Self {
            means: Tensor::from_vec(means, (classes, dim), &device)?,
            num_classes: classes,
            dim,
        })
    }

    /// Number of classes (rows).
    #[must_use]
    pub const fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Embedding width.
    #[must_use]
    pub const fn dim(&self) -> usize {
        self.dim
    }

    /// Whether a row exists for `label`.
    #[must_use]
    pub fn contains(&self, label: u32) -> bool {
        (label as usize) < self.num_classes
    }

    /// The `(classes, dim)` matrix of unit rows.
    #[must_use]
    pub const fn as_tensor(&self) -> &Tensor {
        &self.means
    }

    /// Mean of one class as a `(dim,)` vector.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::LabelOutOfRange`] for unknown labels.
    #[allow(clippy::cast_possible_truncation)]
    pub fn mean(&self, label: u32) -> Result<Tensor> {
        if !self.contains(label) {
            return Err(IcarlError::LabelOutOfRange {
                label,
                limit: self.num_classes as u32,
            });
        }
        Ok(self.means.get(label as usize)?)
    }

    /// Dot-product similarity of normalized embeddings to every mean,
    /// shape `(batch, classes)`.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::ShapeMismatch`] if the embedding width differs.
    pub fn similarities(&self, embeddings: &Tensor) -> Result<Tensor> {
        let (batch, dim) = embeddings.dims2()?;
        if dim != self.dim {
            return Err(IcarlError::shape_mismatch(&[batch, self.dim], &[batch, dim]));
        }
        let embeddings = embeddings.to_dtype(DType::F32)?;
        Ok(embeddings.matmul(&self.means.t()?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::tests::Identity;

    fn batch(rows: &[[f32; 3]], labels: &[u32]) -> Result<(Tensor, Tensor)> {
        let device = Device::Cpu;
        let values: Vec<f32> = rows.iter().flatten().copied().collect();
        Ok((
            Tensor::from_vec(values, (rows.len(), 3), &device)?,
            Tensor::new(labels, &device)?,
        ))
    }

    #[test]
    fn test_single_class_mean() {
        let v = [[1.0f32, 0.0, 0.0], [0.0, 2.0, 0.0], [0.0, 0.0, 3.0]];
        let means = ClassMeans::compute(&Identity, vec![batch(&v, &[0, 0, 0])], 1).unwrap();

        // Normalized inputs are unit axes; their mean is (1,1,1)/3.
        let row: Vec<f32> = means.mean(0).unwrap().to_vec1().unwrap();
        let expected = 1.0 / 3f32.sqrt();
        for value in &row {
            assert!((value - expected).abs() < 1e-6);
        }
        let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_means_span_batches() {
        let batches = vec![
            batch(&[[2.0, 0.0, 0.0], [0.0, 1.0, 0.0]], &[0, 1]),
            batch(&[[0.0, 3.0, 0.0]], &[1]),
        ];
        let means = ClassMeans::compute(&Identity, batches, 2).unwrap();
        assert_eq!(means.num_classes(), 2);
        assert_eq!(means.dim(), 3);

        let rows: Vec<Vec<f32>> = means.as_tensor().to_vec2().unwrap();
        assert_eq!(rows[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(rows[1], vec![0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_empty_class_is_an_error() {
        let batches = vec![batch(&[[1.0, 0.0, 0.0]], &[0])];
        assert!(matches!(
            ClassMeans::compute(&Identity, batches, 2),
            Err(IcarlError::EmptyClass { label: 1 })
        ));
    }

    #[test]
    fn test_label_beyond_ending_label() {
        let batches = vec![batch(&[[1.0, 0.0, 0.0]], &[3])];
        assert!(matches!(
            ClassMeans::compute(&Identity, batches, 2),
            Err(IcarlError::LabelOutOfRange { label: 3, limit: 2 })
        ));
    }

    #[test]
    fn test_no_batches() {
        let batches: Vec<Result<(Tensor, Tensor)>> = Vec::new();
        assert!(matches!(
            ClassMeans::compute(&Identity, batches, 1),
            Err(IcarlError::EmptyInput(_))
        ));
    }

    #[test]
    fn test_similarities_shape() {
        let device = Device::Cpu;
        let means =
            ClassMeans::from_tensor(&Tensor::new(&[[1.0f32, 0.0], [0.0, 2.0]], &device).unwrap())
                .unwrap();
        let sims: Vec<Vec<f32>> = means
            .similarities(&Tensor::new(&[[0.6f32, 0.8]], &device).unwrap())
            .unwrap()
            .to_vec2()
            .unwrap();
        assert!((sims[0][0] - 0.6).abs() < 1e-6);
        assert!((sims[0][1] - 0.8).abs() < 1e-6);

        let wrong = Tensor::zeros((1, 3), DType::F32, &device).unwrap();
        assert!(means.similarities(&wrong).is_err());
        assert!(means.mean(2).is_err());
    }
}
