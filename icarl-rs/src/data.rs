//! Dataset seam and batching.
//!
//! Datasets are indexable collections of `(input, label)` pairs exposing
//! their label column. [`BatchLoader`] walks an index subset in fixed-size
//! batches, in order or shuffled by a caller-supplied RNG.
//!
//! ```no_run
//! use candle_core::{Device, Tensor};
//! use icarl_rs::data::{BatchLoader, TensorDataset};
//!
//! # fn main() -> icarl_rs::Result<()> {
//! let inputs = Tensor::zeros((4, 8), candle_core::DType::F32, &Device::Cpu)?;
//! let dataset = TensorDataset::new(inputs, vec![0, 0, 1, 1])?;
//! for batch in BatchLoader::new(&dataset, vec![0, 1, 2, 3], 2) {
//!     let (xs, ys) = batch?;
//!     assert_eq!(xs.dims()[0], ys.dims()[0]);
//! }
//! # Ok(())
//! # }
//! ```

use candle_core::{Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{IcarlError, Result};

/// Indexable labelled dataset.
pub trait LabeledDataset {
    /// Number of samples.
    fn len(&self) -> usize;

    /// Whether the dataset holds no samples.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Label of every sample, aligned by index.
    fn targets(&self) -> &[u32];

    /// Device gathered batches are placed on.
    fn device(&self) -> &Device;

    /// Stack the given samples into `(inputs, labels)` with labels as `u32`.
    ///
    /// # Errors
    ///
    /// Returns an error for out-of-range indices or failed tensor ops.
    fn gather(&self, indices: &[usize]) -> Result<(Tensor, Tensor)>;
}

/// Dataset indices whose label equals `label`, in ascending order.
pub fn indices_of_label<D: LabeledDataset + ?Sized>(dataset: &D, label: u32) -> Vec<usize> {
    dataset
        .targets()
        .iter()
        .enumerate()
        .filter(|(_, target)| **target == label)
        .map(|(i, _)| i)
        .collect()
}

/// Dataset indices whose label lies in `[start, end)`.
pub fn indices_in_range<D: LabeledDataset + ?Sized>(dataset: &D, start: u32, end: u32) -> Vec<usize> {
    dataset
        .targets()
        .iter()
        .enumerate()
        .filter(|(_, target)| (start..end).contains(*target))
        .map(|(i, _)| i)
        .collect()
}

/// In-memory dataset backed by a single input tensor.
#[derive(Debug, Clone)]
pub struct TensorDataset {
    inputs: Tensor,
    targets: Vec<u32>,
}

impl TensorDataset {
    /// Create a dataset whose first input dimension indexes samples.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::ShapeMismatch`] when the sample count and label
    /// count differ.
    pub fn new(inputs: Tensor, targets: Vec<u32>) -> Result<Self> {
        let rows = inputs.dims().first().copied().unwrap_or(0);
        if rows != targets.len() {
            return Err(IcarlError::shape_mismatch(&[targets.len()], &[rows]));
        }
        Ok(Self { inputs, targets })
    }

    /// Full input tensor.
    pub fn inputs(&self) -> &Tensor {
        &self.inputs
    }
}

impl LabeledDataset for TensorDataset {
    fn len(&self) -> usize {
        self.targets.len()
    }

    fn targets(&self) -> &[u32] {
        &self.targets
    }

    fn device(&self) -> &Device {
        self.inputs.device()
    }

    #[allow(clippy::cast_possible_truncation)]
    fn gather(&self, indices: &[usize]) -> Result<(Tensor, Tensor)> {
        let mut ids = Vec::with_capacity(indices.len());
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            let label = *self.targets.get(i).ok_or(IcarlError::IndexOutOfRange {
                index: i,
                len: self.targets.len(),
            })?;
            ids.push(i as u32);
            labels.push(label);
        }
        let device = self.inputs.device();
        let ids = Tensor::from_vec(ids, indices.len(), device)?;
        let inputs = self.inputs.index_select(&ids, 0)?;
        let labels = Tensor::from_vec(labels, indices.len(), device)?;
        Ok((inputs, labels))
    }
}

/// Iterator over `(inputs, labels)` batches of an index subset.
pub struct BatchLoader<'a, D: ?Sized> {
    dataset: &'a D,
    indices: Vec<usize>,
    batch_size: usize,
    cursor: usize,
}

impl<'a, D: LabeledDataset + ?Sized> BatchLoader<'a, D> {
    /// Batches in the given index order. A zero batch size is treated as one.
    pub fn new(dataset: &'a D, indices: Vec<usize>, batch_size: usize) -> Self {
        Self {
            dataset,
            indices,
            batch_size: batch_size.max(1),
            cursor: 0,
        }
    }

    /// Batches over a shuffled copy of `indices`.
    pub fn shuffled<R: Rng + ?Sized>(
        dataset: &'a D,
        mut indices: Vec<usize>,
        batch_size: usize,
        rng: &mut R,
    ) -> Self {
        indices.shuffle(rng);
        Self::new(dataset, indices, batch_size)
    }

    /// Total number of batches, including a trailing partial one.
    pub fn num_batches(&self) -> usize {
        self.indices.len().div_ceil(self.batch_size)
    }

    /// Indices in visiting order.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }
}

impl<D: LabeledDataset + ?Sized> Iterator for BatchLoader<'_, D> {
    type Item = Result<(Tensor, Tensor)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.indices.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.indices.len());
        let chunk = &self.indices[self.cursor..end];
        self.cursor = end;
        Some(self.dataset.gather(chunk))
    }
}
