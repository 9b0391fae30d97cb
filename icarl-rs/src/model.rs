//! Model seam between the learning core and a candle network.
//!
//! The core never defines an architecture. It consumes any type implementing
//! [`IncrementalModel`] and wraps the previous step's network in a
//! [`FrozenModel`], an owned snapshot that only exposes inference.

use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::data::{BatchLoader, LabeledDataset};
use crate::error::{IcarlError, Result};
use crate::norm::l2_normalize_rows;

/// A classifier with an embedding layer, as seen by the incremental core.
///
/// The `train` flag follows `candle_nn::ModuleT`: `false` selects inference
/// behaviour (no dropout, running batch-norm statistics).
pub trait IncrementalModel {
    /// Raw class scores of shape `(batch, outputs)`.
    fn logits(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor>;

    /// Embeddings of shape `(batch, dim)` taken before the classifier head.
    fn features(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor>;
}

/// Immutable snapshot of the previous step's model.
///
/// The snapshot owns its weights, so the optimizer of the current model can
/// never reach them. Every output runs in inference mode and is detached from
/// the autograd graph.
pub struct FrozenModel<M> {
    inner: M,
}

impl<M: IncrementalModel> FrozenModel<M> {
    /// Freeze a model. Build `model` over weights that the current optimizer
    /// does not own, e.g. from [`snapshot_varmap`].
    pub fn new(model: M) -> Self {
        Self { inner: model }
    }

    /// Detached inference-mode logits.
    ///
    /// # Errors
    ///
    /// Propagates forward-pass failures.
    pub fn logits(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.inner.logits(xs, false)?.detach())
    }

    /// Detached inference-mode embeddings.
    ///
    /// # Errors
    ///
    /// Propagates forward-pass failures.
    pub fn features(&self, xs: &Tensor) -> Result<Tensor> {
        Ok(self.inner.features(xs, false)?.detach())
    }

    /// Read-only access to the wrapped model.
    pub fn inner(&self) -> &M {
        &self.inner
    }
}

/// Deep-copy every variable of a `VarMap` into a fresh one.
///
/// Building a model from the copy yields weights that share no storage with
/// the source, which is what [`FrozenModel`] expects.
///
/// # Errors
///
/// Returns an error if the map lock is poisoned or a copy fails.
pub fn snapshot_varmap(varmap: &VarMap) -> Result<VarMap> {
    let snapshot = VarMap::new();
    {
        let source = varmap
            .data()
            .lock()
            .map_err(|_| IcarlError::invalid_config("source VarMap lock poisoned"))?;
        let mut target = snapshot
            .data()
            .lock()
            .map_err(|_| IcarlError::invalid_config("snapshot VarMap lock poisoned"))?;
        for (name, var) in source.iter() {
            let copy = var.as_tensor().detach().copy()?;
            target.insert(name.clone(), Var::from_tensor(&copy)?);
        }
    }
    Ok(snapshot)
}

/// Inference-mode, detached, row-normalized embeddings for one batch.
pub(crate) fn normalized_features<M: IncrementalModel>(model: &M, xs: &Tensor) -> Result<Tensor> {
    let features = model.features(xs, false)?.detach();
    l2_normalize_rows(&features)
}

/// Normalized embeddings for a subset of a dataset, stacked in index order.
pub(crate) fn embed_indices<M, D>(
    model: &M,
    dataset: &D,
    indices: &[usize],
    batch_size: usize,
) -> Result<Tensor>
where
    M: IncrementalModel,
    D: LabeledDataset + ?Sized,
{
    if indices.is_empty() {
        return Err(IcarlError::EmptyInput("no samples to embed".to_string()));
    }
    let mut chunks = Vec::new();
    for batch in BatchLoader::new(dataset, indices.to_vec(), batch_size) {
        let (inputs, _) = batch?;
        chunks.push(normalized_features(model, &inputs)?);
    }
    Ok(Tensor::cat(&chunks, 0)?)
}
