//! Bounded per-class exemplar memory and herding selection.
//!
//! The memory holds at most `floor(K / classes_seen)` dataset indices per
//! class. New classes are filled by herding (or uniformly at random); old
//! classes shrink by truncation, which keeps the herding prefix.

use candle_core::{DType, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;

use crate::data::{indices_of_label, LabeledDataset};
use crate::error::{IcarlError, Result};
use crate::means::ClassMeans;
use crate::model::{embed_indices, IncrementalModel};
use crate::norm::l2_normalize_rows;

/// Greedy herding over normalized embeddings.
///
/// At step `k` every unchosen row is scored by the distance between
/// `normalize((row + S) / (k + 1))` and `target`, where `S` sums the rows
/// chosen so far. The closest row wins; ties go to the lowest row index.
/// Returns row positions in selection order.
///
/// # Errors
///
/// - [`IcarlError::HerdingExhausted`] if `count` exceeds the number of rows
/// - [`IcarlError::ShapeMismatch`] if `target` is not a single `dim` vector
#[allow(clippy::cast_precision_loss)]
pub fn herding_selection(embeddings: &Tensor, target: &Tensor, count: usize) -> Result<Vec<usize>> {
    let (rows, dim) = embeddings.dims2()?;
    if count > rows {
        return Err(IcarlError::HerdingExhausted {
            requested: count,
            available: rows,
        });
    }
    if target.elem_count() != dim {
        return Err(IcarlError::shape_mismatch(&[dim], target.dims()));
    }

    let embeddings = embeddings.to_dtype(DType::F32)?;
    let target = target.to_dtype(DType::F32)?.reshape((1, dim))?;
    let mut running = Tensor::zeros((1, dim), DType::F32, embeddings.device())?;
    let mut chosen = vec![false; rows];
    let mut order = Vec::with_capacity(count);

    for k in 0..count {
        let candidates = (embeddings.broadcast_add(&running)? * (1.0 / (k + 1) as f64))?;
        let candidates = l2_normalize_rows(&candidates)?;
        let distances: Vec<f32> = candidates
            .broadcast_sub(&target)?
            .sqr()?
            .sum(1)?
            .sqrt()?
            .to_vec1()?;

        let pick = distances
            .iter()
            .enumerate()
            .filter(|(row, _)| !chosen[*row])
            .min_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(row, _)| row)
            .ok_or(IcarlError::HerdingExhausted {
                requested: count,
                available: k,
            })?;

        chosen[pick] = true;
        order.push(pick);
        running = (running + embeddings.narrow(0, pick, 1)?)?;
    }

    Ok(order)
}

/// Per-class exemplar lists under a global memory budget.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExemplarSet {
    budget: usize,
    classes: Vec<Vec<usize>>,
}

impl ExemplarSet {
    /// Empty memory with a budget of `budget` exemplars in total.
    #[must_use]
    pub const fn new(budget: usize) -> Self {
        Self {
            budget,
            classes: Vec::new(),
        }
    }

    /// Total memory budget K.
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Exemplars kept per class once `end_label` classes have been seen.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::InvalidConfig`] when `end_label == 0`.
    pub fn per_class_quota(&self, end_label: u32) -> Result<usize> {
        if end_label == 0 {
            return Err(IcarlError::invalid_config(
                "per-class quota needs at least one class",
            ));
        }
        Ok(self.budget / end_label as usize)
    }

    /// Exemplars of `label` in selection order; empty if none are stored.
    #[must_use]
    pub fn class(&self, label: u32) -> &[usize] {
        self.classes.get(label as usize).map_or(&[][..], Vec::as_slice)
    }

    /// All stored indices, class by class, each class in selection order.
    #[must_use]
    pub fn flattened(&self) -> Vec<usize> {
        self.classes.iter().flatten().copied().collect()
    }

    /// Number of stored exemplars across all classes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.classes.iter().map(Vec::len).sum()
    }

    /// Whether no exemplar is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of class slots (labels `0..num_classes`).
    #[must_use]
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Fill classes `[start, end)` by herding toward their means.
    ///
    /// Each class targets its row in `means` when one exists, otherwise the
    /// normalized mean of its own embeddings. Selected indices are appended.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::InsufficientSamples`] if any class in range has
    /// fewer samples than the quota; nothing is selected in that case.
    pub fn construct_herding<M, D>(
        &mut self,
        model: &M,
        dataset: &D,
        means: Option<&ClassMeans>,
        start: u32,
        end: u32,
        batch_size: usize,
    ) -> Result<()>
    where
        M: IncrementalModel,
        D: LabeledDataset + ?Sized,
    {
        let quota = self.per_class_quota(end)?;
        let pools = Self::class_pools(dataset, start, end, quota)?;
        self.ensure_slots(end);

        for (label, pool) in (start..end).zip(pools) {
            let embeddings = embed_indices(model, dataset, &pool, batch_size)?;
            let target = match means {
                Some(means) if means.contains(label) && means.dim() == embeddings.dims2()?.1 => {
                    means.mean(label)?
                }
                _ => l2_normalize_rows(&embeddings.mean_keepdim(0)?)?.squeeze(0)?,
            };
            let picks = herding_selection(&embeddings, &target, quota)?;
            self.classes[label as usize].extend(picks.into_iter().map(|row| pool[row]));
            tracing::debug!(label, selected = quota, available = pool.len(), "herding exemplars");
        }
        Ok(())
    }

    /// Fill classes `[start, end)` with a uniform random sample of each class.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::InsufficientSamples`] under the same conditions
    /// as [`ExemplarSet::construct_herding`].
    pub fn construct_random<D, R>(&mut self, dataset: &D, start: u32, end: u32, rng: &mut R) -> Result<()>
    where
        D: LabeledDataset + ?Sized,
        R: Rng + ?Sized,
    {
        let quota = self.per_class_quota(end)?;
        let pools = Self::class_pools(dataset, start, end, quota)?;
        self.ensure_slots(end);

        for (label, mut pool) in (start..end).zip(pools) {
            pool.shuffle(rng);
            pool.truncate(quota);
            self.classes[label as usize].extend(pool);
            tracing::debug!(label, selected = quota, "random exemplars");
        }
        Ok(())
    }

    /// Shrink every class below `start` to the quota implied by `end`.
    ///
    /// Classes at or above `start` are left alone. Repeating the call is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::InvalidConfig`] when `end == 0`.
    pub fn reduce(&mut self, start: u32, end: u32) -> Result<()> {
        let quota = self.per_class_quota(end)?;
        let limit = (start as usize).min(self.classes.len());
        for exemplars in &mut self.classes[..limit] {
            exemplars.truncate(quota);
        }
        tracing::debug!(classes = limit, quota, "exemplars reduced");
        Ok(())
    }

    fn ensure_slots(&mut self, end: u32) {
        let end = end as usize;
        if self.classes.len() < end {
            self.classes.resize_with(end, Vec::new);
        }
    }

    fn class_pools<D: LabeledDataset + ?Sized>(
        dataset: &D,
        start: u32,
        end: u32,
        quota: usize,
    ) -> Result<Vec<Vec<usize>>> {
        if quota == 0 {
            return Err(IcarlError::invalid_config(format!(
                "memory budget leaves no exemplar slot per class once {end} classes are seen"
            )));
        }
        (start..end)
            .map(|label| {
                let pool = indices_of_label(dataset, label);
                if pool.is_empty() || pool.len() < quota {
                    return Err(IcarlError::InsufficientSamples {
                        label,
                        requested: quota,
                        available: pool.len(),
                    });
                }
                Ok(pool)
            })
            .collect()
    }
}
