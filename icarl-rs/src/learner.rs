//! The incremental learning engine.
//!
//! [`IcarlLearner`] owns every piece of state that survives between steps:
//! the exemplar memory, the class means and the seeded RNG. The trainable
//! model, its optimizer and the frozen snapshot stay with the caller.
//!
//! A step over classes `[start, end)` runs:
//!
//! 1. [`IcarlLearner::update_representation`] on new-class samples plus the
//!    stored exemplars, for as many epochs as the caller wants
//! 2. [`IcarlLearner::consolidate_step`] to shrink old exemplars, recompute
//!    means, select exemplars for the new classes and recompute means over
//!    the final memory
//! 3. [`IcarlLearner::eval_model_nme`] on held-out data

use candle_core::{DType, Tensor};
use candle_nn::Optimizer;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::config::{ExemplarSelection, IcarlConfig};
use crate::data::{indices_in_range, BatchLoader, LabeledDataset};
use crate::error::{IcarlError, Result};
use crate::evaluator::{NearestMeanClassifier, NmeReport};
use crate::exemplar::ExemplarSet;
use crate::loss::{IncrementalLoss, StepClasses};
use crate::means::ClassMeans;
use crate::model::{FrozenModel, IncrementalModel};

/// Losses observed during one pass of [`IcarlLearner::update_representation`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochSummary {
    /// Batches processed.
    pub batches: usize,
    /// Samples processed.
    pub samples: usize,
    /// Average of the per-batch losses.
    pub mean_loss: f64,
    /// Loss of the final batch.
    pub last_loss: f64,
}

/// Incremental classifier-and-representation learner.
#[derive(Debug)]
pub struct IcarlLearner {
    config: IcarlConfig,
    loss: IncrementalLoss,
    exemplars: ExemplarSet,
    means: Option<ClassMeans>,
    rng: ChaCha8Rng,
}

impl IcarlLearner {
    /// Create a learner with empty memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: IcarlConfig) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            memory_budget = config.memory_budget,
            total_classes = config.total_classes,
            selection = ?config.selection,
            loss = ?config.loss,
            "iCaRL learner created"
        );
        Ok(Self {
            loss: IncrementalLoss::from_config(&config),
            exemplars: ExemplarSet::new(config.memory_budget),
            means: None,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
        })
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &IcarlConfig {
        &self.config
    }

    /// Resolved loss formulation.
    #[must_use]
    pub const fn loss(&self) -> &IncrementalLoss {
        &self.loss
    }

    /// Stored exemplars.
    #[must_use]
    pub const fn exemplars(&self) -> &ExemplarSet {
        &self.exemplars
    }

    /// Most recently computed class means, if any.
    #[must_use]
    pub const fn means(&self) -> Option<&ClassMeans> {
        self.means.as_ref()
    }

    /// Every stored exemplar index, class by class.
    #[must_use]
    pub fn flattened_exemplars(&self) -> Vec<usize> {
        self.exemplars.flattened()
    }

    /// Samples of classes `[start, end)` followed by the stored exemplars.
    #[must_use]
    pub fn training_indices<D: LabeledDataset + ?Sized>(&self, dataset: &D, start: u32, end: u32) -> Vec<usize> {
        let mut indices = indices_in_range(dataset, start, end);
        indices.extend(self.exemplars.flattened());
        indices
    }

    /// Shuffled loader over [`IcarlLearner::training_indices`].
    pub fn train_loader<'a, D: LabeledDataset + ?Sized>(
        &mut self,
        dataset: &'a D,
        start: u32,
        end: u32,
    ) -> BatchLoader<'a, D> {
        let indices = self.training_indices(dataset, start, end);
        BatchLoader::shuffled(dataset, indices, self.config.batch_size, &mut self.rng)
    }

    /// One training pass: compute the incremental loss on every batch and
    /// take an optimizer step on it.
    ///
    /// `frozen` must be present for any step with `start_label > 0`.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::EmptyInput`] if no batch is yielded, or any
    /// loss or optimizer error.
    #[allow(clippy::cast_precision_loss)]
    pub fn update_representation<M, O, I>(
        &self,
        model: &M,
        frozen: Option<&FrozenModel<M>>,
        optimizer: &mut O,
        batches: I,
        step: &StepClasses,
        current_step: usize,
    ) -> Result<EpochSummary>
    where
        M: IncrementalModel,
        O: Optimizer,
        I: IntoIterator<Item = Result<(Tensor, Tensor)>>,
    {
        step.validate()?;
        if !step.is_first() && frozen.is_none() {
            return Err(IcarlError::MissingFrozenModel {
                start_label: step.start_label,
            });
        }

        let mut summary = EpochSummary {
            batches: 0,
            samples: 0,
            mean_loss: 0.0,
            last_loss: 0.0,
        };
        let mut total = 0.0;

        for batch in batches {
            let (inputs, labels) = batch?;
            let loss = self.loss.forward(model, frozen, &inputs, &labels, step)?;
            let value = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;

            if current_step == 0 && summary.batches == 0 {
                tracing::info!(loss = value, "initial loss");
            }

            optimizer.backward_step(&loss)?;

            summary.batches += 1;
            summary.samples += inputs.dim(0)?;
            summary.last_loss = value;
            total += value;
            tracing::debug!(
                step = current_step,
                batch = summary.batches,
                loss = value,
                "representation update"
            );
        }

        if summary.batches == 0 {
            return Err(IcarlError::EmptyInput("no training batches".into()));
        }
        summary.mean_loss = total / summary.batches as f64;
        if !summary.mean_loss.is_finite() {
            tracing::warn!(step = current_step, mean_loss = summary.mean_loss, "non-finite loss");
        }
        Ok(summary)
    }

    /// Recompute class means for labels `[0, ending_label)` from scratch.
    ///
    /// # Errors
    ///
    /// See [`ClassMeans::compute`].
    pub fn compute_means<M, I>(&mut self, model: &M, batches: I, ending_label: u32) -> Result<&ClassMeans>
    where
        M: IncrementalModel,
        I: IntoIterator<Item = Result<(Tensor, Tensor)>>,
    {
        let means = ClassMeans::compute(model, batches, ending_label)?;
        Ok(self.means.insert(means))
    }

    /// Select exemplars for classes `[start, end)` with the configured
    /// strategy.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::InsufficientSamples`] if a class is too small.
    pub fn construct_exemplars<M, D>(&mut self, model: &M, dataset: &D, start: u32, end: u32) -> Result<()>
    where
        M: IncrementalModel,
        D: LabeledDataset + ?Sized,
    {
        match self.config.selection {
            ExemplarSelection::Herding => self.exemplars.construct_herding(
                model,
                dataset,
                self.means.as_ref(),
                start,
                end,
                self.config.batch_size,
            ),
            ExemplarSelection::Random => self.exemplars.construct_random(dataset, start, end, &mut self.rng),
        }
    }

    /// Shrink classes below `start` to the quota for `end` classes.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::InvalidConfig`] when `end == 0`.
    pub fn reduce_exemplars(&mut self, start: u32, end: u32) -> Result<()> {
        self.exemplars.reduce(start, end)
    }

    /// Nearest-mean-of-exemplars accuracy over `batches`.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::EmptyInput`] if no means have been computed or
    /// no sample is evaluated.
    pub fn eval_model_nme<M, I>(&self, model: &M, batches: I) -> Result<NmeReport>
    where
        M: IncrementalModel,
        I: IntoIterator<Item = Result<(Tensor, Tensor)>>,
    {
        let means = self
            .means
            .as_ref()
            .ok_or_else(|| IcarlError::EmptyInput("class means have not been computed".into()))?;
        let report = NearestMeanClassifier::new(means).evaluate(model, batches)?;
        tracing::info!(
            correct = report.correct,
            total = report.total,
            accuracy = report.accuracy(),
            "NME evaluation"
        );
        Ok(report)
    }

    /// Post-training bookkeeping for classes `[start, end)`.
    ///
    /// Reduces old exemplars, computes means over new-class samples and the
    /// remaining exemplars, selects exemplars for the new classes, then
    /// recomputes means over the exemplar pool alone.
    ///
    /// # Errors
    ///
    /// Propagates errors from every stage.
    pub fn consolidate_step<M, D>(&mut self, model: &M, dataset: &D, start: u32, end: u32) -> Result<()>
    where
        M: IncrementalModel,
        D: LabeledDataset + ?Sized,
    {
        let batch_size = self.config.batch_size;
        self.reduce_exemplars(start, end)?;

        let indices = self.training_indices(dataset, start, end);
        self.compute_means(model, BatchLoader::new(dataset, indices, batch_size), end)?;

        self.construct_exemplars(model, dataset, start, end)?;

        let pool = self.flattened_exemplars();
        self.compute_means(model, BatchLoader::new(dataset, pool, batch_size), end)?;

        tracing::info!(start, end, exemplars = self.exemplars.len(), "step consolidated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LossConfig, OutputNormalization};
    use crate::data::TensorDataset;
    use crate::loss::tests::Identity;
    use candle_core::Device;

    /// Optimizer stand-in that counts steps.
    struct CountingOptimizer {
        steps: usize,
    }

    impl Optimizer for CountingOptimizer {
        type Config = ();

        fn new(_vars: Vec<candle_core::Var>, _config: ()) -> candle_core::Result<Self> {
            Ok(Self { steps: 0 })
        }

        fn step(&mut self, _grads: &candle_core::backprop::GradStore) -> candle_core::Result<()> {
            self.steps += 1;
            Ok(())
        }

        fn learning_rate(&self) -> f64 {
            0.0
        }

        fn set_learning_rate(&mut self, _lr: f64) {}
    }

    fn dataset(device: &Device) -> TensorDataset {
        let inputs = Tensor::new(
            &[
                [3.0f32, 0.1, 0.0, 0.0],
                [2.5, 0.0, 0.2, 0.0],
                [0.1, 3.0, 0.0, 0.0],
                [0.0, 2.0, 0.1, 0.0],
                [0.0, 0.1, 3.0, 0.0],
                [0.2, 0.0, 2.0, 0.0],
                [0.0, 0.0, 0.1, 3.0],
                [0.1, 0.0, 0.0, 2.5],
            ],
            device,
        )
        .unwrap();
        TensorDataset::new(inputs, vec![0, 0, 1, 1, 2, 2, 3, 3]).unwrap()
    }

    fn config() -> IcarlConfig {
        IcarlConfig::default()
            .with_memory_budget(4)
            .with_total_classes(4)
            .with_batch_size(3)
            .with_loss(LossConfig::ce_l2(OutputNormalization::Softmax))
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        assert!(IcarlLearner::new(config().with_memory_budget(0)).is_err());
    }

    #[test]
    fn test_training_indices_append_exemplars() {
        let device = Device::Cpu;
        let data = dataset(&device);
        let mut learner = IcarlLearner::new(config()).unwrap();
        assert_eq!(learner.training_indices(&data, 0, 2), vec![0, 1, 2, 3]);

        learner.consolidate_step(&Identity, &data, 0, 2).unwrap();
        assert_eq!(learner.exemplars().len(), 4);
        let indices = learner.training_indices(&data, 2, 4);
        assert_eq!(indices[..4], [4, 5, 6, 7]);
        let mut stored = indices[4..].to_vec();
        stored.sort_unstable();
        assert_eq!(stored, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_consolidate_steps() {
        let device = Device::Cpu;
        let data = dataset(&device);
        let mut learner = IcarlLearner::new(config()).unwrap();

        learner.consolidate_step(&Identity, &data, 0, 2).unwrap();
        assert_eq!(learner.means().unwrap().num_classes(), 2);

        learner.consolidate_step(&Identity, &data, 2, 4).unwrap();
        for label in 0..4 {
            assert_eq!(learner.exemplars().class(label).len(), 1);
        }
        assert_eq!(learner.means().unwrap().num_classes(), 4);

        let report = learner
            .eval_model_nme(&Identity, BatchLoader::new(&data, (0..8).collect(), 3))
            .unwrap();
        assert_eq!(report.total, 8);
        assert!((0.0..=1.0).contains(&report.accuracy()));
    }

    #[test]
    fn test_random_selection_uses_seed() {
        let device = Device::Cpu;
        let data = dataset(&device);
        let run = || {
            let mut learner =
                IcarlLearner::new(config().with_selection(ExemplarSelection::Random)).unwrap();
            learner.construct_exemplars(&Identity, &data, 0, 4).unwrap();
            learner.flattened_exemplars()
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_update_representation_summary() {
        let device = Device::Cpu;
        let data = dataset(&device);
        let mut learner = IcarlLearner::new(config()).unwrap();
        let mut optimizer = CountingOptimizer { steps: 0 };

        let loader = learner.train_loader(&data, 0, 2);
        let step = StepClasses::new(0, 2);
        let summary = learner
            .update_representation(&Identity, None, &mut optimizer, loader, &step, 0)
            .unwrap();

        assert_eq!(summary.batches, 2);
        assert_eq!(summary.samples, 4);
        assert_eq!(optimizer.steps, 2);
        assert!(summary.mean_loss.is_finite());
    }

    #[test]
    fn test_update_representation_requires_frozen_model() {
        let device = Device::Cpu;
        let data = dataset(&device);
        let learner = IcarlLearner::new(config()).unwrap();
        let mut optimizer = CountingOptimizer { steps: 0 };

        let loader = BatchLoader::new(&data, vec![4, 5], 2);
        let result =
            learner.update_representation(&Identity, None, &mut optimizer, loader, &StepClasses::new(2, 4), 1);
        assert!(matches!(result, Err(IcarlError::MissingFrozenModel { start_label: 2 })));
        assert_eq!(optimizer.steps, 0);
    }

    #[test]
    fn test_eval_without_means() {
        let device = Device::Cpu;
        let data = dataset(&device);
        let learner = IcarlLearner::new(config()).unwrap();
        assert!(matches!(
            learner.eval_model_nme(&Identity, BatchLoader::new(&data, vec![0], 1)),
            Err(IcarlError::EmptyInput(_))
        ));
    }
}
