//! Integration tests for icarl-rs.
//!
//! These run full incremental steps on a small linear model: training with
//! distillation, exemplar bookkeeping, class means and NME evaluation.

use std::collections::HashSet;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Linear, Optimizer, VarBuilder, VarMap, SGD};
use icarl_rs::{
    snapshot_varmap, BatchLoader, BceVariant, ExemplarSelection, FrozenModel, IcarlConfig,
    IcarlLearner, IncrementalModel, LabeledDataset, LossConfig, OutputNormalization, StepClasses,
    TensorDataset,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const INPUT_DIM: usize = 8;
const HIDDEN_DIM: usize = 6;
const CLASSES: usize = 4;
const PER_CLASS: usize = 10;

/// Linear encoder followed by a linear classification head.
struct LinearClassifier {
    encoder: Linear,
    head: Linear,
}

impl LinearClassifier {
    fn new(vb: &VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            encoder: linear(INPUT_DIM, HIDDEN_DIM, vb.pp("encoder"))?,
            head: linear(HIDDEN_DIM, CLASSES, vb.pp("head"))?,
        })
    }
}

impl IncrementalModel for LinearClassifier {
    fn logits(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.head.forward(&self.features(xs, train)?)
    }

    fn features(&self, xs: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        self.encoder.forward(xs)
    }
}

fn build_classifier(varmap: &VarMap, device: &Device) -> LinearClassifier {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, device);
    LinearClassifier::new(&vb).unwrap()
}

/// Noisy clusters around scaled axis vectors, one cluster per class.
fn clustered_dataset(seed: u64, device: &Device) -> TensorDataset {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut values = Vec::with_capacity(CLASSES * PER_CLASS * INPUT_DIM);
    let mut targets = Vec::with_capacity(CLASSES * PER_CLASS);
    for class in 0..CLASSES {
        for _ in 0..PER_CLASS {
            for d in 0..INPUT_DIM {
                let center = if d == class * 2 { 3.0 } else { 0.0 };
                values.push(center + rng.gen_range(-0.3f32..0.3));
            }
            targets.push(u32::try_from(class).unwrap());
        }
    }
    let inputs = Tensor::from_vec(values, (CLASSES * PER_CLASS, INPUT_DIM), device).unwrap();
    TensorDataset::new(inputs, targets).unwrap()
}

fn test_loader(dataset: &TensorDataset, end: u32) -> BatchLoader<'_, TensorDataset> {
    let indices = icarl_rs::data::indices_in_range(dataset, 0, end);
    BatchLoader::new(dataset, indices, 16)
}

fn run_two_steps(config: IcarlConfig) -> (IcarlLearner, TensorDataset) {
    let device = Device::Cpu;
    let train = clustered_dataset(1, &device);
    let test = clustered_dataset(2, &device);

    let varmap = VarMap::new();
    let model = build_classifier(&varmap, &device);
    let mut optimizer = SGD::new(varmap.all_vars(), 0.05).unwrap();
    let mut learner = IcarlLearner::new(config).unwrap();
    let mut frozen: Option<FrozenModel<LinearClassifier>> = None;

    for (start, end) in [(0u32, 2u32), (2, 4)] {
        let step = StepClasses::new(start, end);
        for epoch in 0..3 {
            let loader = learner.train_loader(&train, start, end);
            let summary = learner
                .update_representation(&model, frozen.as_ref(), &mut optimizer, loader, &step, epoch)
                .unwrap();
            assert!(summary.mean_loss.is_finite());
            assert!(summary.batches > 0);
        }

        learner.consolidate_step(&model, &train, start, end).unwrap();
        let report = learner.eval_model_nme(&model, test_loader(&test, end)).unwrap();
        assert!((0.0..=1.0).contains(&report.accuracy()));
        assert_eq!(report.total, end as usize * PER_CLASS);

        let snapshot = snapshot_varmap(&varmap).unwrap();
        frozen = Some(FrozenModel::new(build_classifier(&snapshot, &device)));
    }

    (learner, train)
}

#[test]
fn test_two_step_run_with_bce() {
    let config = IcarlConfig::default()
        .with_memory_budget(8)
        .with_total_classes(4)
        .with_batch_size(5)
        .with_loss(LossConfig::bce(BceVariant::Two));
    let (learner, train) = run_two_steps(config);

    let exemplars = learner.exemplars();
    for label in 0..4 {
        let class = exemplars.class(label);
        assert_eq!(class.len(), 2, "class {label}");
        assert!(class.iter().all(|&i| train.targets()[i] == label));
    }

    let flattened = learner.flattened_exemplars();
    let unique: HashSet<_> = flattened.iter().copied().collect();
    assert_eq!(unique.len(), flattened.len());
    assert_eq!(learner.means().unwrap().num_classes(), 4);
}

#[test]
fn test_two_step_run_with_ce_l2_and_random_selection() {
    let config = IcarlConfig::default()
        .with_memory_budget(12)
        .with_total_classes(4)
        .with_batch_size(8)
        .with_selection(ExemplarSelection::Random)
        .with_loss(LossConfig::ce_l2(OutputNormalization::Softmax));
    let (learner, _) = run_two_steps(config);
    assert_eq!(learner.exemplars().len(), 12);
}

#[test]
fn test_frozen_snapshot_survives_training() {
    let device = Device::Cpu;
    let train = clustered_dataset(3, &device);
    let varmap = VarMap::new();
    let model = build_classifier(&varmap, &device);
    let frozen = FrozenModel::new(build_classifier(&snapshot_varmap(&varmap).unwrap(), &device));

    let (inputs, _) = train.gather(&[0, 15, 30]).unwrap();
    let before: Vec<Vec<f32>> = frozen.logits(&inputs).unwrap().to_vec2().unwrap();

    let mut optimizer = SGD::new(varmap.all_vars(), 0.5).unwrap();
    let learner = IcarlLearner::new(IcarlConfig::default().with_total_classes(4).with_batch_size(8)).unwrap();
    let loader = BatchLoader::new(&train, (0..20).collect(), 8);
    learner
        .update_representation(&model, None, &mut optimizer, loader, &StepClasses::new(0, 2), 0)
        .unwrap();

    let after: Vec<Vec<f32>> = frozen.logits(&inputs).unwrap().to_vec2().unwrap();
    assert_eq!(before, after);

    let live: Vec<Vec<f32>> = model.logits(&inputs, false).unwrap().to_vec2().unwrap();
    assert_ne!(before, live);
}

#[test]
fn test_config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("icarl.yaml");

    let config = IcarlConfig::default()
        .with_memory_budget(500)
        .with_seed(7)
        .with_loss(LossConfig::ce_l2(OutputNormalization::Softmax));
    config.to_file(&path).unwrap();

    let loaded = IcarlConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);
}

#[test]
fn test_config_file_rejects_invalid_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.yaml");
    std::fs::write(
        &path,
        "memory_budget: 0\ntotal_classes: 10\nbatch_size: 4\nseed: 1\n",
    )
    .unwrap();
    let loaded = IcarlConfig::from_file(&path).unwrap();
    assert!(loaded.validate().is_err());
    assert!(IcarlLearner::new(loaded).is_err());
}
