//! iCaRL on synthetic Gaussian clusters.
//!
//! This example demonstrates:
//! - Loading or building an [`IcarlConfig`]
//! - Training a small MLP class group by class group with distillation
//! - Exemplar bookkeeping and nearest-mean evaluation after every step
//!
//! Usage:
//!   cargo run --example synthetic_run --release -- --classes-per-step 2
//!
//! Logging is controlled with `RUST_LOG`, e.g. `RUST_LOG=icarl_rs=debug`.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, AdamW, Linear, Optimizer, ParamsAdamW, VarBuilder, VarMap};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use icarl_rs::data::indices_in_range;
use icarl_rs::{
    snapshot_varmap, BatchLoader, FrozenModel, IcarlConfig, IcarlLearner, IncrementalModel,
    StepClasses, TensorDataset,
};

#[derive(Parser)]
#[command(name = "synthetic_run")]
#[command(about = "Class-incremental training on synthetic clusters")]
struct Args {
    /// Optional YAML configuration; CLI sizes override its class count
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of classes in the whole sequence
    #[arg(long, default_value_t = 10)]
    total_classes: u32,
    /// Classes introduced per incremental step
    #[arg(long, default_value_t = 2)]
    classes_per_step: u32,
    /// Training samples per class
    #[arg(long, default_value_t = 60)]
    samples_per_class: usize,
    /// Epochs per step
    #[arg(long, default_value_t = 5)]
    epochs: usize,
    /// AdamW learning rate
    #[arg(long, default_value_t = 1e-2)]
    lr: f64,
    /// Exemplar memory budget
    #[arg(long, default_value_t = 200)]
    memory: usize,
}

const INPUT_DIM: usize = 32;
const HIDDEN_DIM: usize = 16;

/// Two-layer perceptron; the hidden activations are the embedding.
struct Mlp {
    encoder: Linear,
    head: Linear,
}

impl Mlp {
    fn new(vb: &VarBuilder, classes: usize) -> candle_core::Result<Self> {
        Ok(Self {
            encoder: linear(INPUT_DIM, HIDDEN_DIM, vb.pp("encoder"))?,
            head: linear(HIDDEN_DIM, classes, vb.pp("head"))?,
        })
    }
}

impl IncrementalModel for Mlp {
    fn logits(&self, xs: &Tensor, train: bool) -> candle_core::Result<Tensor> {
        self.head.forward(&self.features(xs, train)?)
    }

    fn features(&self, xs: &Tensor, _train: bool) -> candle_core::Result<Tensor> {
        self.encoder.forward(xs)?.relu()
    }
}

/// Samples scattered around one random center per class.
fn clusters(centers: &Tensor, per_class: usize, device: &Device) -> anyhow::Result<TensorDataset> {
    let (classes, dim) = centers.dims2()?;
    let mut rows = Vec::with_capacity(classes);
    let mut targets = Vec::with_capacity(classes * per_class);
    for class in 0..classes {
        let center = centers.narrow(0, class, 1)?.broadcast_as((per_class, dim))?;
        let noise = Tensor::randn(0.0f32, 0.5, (per_class, dim), device)?;
        rows.push((center + noise)?);
        targets.extend(std::iter::repeat(u32::try_from(class)?).take(per_class));
    }
    Ok(TensorDataset::new(Tensor::cat(&rows, 0)?, targets)?)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    anyhow::ensure!(args.classes_per_step > 0, "classes-per-step must be positive");

    #[cfg(feature = "cuda")]
    let device = Device::new_cuda(0)?;
    #[cfg(not(feature = "cuda"))]
    let device = Device::Cpu;

    let config = match &args.config {
        Some(path) => IcarlConfig::from_file(path)?,
        None => IcarlConfig::default().with_memory_budget(args.memory),
    }
    .with_total_classes(args.total_classes);
    let batch_size = config.batch_size;
    let mut learner = IcarlLearner::new(config)?;

    let total = args.total_classes as usize;
    let centers = (Tensor::randn(0.0f32, 1.0, (total, INPUT_DIM), &device)? * 3.0)?;
    let train = clusters(&centers, args.samples_per_class, &device)?;
    let test = clusters(&centers, args.samples_per_class / 3 + 1, &device)?;

    let varmap = VarMap::new();
    let model = Mlp::new(&VarBuilder::from_varmap(&varmap, DType::F32, &device), total)?;
    let params = ParamsAdamW {
        lr: args.lr,
        ..Default::default()
    };
    let mut optimizer = AdamW::new(varmap.all_vars(), params)?;
    let mut frozen: Option<FrozenModel<Mlp>> = None;

    let started = Instant::now();
    let mut start = 0;
    while start < args.total_classes {
        let end = (start + args.classes_per_step).min(args.total_classes);
        let step = StepClasses::new(start, end);

        for epoch in 0..args.epochs {
            let loader = learner.train_loader(&train, start, end);
            let summary =
                learner.update_representation(&model, frozen.as_ref(), &mut optimizer, loader, &step, epoch)?;
            tracing::info!(start, end, epoch, mean_loss = summary.mean_loss, "epoch done");
        }

        learner.consolidate_step(&model, &train, start, end)?;
        let held_out = BatchLoader::new(&test, indices_in_range(&test, 0, end), batch_size);
        let report = learner.eval_model_nme(&model, held_out)?;
        println!(
            "classes [0, {end:>3}): NME accuracy {:>6.2}% ({}/{}), {} exemplars",
            report.accuracy() * 100.0,
            report.correct,
            report.total,
            learner.exemplars().len()
        );

        let snapshot = snapshot_varmap(&varmap)?;
        frozen = Some(FrozenModel::new(Mlp::new(
            &VarBuilder::from_varmap(&snapshot, DType::F32, &device),
            total,
        )?));
        start = end;
    }

    println!("Finished in {:.1}s", started.elapsed().as_secs_f64());
    Ok(())
}
