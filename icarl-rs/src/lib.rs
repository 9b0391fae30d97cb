//! # icarl-rs
//!
//! Class-incremental learning with iCaRL (incremental classifier and
//! representation learning) on top of candle.
//!
//! Classes arrive in groups. After each group the learner keeps a bounded
//! memory of representative samples per class, summarizes every class by the
//! normalized mean of its embeddings and classifies by the nearest mean.
//! Training on a new group mixes new-class samples with the stored memory and
//! distills the previous model's outputs on old classes.
//!
//! ## Quick Start
//!
//! ```ignore
//! use icarl_rs::{FrozenModel, IcarlConfig, IcarlLearner, StepClasses, snapshot_varmap};
//!
//! let mut learner = IcarlLearner::new(IcarlConfig::default())?;
//! let mut frozen = None;
//!
//! for (start, end) in [(0, 10), (10, 20)] {
//!     let step = StepClasses::new(start, end);
//!     for epoch in 0..epochs {
//!         let loader = learner.train_loader(&train, start, end);
//!         learner.update_representation(&model, frozen.as_ref(), &mut opt, loader, &step, epoch)?;
//!     }
//!     learner.consolidate_step(&model, &train, start, end)?;
//!     let report = learner.eval_model_nme(&model, test_loader(end))?;
//!
//!     frozen = Some(FrozenModel::new(build_model(&snapshot_varmap(&varmap)?)?));
//! }
//! # Ok::<(), icarl_rs::IcarlError>(())
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Run configuration and the enumerations behind every switch
//! - [`data`]: Dataset seam and batch loading
//! - [`error`]: Error type and result alias
//! - [`evaluator`]: Nearest-mean-of-exemplars classification
//! - [`exemplar`]: Exemplar memory and herding selection
//! - [`learner`]: The engine tying the pieces together
//! - [`loss`]: L2, BCE and CE+L2 incremental losses
//! - [`means`]: Per-class mean embeddings
//! - [`model`]: Model seam and frozen snapshots
//! - [`norm`]: Row-wise L2 normalization

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod data;
pub mod error;
pub mod evaluator;
pub mod exemplar;
pub mod learner;
pub mod loss;
pub mod means;
pub mod model;
pub mod norm;

pub use config::{BceVariant, ExemplarSelection, IcarlConfig, LossConfig, OutputNormalization, Reduction};
pub use data::{BatchLoader, LabeledDataset, TensorDataset};
pub use error::{IcarlError, Result};
pub use evaluator::{NearestMeanClassifier, NmeReport};
pub use exemplar::{herding_selection, ExemplarSet};
pub use learner::{EpochSummary, IcarlLearner};
pub use loss::{BceDistillation, CeL2Distillation, IncrementalLoss, L2Loss, StepClasses};
pub use means::ClassMeans;
pub use model::{snapshot_varmap, FrozenModel, IncrementalModel};
pub use norm::l2_normalize_rows;
