//! Configuration types for incremental class learning.
//!
//! This module provides:
//! - [`IcarlConfig`]: memory budget, class count, batching and selection settings
//! - [`LossConfig`]: which incremental loss formulation to use
//! - [`Reduction`], [`BceVariant`], [`OutputNormalization`], [`ExemplarSelection`]:
//!   closed enumerations for every switch, parsed once and never re-read per call

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{IcarlError, Result};

/// How per-row losses are reduced across a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Reduction {
    /// Sum of per-row losses divided by the batch size.
    #[default]
    Mean,
    /// Sum of per-row losses divided by batch size and number of classes.
    HardMean,
    /// Plain sum of per-row losses.
    Sum,
}

impl Reduction {
    /// Divisor applied to the summed loss of a `(batch, classes)` matrix.
    #[allow(clippy::cast_precision_loss)]
    #[must_use]
    pub fn divisor(self, batch: usize, classes: usize) -> f64 {
        match self {
            Self::Mean => batch as f64,
            Self::HardMean => (batch * classes) as f64,
            Self::Sum => 1.0,
        }
    }
}

impl FromStr for Reduction {
    type Err = IcarlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mean" => Ok(Self::Mean),
            "hardmean" => Ok(Self::HardMean),
            "sum" => Ok(Self::Sum),
            other => Err(IcarlError::invalid_config(format!(
                "unknown reduction '{other}' (expected mean, hardmean or sum)"
            ))),
        }
    }
}

impl fmt::Display for Reduction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Mean => "mean",
            Self::HardMean => "hardmean",
            Self::Sum => "sum",
        })
    }
}

/// Binary cross-entropy target layout.
///
/// Variant ids `1`, `2`, `3` are accepted from configuration files.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum BceVariant {
    /// Targets span the classes seen so far.
    One,
    /// Targets span every class of the whole sequence, pushing unseen
    /// classes toward low scores from the first step.
    #[default]
    Two,
    /// Like [`BceVariant::One`], summed and divided by a fixed constant.
    Three,
}

impl TryFrom<u8> for BceVariant {
    type Error = IcarlError;

    fn try_from(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Self::One),
            2 => Ok(Self::Two),
            3 => Ok(Self::Three),
            other => Err(IcarlError::invalid_config(format!(
                "unknown BCE variant {other} (expected 1, 2 or 3)"
            ))),
        }
    }
}

impl From<BceVariant> for u8 {
    fn from(variant: BceVariant) -> Self {
        match variant {
            BceVariant::One => 1,
            BceVariant::Two => 2,
            BceVariant::Three => 3,
        }
    }
}

/// Squashing applied to logits before the L2 distillation term.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputNormalization {
    /// Element-wise logistic sigmoid.
    #[default]
    Sigmoid,
    /// Softmax over the class dimension.
    Softmax,
}

impl FromStr for OutputNormalization {
    type Err = IcarlError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "sigmoid" => Ok(Self::Sigmoid),
            "softmax" => Ok(Self::Softmax),
            other => Err(IcarlError::invalid_config(format!(
                "unknown output normalization '{other}' (expected sigmoid or softmax)"
            ))),
        }
    }
}

/// Strategy used to pick exemplars for newly learned classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExemplarSelection {
    /// Greedy herding toward the class mean.
    #[default]
    Herding,
    /// Seeded uniform shuffle.
    Random,
}

/// Incremental loss formulation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LossConfig {
    /// Multi-label binary cross-entropy with distillation folded into the targets.
    Bce {
        /// Target layout.
        variant: BceVariant,
        /// Reduction of the criterion for variants one and two.
        reduction: Reduction,
    },
    /// Softmax cross-entropy plus an L2 distillation term on old classes.
    CeL2 {
        /// Squashing applied before comparing against the frozen model.
        normalization: OutputNormalization,
        /// Weight of the distillation term.
        distillation_weight: f64,
        /// Scale applied inside the L2 term.
        alpha: f64,
    },
}

impl Default for LossConfig {
    fn default() -> Self {
        Self::Bce {
            variant: BceVariant::Two,
            reduction: Reduction::HardMean,
        }
    }
}

impl LossConfig {
    /// Cross-entropy + L2 distillation with the default weight and scale.
    #[must_use]
    pub const fn ce_l2(normalization: OutputNormalization) -> Self {
        Self::CeL2 {
            normalization,
            distillation_weight: 1.0,
            alpha: 1e-4,
        }
    }

    /// Binary cross-entropy of the given variant with the default reduction.
    #[must_use]
    pub const fn bce(variant: BceVariant) -> Self {
        Self::Bce {
            variant,
            reduction: Reduction::HardMean,
        }
    }
}

/// Configuration for an incremental learning run.
///
/// # Example
///
/// ```
/// use icarl_rs::{IcarlConfig, ExemplarSelection};
///
/// let config = IcarlConfig::default()
///     .with_memory_budget(500)
///     .with_selection(ExemplarSelection::Random);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcarlConfig {
    /// Global exemplar budget `K` shared by every class seen so far.
    pub memory_budget: usize,

    /// Number of classes in the whole incremental sequence.
    pub total_classes: u32,

    /// Batch size used for feature extraction and training loaders.
    pub batch_size: usize,

    /// Exemplar selection strategy.
    #[serde(default)]
    pub selection: ExemplarSelection,

    /// Seed for shuffling loaders and random exemplar selection.
    pub seed: u64,

    /// Incremental loss formulation.
    #[serde(default)]
    pub loss: LossConfig,
}

impl Default for IcarlConfig {
    fn default() -> Self {
        Self {
            memory_budget: 2000,
            total_classes: 100,
            batch_size: 128,
            selection: ExemplarSelection::Herding,
            seed: 42,
            loss: LossConfig::default(),
        }
    }
}

impl IcarlConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::InvalidConfig`] describing the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.memory_budget == 0 {
            return Err(IcarlError::invalid_config("memory_budget must be > 0"));
        }
        if self.total_classes == 0 {
            return Err(IcarlError::invalid_config("total_classes must be > 0"));
        }
        if self.memory_budget < self.total_classes as usize {
            return Err(IcarlError::invalid_config(format!(
                "memory_budget ({}) must hold at least one exemplar for each of the {} classes",
                self.memory_budget, self.total_classes
            )));
        }
        if self.batch_size == 0 {
            return Err(IcarlError::invalid_config("batch_size must be > 0"));
        }
        if let LossConfig::CeL2 {
            distillation_weight,
            alpha,
            ..
        } = self.loss
        {
            if !(distillation_weight >= 0.0) {
                return Err(IcarlError::invalid_config(
                    "distillation_weight must be >= 0",
                ));
            }
            if !(alpha > 0.0) {
                return Err(IcarlError::invalid_config("alpha must be > 0"));
            }
        }
        Ok(())
    }

    /// Set the global exemplar budget.
    #[must_use]
    pub const fn with_memory_budget(mut self, budget: usize) -> Self {
        self.memory_budget = budget;
        self
    }

    /// Set the total number of classes in the sequence.
    #[must_use]
    pub const fn with_total_classes(mut self, classes: u32) -> Self {
        self.total_classes = classes;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the exemplar selection strategy.
    #[must_use]
    pub const fn with_selection(mut self, selection: ExemplarSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Set the random seed.
    #[must_use]
    pub const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the loss formulation.
    #[must_use]
    pub const fn with_loss(mut self, loss: LossConfig) -> Self {
        self.loss = loss;
        self
    }
}
