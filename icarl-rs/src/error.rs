//! Error types for incremental class learning.

use thiserror::Error;

/// Result type alias for icarl-rs operations.
pub type Result<T> = std::result::Result<T, IcarlError>;

/// Errors that can occur while selecting exemplars, computing class means,
/// evaluating or computing incremental losses.
#[derive(Debug, Error)]
pub enum IcarlError {
    /// Invalid configuration parameter.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Shape mismatch in tensor operations.
    #[error("shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// A class below the ending label had no samples when computing means.
    #[error("class {label} has no samples to average")]
    EmptyClass {
        /// Label of the empty class.
        label: u32,
    },

    /// Exemplar selection asked for more samples than a class holds.
    #[error("class {label}: requested {requested} exemplars but only {available} samples exist")]
    InsufficientSamples {
        /// Label of the class being populated.
        label: u32,
        /// Per-class exemplar quota.
        requested: usize,
        /// Number of samples of this class in the dataset.
        available: usize,
    },

    /// Herding ran out of unchosen candidates.
    #[error("herding exhausted: requested {requested} picks from {available} candidates")]
    HerdingExhausted {
        /// Number of picks requested.
        requested: usize,
        /// Number of candidate embeddings.
        available: usize,
    },

    /// A label fell outside the range the operation covers.
    #[error("label {label} out of range (limit {limit})")]
    LabelOutOfRange {
        /// Offending label.
        label: u32,
        /// Exclusive upper bound.
        limit: u32,
    },

    /// A dataset index past the last sample.
    #[error("sample index {index} out of range for dataset of {len} samples")]
    IndexOutOfRange {
        /// Offending index.
        index: usize,
        /// Number of samples in the dataset.
        len: usize,
    },

    /// Distillation was requested without a frozen previous-step model.
    #[error("step starting at label {start_label} needs a frozen previous-step model")]
    MissingFrozenModel {
        /// First label of the current step.
        start_label: u32,
    },

    /// Empty input where non-empty was required.
    #[error("empty input: {0}")]
    EmptyInput(String),

    /// Candle tensor operation error.
    #[error("tensor error: {0}")]
    Tensor(#[from] candle_core::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML (de)serialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl IcarlError {
    /// Create an invalid config error.
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create a shape mismatch error from two dimension slices.
    #[must_use]
    pub fn shape_mismatch(expected: &[usize], actual: &[usize]) -> Self {
        Self::ShapeMismatch {
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}
