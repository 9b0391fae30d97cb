//! Nearest-mean-of-exemplars classification.

use candle_core::{DType, Tensor};

use crate::error::{IcarlError, Result};
use crate::means::ClassMeans;
use crate::model::{normalized_features, IncrementalModel};

/// Outcome of an NME evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NmeReport {
    /// Correctly classified samples.
    pub correct: usize,
    /// Samples evaluated.
    pub total: usize,
}

impl NmeReport {
    /// Fraction of correct predictions; zero for an empty report.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn accuracy(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.correct as f64 / self.total as f64
    }
}

/// Classifies by the highest dot product between a normalized embedding and
/// the stored class means.
#[derive(Debug, Clone, Copy)]
pub struct NearestMeanClassifier<'a> {
    means: &'a ClassMeans,
}

impl<'a> NearestMeanClassifier<'a> {
    /// Classifier over the given means.
    #[must_use]
    pub const fn new(means: &'a ClassMeans) -> Self {
        Self { means }
    }

    /// Predicted label per input row.
    ///
    /// # Errors
    ///
    /// Returns an error if the embedding width differs from the means.
    #[allow(clippy::cast_possible_truncation)]
    pub fn predict<M: IncrementalModel>(&self, model: &M, inputs: &Tensor) -> Result<Vec<u32>> {
        let features = normalized_features(model, inputs)?;
        let scores: Vec<Vec<f32>> = self
            .means
            .similarities(&features)?
            .to_dtype(DType::F32)?
            .to_vec2()?;
        Ok(scores.iter().map(|row| argmax(row) as u32).collect())
    }

    /// Accuracy over every `(inputs, labels)` batch.
    ///
    /// # Errors
    ///
    /// Returns [`IcarlError::EmptyInput`] when no sample is seen.
    pub fn evaluate<M, I>(&self, model: &M, batches: I) -> Result<NmeReport>
    where
        M: IncrementalModel,
        I: IntoIterator<Item = Result<(Tensor, Tensor)>>,
    {
        let mut report = NmeReport::default();
        for batch in batches {
            let (inputs, labels) = batch?;
            let predicted = self.predict(model, &inputs)?;
            let labels = labels.to_dtype(DType::U32)?.to_vec1::<u32>()?;
            if labels.len() != predicted.len() {
                return Err(IcarlError::shape_mismatch(&[predicted.len()], &[labels.len()]));
            }
            report.correct += predicted.iter().zip(&labels).filter(|(p, l)| p == l).count();
            report.total += labels.len();
        }
        if report.total == 0 {
            return Err(IcarlError::EmptyInput("no samples to evaluate".into()));
        }
        Ok(report)
    }
}

/// Index of the largest score; the first index wins ties.
fn argmax(scores: &[f32]) -> usize {
    let mut best = 0;
    for (i, score) in scores.iter().enumerate().skip(1) {
        if score.total_cmp(&scores[best]).is_gt() {
            best = i;
        }
    }
    best
}
