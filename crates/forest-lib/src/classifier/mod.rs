//! Forest condition classification
//!
//! A [`ScoringModel`] maps a preprocessed tensor to one raw score per label.
//! [`Classifier`] owns the model and the label set and is the only place
//! scores become a [`ClassificationResult`]: it checks the output length,
//! applies softmax to logits and validates declared probabilities.

mod onnx;
mod vegetation;

pub use onnx::{file_sha256, OnnxModel};
pub use vegetation::VegetationIndexModel;

use crate::error::InferenceError;
use crate::models::{ClassificationResult, Coordinate, LabelSet};
use crate::preprocess::{ImageTensor, PreprocessConfig};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Inference slower than this is logged
const SLOW_INFERENCE: Duration = Duration::from_secs(2);

/// What a model's raw output means
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScoreKind {
    /// Unbounded scores; softmax is applied
    #[default]
    Logits,
    /// Already a distribution; validated, never re-normalised
    Probabilities,
}

/// Trait for scoring model implementations
pub trait ScoringModel: Send + Sync {
    /// Raw scores for one input, in label order
    fn score(&self, input: &ImageTensor) -> Result<Vec<f64>, InferenceError>;

    /// Meaning of the values returned by `score`
    fn score_kind(&self) -> ScoreKind;

    /// Number of scores produced, when known before running
    fn output_len(&self) -> Option<usize>;

    /// Identifier recorded with each result
    fn name(&self) -> &str;

    /// Label each output position stands for, when the model fixes them
    fn labels(&self) -> Option<&[&str]> {
        None
    }
}

/// Which scoring model to load
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClassifierKind {
    #[default]
    VegetationIndex,
    Onnx,
}

/// Classifier settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub kind: ClassifierKind,
    pub model_path: Option<PathBuf>,
    /// Hex SHA-256 the model file must match
    pub model_sha256: Option<String>,
    pub output: ScoreKind,
    pub labels: LabelSet,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            kind: ClassifierKind::VegetationIndex,
            model_path: None,
            model_sha256: None,
            output: ScoreKind::Logits,
            labels: LabelSet::default(),
        }
    }
}

/// Inference statistics
#[derive(Debug, Clone)]
pub struct InferenceStats {
    pub total_inferences: u64,
    pub slow_inferences: u64,
    pub failed_inferences: u64,
}

/// Model plus label set
pub struct Classifier {
    model: Box<dyn ScoringModel>,
    labels: LabelSet,
    /// Output position feeding each configured label, when they differ
    output_index: Option<Vec<usize>>,
    inference_count: AtomicU64,
    slow_inference_count: AtomicU64,
    failure_count: AtomicU64,
}

impl Classifier {
    /// Pair a model with its labels, rejecting a known length mismatch up front
    ///
    /// A model that names its outputs may be configured with those labels in
    /// any order; results follow the configured order.
    pub fn new(model: Box<dyn ScoringModel>, labels: LabelSet) -> Result<Self, InferenceError> {
        if let Some(len) = model.output_len() {
            if len != labels.len() {
                return Err(InferenceError::OutputLength {
                    expected: labels.len(),
                    actual: len,
                });
            }
        }
        let output_index = match model.labels() {
            Some(declared) => output_order(declared, &labels, model.name())?,
            None => None,
        };
        Ok(Self {
            model,
            labels,
            output_index,
            inference_count: AtomicU64::new(0),
            slow_inference_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
        })
    }

    /// Build the configured classifier
    pub fn from_config(
        config: &ClassifierConfig,
        preprocess: &PreprocessConfig,
    ) -> Result<Self, InferenceError> {
        let model: Box<dyn ScoringModel> = match config.kind {
            ClassifierKind::VegetationIndex => {
                Box::new(VegetationIndexModel::new(preprocess.mean, preprocess.std))
            }
            ClassifierKind::Onnx => {
                let path = config.model_path.as_deref().ok_or_else(|| {
                    InferenceError::Model("classifier.model_path is required for onnx".into())
                })?;
                let size = preprocess.target_size as usize;
                Box::new(OnnxModel::load(
                    path,
                    [1, 3, size, size],
                    config.output,
                    config.model_sha256.as_deref(),
                )?)
            }
        };
        Self::new(model, config.labels.clone())
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Score `input` and turn the scores into a result for the given site and day
    pub fn classify(
        &self,
        input: &ImageTensor,
        date: NaiveDate,
        coordinate: Coordinate,
    ) -> Result<ClassificationResult, InferenceError> {
        let result = self.classify_inner(input, date, coordinate);
        if result.is_err() {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    fn classify_inner(
        &self,
        input: &ImageTensor,
        date: NaiveDate,
        coordinate: Coordinate,
    ) -> Result<ClassificationResult, InferenceError> {
        let start = Instant::now();
        let raw = self.model.score(input)?;
        let elapsed = start.elapsed();

        self.inference_count.fetch_add(1, Ordering::Relaxed);
        if elapsed > SLOW_INFERENCE {
            self.slow_inference_count.fetch_add(1, Ordering::Relaxed);
            warn!(elapsed_ms = elapsed.as_millis(), model = %self.model.name(), "Slow inference");
        } else {
            debug!(elapsed_us = elapsed.as_micros(), "Inference completed");
        }

        let mut probabilities = normalize(&raw, self.model.score_kind(), self.labels.len())?;
        if let Some(index) = &self.output_index {
            probabilities = index.iter().map(|&i| probabilities[i]).collect();
        }
        ClassificationResult::new(
            date,
            coordinate,
            self.labels.clone(),
            probabilities,
            self.model.name(),
        )
    }

    pub fn stats(&self) -> InferenceStats {
        InferenceStats {
            total_inferences: self.inference_count.load(Ordering::Relaxed),
            slow_inferences: self.slow_inference_count.load(Ordering::Relaxed),
            failed_inferences: self.failure_count.load(Ordering::Relaxed),
        }
    }
}

/// Map each configured label to the model output that scores it
///
/// `None` when the configured order already matches the model's.
fn output_order(
    declared: &[&str],
    labels: &LabelSet,
    model: &str,
) -> Result<Option<Vec<usize>>, InferenceError> {
    if declared.len() != labels.len() {
        return Err(InferenceError::OutputLength {
            expected: labels.len(),
            actual: declared.len(),
        });
    }
    let index = labels
        .iter()
        .map(|label| {
            declared
                .iter()
                .position(|d| d.eq_ignore_ascii_case(label))
                .ok_or_else(|| InferenceError::UnknownLabel {
                    label: label.to_string(),
                    model: model.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let identity = index.iter().enumerate().all(|(i, j)| i == *j);
    Ok(if identity { None } else { Some(index) })
}

/// Turn raw scores into a distribution over `expected` labels
pub fn normalize(raw: &[f64], kind: ScoreKind, expected: usize) -> Result<Vec<f64>, InferenceError> {
    if raw.len() != expected {
        return Err(InferenceError::OutputLength {
            expected,
            actual: raw.len(),
        });
    }
    if let Some(index) = raw.iter().position(|v| !v.is_finite()) {
        return Err(InferenceError::NonFinite { index });
    }
    match kind {
        ScoreKind::Logits => Ok(softmax(raw)),
        ScoreKind::Probabilities => Ok(raw.to_vec()),
    }
}

/// Numerically stable softmax
pub fn softmax(logits: &[f64]) -> Vec<f64> {
    let max = logits.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
