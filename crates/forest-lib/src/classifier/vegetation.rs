//! Visible-band vegetation heuristic
//!
//! Scores a tile without model weights. Each pixel's VARI
//! (`(G - R) / (G + R - B)`) puts it in one of three buckets: dense canopy,
//! sparse or stressed vegetation, or bare ground. The bucket fractions,
//! scaled by a sharpness factor, are the logits for
//! Healthy / Degraded / Deforested.

use super::{ScoreKind, ScoringModel};
use crate::error::InferenceError;
use crate::preprocess::{ImageTensor, INPUT_CHANNELS};

/// VARI above this counts as healthy canopy
pub const CANOPY_THRESHOLD: f32 = 0.10;

/// VARI above this (and below canopy) counts as sparse vegetation
pub const SPARSE_THRESHOLD: f32 = 0.0;

const SHARPNESS: f64 = 6.0;

/// Output order of the logits
pub const OUTPUT_LABELS: [&str; 3] = ["Healthy", "Degraded", "Deforested"];

/// Heuristic scorer over the visible bands
#[derive(Debug, Clone)]
pub struct VegetationIndexModel {
    mean: [f32; 3],
    std: [f32; 3],
}

impl VegetationIndexModel {
    /// `mean`/`std` must be the preprocessing normalisation, so pixels can be
    /// mapped back to [0, 1]
    pub fn new(mean: [f32; 3], std: [f32; 3]) -> Self {
        Self { mean, std }
    }

    fn denormalize(&self, value: f32, channel: usize) -> f32 {
        (value * self.std[channel] + self.mean[channel]).clamp(0.0, 1.0)
    }

    /// Fractions of canopy, sparse and bare pixels
    pub fn cover_fractions(&self, input: &ImageTensor) -> Result<[f64; 3], InferenceError> {
        let shape = input.shape();
        let shape_error = InferenceError::InputShape {
            expected: [1, INPUT_CHANNELS, shape[2].max(1), shape[3].max(1)],
            actual: shape,
        };
        if shape[0] != 1 || shape[1] != INPUT_CHANNELS || shape[2] * shape[3] == 0 {
            return Err(shape_error);
        }

        let (Some(red), Some(green), Some(blue)) =
            (input.channel(0), input.channel(1), input.channel(2))
        else {
            return Err(shape_error);
        };
        let mut counts = [0usize; 3];
        for i in 0..red.len() {
            let r = self.denormalize(red[i], 0);
            let g = self.denormalize(green[i], 1);
            let b = self.denormalize(blue[i], 2);
            let bucket = match vari(r, g, b) {
                v if v > CANOPY_THRESHOLD => 0,
                v if v > SPARSE_THRESHOLD => 1,
                _ => 2,
            };
            counts[bucket] += 1;
        }

        let total = red.len() as f64;
        Ok(counts.map(|c| c as f64 / total))
    }
}

/// Visible atmospherically resistant index, clamped to [-1, 1]
pub fn vari(r: f32, g: f32, b: f32) -> f32 {
    let denom = g + r - b;
    if denom.abs() < 1e-6 {
        return 0.0;
    }
    ((g - r) / denom).clamp(-1.0, 1.0)
}

impl ScoringModel for VegetationIndexModel {
    fn score(&self, input: &ImageTensor) -> Result<Vec<f64>, InferenceError> {
        let fractions = self.cover_fractions(input)?;
        Ok(fractions.iter().map(|f| f * SHARPNESS).collect())
    }

    fn score_kind(&self) -> ScoreKind {
        ScoreKind::Logits
    }

    fn output_len(&self) -> Option<usize> {
        Some(OUTPUT_LABELS.len())
    }

    fn name(&self) -> &str {
        "vegetation-index"
    }

    fn labels(&self) -> Option<&[&str]> {
        Some(&OUTPUT_LABELS)
    }
}
