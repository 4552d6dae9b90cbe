//! ONNX inference using tract
//!
//! Loads an exported image-classification model once at startup and runs it
//! on CPU. The model is expected to take a single `[1, 3, H, W]` f32 input and
//! return one score per label.

use super::{ScoreKind, ScoringModel};
use crate::error::InferenceError;
use crate::preprocess::ImageTensor;
use sha2::{Digest, Sha256};
use std::path::Path;
use tract_onnx::prelude::*;
use tracing::info;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// ONNX-based scoring model
pub struct OnnxModel {
    plan: TractModel,
    input_shape: [usize; 4],
    output_len: Option<usize>,
    kind: ScoreKind,
    name: String,
}

impl OnnxModel {
    /// Load a model file, verifying its digest first when one is given
    pub fn load(
        path: &Path,
        input_shape: [usize; 4],
        kind: ScoreKind,
        expected_sha256: Option<&str>,
    ) -> Result<Self, InferenceError> {
        let bytes = std::fs::read(path).map_err(|e| {
            InferenceError::Model(format!("failed to read model {}: {}", path.display(), e))
        })?;

        let checksum = compute_checksum(&bytes);
        if let Some(expected) = expected_sha256 {
            if !checksum.eq_ignore_ascii_case(expected.trim()) {
                return Err(InferenceError::Model(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    path.display(),
                    expected,
                    checksum
                )));
            }
        }

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "onnx".to_string());
        let model = Self::from_bytes(&bytes, input_shape, kind, name)?;

        info!(
            path = %path.display(),
            sha256 = %checksum,
            output_len = ?model.output_len,
            "Loaded ONNX model"
        );
        Ok(model)
    }

    /// Parse and optimise a model from bytes
    pub fn from_bytes(
        bytes: &[u8],
        input_shape: [usize; 4],
        kind: ScoreKind,
        name: impl Into<String>,
    ) -> Result<Self, InferenceError> {
        let plan = Self::load_plan(bytes, input_shape)
            .map_err(|e| InferenceError::Model(format!("{:#}", e)))?;

        let output_len = plan
            .model()
            .output_fact(0)
            .ok()
            .and_then(|fact| fact.shape.as_concrete().map(|dims| dims.iter().product()));

        Ok(Self {
            plan,
            input_shape,
            output_len,
            kind,
            name: format!("onnx:{}", name.into()),
        })
    }

    fn load_plan(bytes: &[u8], input_shape: [usize; 4]) -> TractResult<TractModel> {
        tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(bytes))?
            .with_input_fact(0, f32::fact(input_shape).into())?
            .into_optimized()?
            .into_runnable()
    }
}

impl ScoringModel for OnnxModel {
    fn score(&self, input: &ImageTensor) -> Result<Vec<f64>, InferenceError> {
        if input.shape() != self.input_shape {
            return Err(InferenceError::InputShape {
                expected: self.input_shape,
                actual: input.shape(),
            });
        }

        let [n, c, h, w] = self.input_shape;
        let array = tract_ndarray::Array4::from_shape_vec((n, c, h, w), input.data().to_vec())
            .map_err(|e| InferenceError::Model(e.to_string()))?;
        let tensor: Tensor = array.into();

        let outputs = self
            .plan
            .run(tvec!(tensor.into()))
            .map_err(|e| InferenceError::Model(format!("{:#}", e)))?;
        let output = outputs
            .first()
            .ok_or_else(|| InferenceError::Model("model produced no output".into()))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| InferenceError::Model(format!("{:#}", e)))?;

        Ok(view.iter().map(|v| f64::from(*v)).collect())
    }

    fn score_kind(&self) -> ScoreKind {
        self.kind
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    fn name(&self) -> &str {
        &self.name
    }
}

fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of a file, for pinning `model_sha256`
pub fn file_sha256(path: &Path) -> std::io::Result<String> {
    Ok(compute_checksum(&std::fs::read(path)?))
}
