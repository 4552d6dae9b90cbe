//! Error taxonomy for the monitoring pipeline
//!
//! Each component fails with its own error type. The orchestrator wraps
//! whichever one occurred in a [`PipelineError`] that records the stage,
//! so callers can tell "no imagery today" apart from a model or storage fault
//! without matching on message text.

use crate::models::ObservationKey;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Invalid domain values
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("latitude {0} outside [-90, 90]")]
    Latitude(f64),
    #[error("longitude {0} outside [-180, 180]")]
    Longitude(f64),
    #[error("label set is empty")]
    EmptyLabelSet,
    #[error("label {0:?} must start with a letter and contain only letters, digits or '_'")]
    InvalidLabel(String),
    #[error("label {0:?} appears more than once")]
    DuplicateLabel(String),
}

/// Fetching imagery failed or the provider had nothing to offer
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Clouds, no coverage or a future date. Expected, not a fault.
    #[error("no image available: {reason}")]
    NoImagery { reason: String },

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("invalid provider request: {0}")]
    InvalidRequest(String),

    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
}

impl AcquisitionError {
    pub fn no_imagery(reason: impl Into<String>) -> Self {
        Self::NoImagery {
            reason: reason.into(),
        }
    }

    pub fn is_no_imagery(&self) -> bool {
        matches!(self, Self::NoImagery { .. })
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Transport(_) => true,
            Self::NoImagery { .. } | Self::InvalidRequest(_) | Self::MalformedResponse(_) => {
                false
            }
        }
    }
}

/// Bytes were fetched but are not a recognised raster format
#[derive(Debug, Error)]
#[error("cannot decode raster from {url}: {reason}")]
pub struct DecodeError {
    pub url: String,
    pub reason: String,
}

/// Raster cannot be turned into a model input
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PreprocessError {
    #[error("image has zero area ({width}x{height})")]
    ZeroArea { width: u32, height: u32 },
    #[error("unsupported pixel layout {color} ({channels} channel(s)); RGB required")]
    UnsupportedChannels { color: String, channels: u8 },
    #[error("invalid preprocessing configuration: {0}")]
    Config(String),
}

/// Model failed or broke the output contract
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    #[error("model produced {actual} scores, label set has {expected}")]
    OutputLength { expected: usize, actual: usize },
    #[error("model produced a non-finite score at index {index}")]
    NonFinite { index: usize },
    #[error("scores are not a probability distribution (sum {sum}): {detail}")]
    NotNormalized { sum: f64, detail: String },
    #[error("input tensor shape {actual:?} does not match model input {expected:?}")]
    InputShape {
        expected: [usize; 4],
        actual: [usize; 4],
    },
    #[error("label {label:?} is not one of the outputs of model {model}")]
    UnknownLabel { label: String, model: String },
    #[error("model execution failed: {0}")]
    Model(String),
}

/// Result store failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("a record for {key} already exists")]
    DuplicateKey { key: ObservationKey },

    #[error("stored schema does not match the label set: {0}")]
    SchemaMismatch(String),

    #[error("stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("store worker is not running")]
    WorkerGone,

    #[error("failed to open store: {0}")]
    Open(String),
}

impl StoreError {
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(e.code, rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    }
}

/// Step of a monitoring run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Acquisition,
    Preprocessing,
    Classification,
    Persistence,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Acquisition,
        Stage::Preprocessing,
        Stage::Classification,
        Stage::Persistence,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Acquisition => "acquisition",
            Stage::Preprocessing => "preprocessing",
            Stage::Classification => "classification",
            Stage::Persistence => "persistence",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Underlying cause of a failed stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Preprocess(#[from] PreprocessError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("stage task aborted: {0}")]
    Aborted(String),
}

impl StageError {
    /// Short machine-readable kind, used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Acquisition(AcquisitionError::NoImagery { .. }) => "no_imagery",
            StageError::Acquisition(AcquisitionError::Status { .. }) => "http_status",
            StageError::Acquisition(AcquisitionError::Transport(_)) => "transport",
            StageError::Acquisition(AcquisitionError::InvalidRequest(_)) => "invalid_request",
            StageError::Acquisition(AcquisitionError::MalformedResponse(_)) => "malformed_response",
            StageError::Decode(_) => "decode",
            StageError::Preprocess(_) => "preprocess",
            StageError::Inference(_) => "inference",
            StageError::Store(StoreError::DuplicateKey { .. }) => "duplicate_key",
            StageError::Store(_) => "store",
            StageError::Timeout(_) => "timeout",
            StageError::Aborted(_) => "aborted",
        }
    }
}

/// A monitoring run failed at `stage`
#[derive(Debug, Error)]
#[error("{stage} stage failed: {cause}")]
pub struct PipelineError {
    pub stage: Stage,
    #[source]
    pub cause: StageError,
}

impl PipelineError {
    pub fn new(stage: Stage, cause: impl Into<StageError>) -> Self {
        Self {
            stage,
            cause: cause.into(),
        }
    }

    pub fn is_no_imagery(&self) -> bool {
        matches!(
            &self.cause,
            StageError::Acquisition(AcquisitionError::NoImagery { .. })
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.cause, StageError::Timeout(_))
    }

    /// Whether re-running the whole pass could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match &self.cause {
            StageError::Acquisition(e) => e.is_retryable(),
            StageError::Timeout(_) => true,
            StageError::Store(e) => e.is_busy(),
            StageError::Decode(_)
            | StageError::Preprocess(_)
            | StageError::Inference(_)
            | StageError::Aborted(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_display_names_stage() {
        let err = PipelineError::new(
            Stage::Acquisition,
            AcquisitionError::no_imagery("cloud cover"),
        );
        assert_eq!(
            err.to_string(),
            "acquisition stage failed: no image available: cloud cover"
        );
        assert!(err.is_no_imagery());
        assert!(!err.is_retryable());
        assert_eq!(err.cause.kind(), "no_imagery");
    }

    #[test]
    fn test_retry_classification() {
        let server_error = PipelineError::new(
            Stage::Acquisition,
            AcquisitionError::Status {
                status: 503,
                body: "busy".into(),
            },
        );
        assert!(server_error.is_retryable());

        let forbidden = PipelineError::new(
            Stage::Acquisition,
            AcquisitionError::Status {
                status: 403,
                body: "bad key".into(),
            },
        );
        assert!(!forbidden.is_retryable());

        let timeout = PipelineError::new(
            Stage::Classification,
            StageError::Timeout(Duration::from_secs(5)),
        );
        assert!(timeout.is_retryable());
        assert!(timeout.is_timeout());

        let wrong_shape = PipelineError::new(
            Stage::Classification,
            InferenceError::OutputLength {
                expected: 3,
                actual: 1000,
            },
        );
        assert!(!wrong_shape.is_retryable());
    }
}
