//! Forest health monitoring library
//!
//! This crate provides the core pipeline for daily forest observation:
//! - Satellite image acquisition from an imagery provider
//! - Preprocessing into a fixed-shape classifier input
//! - Land-cover classification (ONNX model or vegetation-index heuristic)
//! - Durable per-day results keyed by site
//! - Daily scheduling, health checks and observability

pub mod classifier;
pub mod error;
pub mod health;
pub mod models;
pub mod observability;
pub mod pipeline;
pub mod preprocess;
pub mod scheduler;
pub mod source;
pub mod store;

pub use classifier::{Classifier, ClassifierConfig, ClassifierKind, ScoreKind, ScoringModel};
pub use error::{PipelineError, Stage, StageError};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{PipelineMetrics, StructuredLogger};
pub use pipeline::{Observation, Orchestrator, StageTimeouts};
pub use preprocess::{ImageTensor, PreprocessConfig, Preprocessor};
pub use scheduler::{MonitorScheduler, ScheduleConfig, ScheduleEntry};
pub use source::{HttpImageSource, ImageSource, ProviderConfig, ProviderProfile};
pub use store::{ConflictPolicy, ResultStore, SqliteResultStore, StoreConfig};
