//! The monitoring run: acquisition, preprocessing, classification, persistence
//!
//! [`Orchestrator`] executes the four stages strictly in order and stops at
//! the first failure, reporting which stage failed. It never retries; retry
//! policy lives with the caller (see [`crate::scheduler::RetryPolicy`]).

use crate::classifier::Classifier;
use crate::error::{PipelineError, Stage, StageError};
use crate::health::HealthRegistry;
use crate::models::{ClassificationResult, ObservationRequest, RasterImage, StoredRecord};
use crate::observability::{PipelineMetrics, StructuredLogger};
use crate::preprocess::{ImageTensor, Preprocessor};
use crate::scheduler::ScheduledRun;
use crate::source::ImageSource;
use crate::store::{async_trait, ResultStore, SaveOutcome};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, instrument};

/// Upper bounds for the stages that may block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageTimeouts {
    pub acquisition_secs: u64,
    pub classification_secs: u64,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            acquisition_secs: 120,
            classification_secs: 60,
        }
    }
}

impl StageTimeouts {
    pub fn acquisition(&self) -> Duration {
        Duration::from_secs(self.acquisition_secs)
    }

    pub fn classification(&self) -> Duration {
        Duration::from_secs(self.classification_secs)
    }
}

/// Everything one run produced, for callers that render the image
#[derive(Debug)]
pub struct Observation {
    pub image: RasterImage,
    pub record: StoredRecord,
    pub outcome: SaveOutcome,
}

impl Observation {
    pub fn result(&self) -> &ClassificationResult {
        &self.record.result
    }
}

/// Runs the pipeline against long-lived collaborators
///
/// The collaborators are built once at startup and shared by reference across
/// runs; nothing is re-initialised per request.
#[derive(Clone)]
pub struct Orchestrator {
    source: Arc<dyn ImageSource>,
    preprocessor: Arc<Preprocessor>,
    classifier: Arc<Classifier>,
    store: Arc<dyn ResultStore>,
    timeouts: StageTimeouts,
    metrics: PipelineMetrics,
    health: HealthRegistry,
    logger: StructuredLogger,
}

impl Orchestrator {
    pub fn new(
        source: Arc<dyn ImageSource>,
        preprocessor: Preprocessor,
        classifier: Arc<Classifier>,
        store: Arc<dyn ResultStore>,
    ) -> Self {
        let metrics = PipelineMetrics::new();
        metrics.set_classifier(classifier.model_name());

        Self {
            source,
            preprocessor: Arc::new(preprocessor),
            classifier,
            store,
            timeouts: StageTimeouts::default(),
            metrics,
            health: HealthRegistry::new(),
            logger: StructuredLogger::default(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: StageTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_health(mut self, health: HealthRegistry) -> Self {
        self.health = health;
        self
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn store(&self) -> &Arc<dyn ResultStore> {
        &self.store
    }

    /// Run all four stages and persist the result
    pub async fn run_once(&self, request: &ObservationRequest) -> Result<StoredRecord, PipelineError> {
        self.observe(request).await.map(|observation| observation.record)
    }

    /// Like [`run_once`](Self::run_once) but also hands back the fetched image
    #[instrument(skip(self, request), fields(key = %request.key()))]
    pub async fn observe(&self, request: &ObservationRequest) -> Result<Observation, PipelineError> {
        let started = Instant::now();
        let outcome = self.execute(request).await;
        let elapsed = started.elapsed();

        match &outcome {
            Ok(observation) => {
                self.metrics.record_success(elapsed);
                self.health.record_success().await;
                self.logger.log_observation(&observation.record, elapsed);
            }
            Err(err) => {
                self.metrics.record_failure(err.stage, elapsed);
                // Missing imagery is an expected daily condition, not a fault
                if !err.is_no_imagery() {
                    self.health.record_failure(err.stage, err.to_string()).await;
                }
                debug!(stage = %err.stage, kind = err.cause.kind(), "Run failed");
            }
        }

        outcome
    }

    async fn execute(&self, request: &ObservationRequest) -> Result<Observation, PipelineError> {
        let image = self
            .timed(Stage::Acquisition, self.acquire(request))
            .await?;
        let (image, tensor) = self
            .timed(Stage::Preprocessing, self.preprocess(image))
            .await?;
        let result = self
            .timed(Stage::Classification, self.classify(tensor, request))
            .await?;

        let record = StoredRecord::new(result, Some(image.provenance().url.clone()));
        let outcome = self
            .timed(Stage::Persistence, async {
                self.store
                    .save(&record)
                    .await
                    .map_err(|e| PipelineError::new(Stage::Persistence, e))
            })
            .await?;

        Ok(Observation {
            image,
            record,
            outcome,
        })
    }

    async fn timed<T>(
        &self,
        stage: Stage,
        fut: impl Future<Output = Result<T, PipelineError>>,
    ) -> Result<T, PipelineError> {
        let started = Instant::now();
        let result = fut.await;
        self.metrics.observe_stage(stage, started.elapsed());
        result
    }

    async fn acquire(&self, request: &ObservationRequest) -> Result<RasterImage, PipelineError> {
        let limit = self.timeouts.acquisition();
        let fetch = self
            .source
            .fetch(request.coordinate, request.date, &request.credential);

        match timeout(limit, fetch).await {
            Ok(Ok(image)) => {
                debug!(
                    source = self.source.name(),
                    width = image.width(),
                    height = image.height(),
                    "Image acquired"
                );
                Ok(image)
            }
            Ok(Err(err)) => Err(PipelineError::new(Stage::Acquisition, err)),
            Err(_) => Err(PipelineError::new(Stage::Acquisition, StageError::Timeout(limit))),
        }
    }

    async fn preprocess(
        &self,
        image: RasterImage,
    ) -> Result<(RasterImage, ImageTensor), PipelineError> {
        let preprocessor = Arc::clone(&self.preprocessor);
        let task = tokio::task::spawn_blocking(move || {
            let tensor = preprocessor.prepare(&image);
            (image, tensor)
        });

        match task.await {
            Ok((image, Ok(tensor))) => Ok((image, tensor)),
            Ok((_, Err(err))) => Err(PipelineError::new(Stage::Preprocessing, err)),
            Err(join) => Err(PipelineError::new(
                Stage::Preprocessing,
                StageError::Aborted(join.to_string()),
            )),
        }
    }

    async fn classify(
        &self,
        tensor: ImageTensor,
        request: &ObservationRequest,
    ) -> Result<ClassificationResult, PipelineError> {
        let limit = self.timeouts.classification();
        let classifier = Arc::clone(&self.classifier);
        let (date, coordinate) = (request.date, request.coordinate);
        let task =
            tokio::task::spawn_blocking(move || classifier.classify(&tensor, date, coordinate));

        match timeout(limit, task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(err))) => Err(PipelineError::new(Stage::Classification, err)),
            Ok(Err(join)) => Err(PipelineError::new(
                Stage::Classification,
                StageError::Aborted(join.to_string()),
            )),
            Err(_) => Err(PipelineError::new(
                Stage::Classification,
                StageError::Timeout(limit),
            )),
        }
    }
}

#[async_trait]
impl ScheduledRun for Orchestrator {
    async fn run(&self, request: &ObservationRequest) -> Result<StoredRecord, PipelineError> {
        self.run_once(request).await
    }
}
