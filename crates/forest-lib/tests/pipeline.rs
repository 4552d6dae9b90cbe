//! End-to-end runs against a mock imagery provider and a real SQLite file

use chrono::NaiveDate;
use forest_lib::error::{InferenceError, PreprocessError, StageError, StoreError};
use forest_lib::health::{components, ComponentStatus};
use forest_lib::store::SaveOutcome;
use forest_lib::{
    Classifier, ConflictPolicy, Coordinate, Credential, HealthRegistry, HttpImageSource,
    ImageTensor, LabelSet, ObservationRequest, Orchestrator, Preprocessor, ProviderConfig,
    ProviderProfile, ResultStore, ScoreKind, ScoringModel, SqliteResultStore, Stage,
    StageTimeouts, StoreConfig,
};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Rgb, RgbImage};
use mockito::{Matcher, ServerGuard};
use std::io::Cursor;
use std::sync::Arc;
use tempfile::TempDir;

/// Scoring model that always returns the same scores
struct CannedModel {
    scores: Vec<f64>,
    kind: ScoreKind,
}

impl ScoringModel for CannedModel {
    fn score(&self, input: &ImageTensor) -> Result<Vec<f64>, InferenceError> {
        assert_eq!(input.shape(), [1, 3, 224, 224]);
        Ok(self.scores.clone())
    }

    fn score_kind(&self) -> ScoreKind {
        self.kind
    }

    fn output_len(&self) -> Option<usize> {
        None
    }

    fn name(&self) -> &str {
        "canned"
    }
}

fn tile_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| Rgb([(x % 256) as u8, 120, (y % 256) as u8]));
    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut buf, ImageFormat::Png)
        .unwrap();
    buf.into_inner()
}

fn paris_new_year() -> ObservationRequest {
    ObservationRequest::new(
        Coordinate::new(48.8566, 2.3522).unwrap(),
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
        Credential::new("DEMO_KEY"),
    )
}

async fn mock_assets_with_tile(server: &mut ServerGuard) {
    mock_assets_with_body(server, tile_png(256, 256)).await;
}

/// Pointer for the Paris request, resolving to `body` served as a PNG
async fn mock_assets_with_body(server: &mut ServerGuard, body: Vec<u8>) {
    let pointer = format!(r#"{{"date": "2024-01-01", "url": "{}/tiles/paris.png"}}"#, server.url());
    server
        .mock("GET", "/planetary/earth/assets")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded("lat".into(), "48.8566".into()),
            Matcher::UrlEncoded("lon".into(), "2.3522".into()),
            Matcher::UrlEncoded("date".into(), "2024-01-01".into()),
            Matcher::UrlEncoded("api_key".into(), "DEMO_KEY".into()),
        ]))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(pointer)
        .create_async()
        .await;
    server
        .mock("GET", "/tiles/paris.png")
        .with_status(200)
        .with_header("content-type", "image/png")
        .with_body(body)
        .create_async()
        .await;
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<SqliteResultStore>,
    health: HealthRegistry,
    _dir: TempDir,
}

async fn harness(server: &ServerGuard, scores: Vec<f64>, kind: ScoreKind, policy: ConflictPolicy) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        SqliteResultStore::open(
            &StoreConfig {
                path: dir.path().join("forest_health.db"),
                conflict_policy: policy,
                busy_timeout_ms: 5_000,
            },
            LabelSet::default(),
        )
        .unwrap(),
    );

    let source = HttpImageSource::new(ProviderConfig {
        profile: ProviderProfile::EarthAssets,
        base_url: format!("{}/planetary/earth/assets", server.url()),
        resolution_deg: 0.1,
        request_timeout_secs: 5,
    })
    .unwrap();

    let classifier =
        Classifier::new(Box::new(CannedModel { scores, kind }), LabelSet::default()).unwrap();
    let health = HealthRegistry::for_pipeline().await;

    let orchestrator = Orchestrator::new(
        Arc::new(source),
        Preprocessor::default(),
        Arc::new(classifier),
        store.clone(),
    )
    .with_timeouts(StageTimeouts {
        acquisition_secs: 10,
        classification_secs: 10,
    })
    .with_health(health.clone());

    Harness {
        orchestrator,
        store,
        health,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_end_to_end_run_persists_exact_probabilities() {
    let mut server = mockito::Server::new_async().await;
    mock_assets_with_tile(&mut server).await;
    let h = harness(&server, vec![0.7, 0.2, 0.1], ScoreKind::Probabilities, ConflictPolicy::Replace).await;

    let request = paris_new_year();
    let record = h.orchestrator.run_once(&request).await.unwrap();

    assert_eq!(record.result.probabilities(), &[0.7, 0.2, 0.1]);
    assert_eq!(record.result.probability("Healthy"), Some(0.7));
    assert_eq!(record.result.probability("Deforested"), Some(0.1));
    assert!(record.source_url.as_deref().unwrap().ends_with("/tiles/paris.png"));

    let stored = h
        .store
        .read(
            NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            Coordinate::new(48.8566, 2.3522).unwrap(),
        )
        .await
        .unwrap()
        .expect("record stored under (2024-01-01, (48.8566, 2.3522))");
    assert_eq!(stored.result.probabilities(), &[0.7, 0.2, 0.1]);
    assert_eq!(stored.result.model(), "canned");
    assert_eq!(h.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_observe_returns_image_for_presentation() {
    let mut server = mockito::Server::new_async().await;
    mock_assets_with_tile(&mut server).await;
    let h = harness(&server, vec![0.7, 0.2, 0.1], ScoreKind::Probabilities, ConflictPolicy::Replace).await;

    let observation = h.orchestrator.observe(&paris_new_year()).await.unwrap();
    assert_eq!((observation.image.width(), observation.image.height()), (256, 256));
    assert_eq!(observation.result().dominant().0, "Healthy");
    assert_eq!(observation.outcome, SaveOutcome::Inserted);
}

#[tokio::test]
async fn test_logits_are_softmaxed_before_storage() {
    let mut server = mockito::Server::new_async().await;
    mock_assets_with_tile(&mut server).await;
    let h = harness(&server, vec![2.0, 1.0, 0.1], ScoreKind::Logits, ConflictPolicy::Replace).await;

    let record = h.orchestrator.run_once(&paris_new_year()).await.unwrap();
    let sum: f64 = record.result.probabilities().iter().sum();
    assert!((sum - 1.0).abs() < 1e-6);
    assert!(record.result.probabilities().iter().all(|p| *p > 0.0 && *p < 1.0));
    assert_eq!(record.result.dominant().0, "Healthy");
}

#[tokio::test]
async fn test_no_imagery_fails_acquisition_without_write() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/planetary/earth/assets")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"msg": "No imagery for specified date."}"#)
        .create_async()
        .await;
    let h = harness(&server, vec![0.7, 0.2, 0.1], ScoreKind::Probabilities, ConflictPolicy::Replace).await;

    let err = h.orchestrator.run_once(&paris_new_year()).await.unwrap_err();
    assert_eq!(err.stage, Stage::Acquisition);
    assert!(err.is_no_imagery());
    assert!(!err.is_retryable());
    assert_eq!(h.store.count().await.unwrap(), 0);

    let health = h.health.health().await;
    assert_eq!(health.components[components::IMAGE_SOURCE].status, ComponentStatus::Healthy);
}

#[tokio::test]
async fn test_provider_error_status_reports_acquisition() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/planetary/earth/assets")
        .match_query(Matcher::Any)
        .with_status(503)
        .with_body("upstream unavailable")
        .create_async()
        .await;
    let h = harness(&server, vec![0.7, 0.2, 0.1], ScoreKind::Probabilities, ConflictPolicy::Replace).await;

    let err = h.orchestrator.run_once(&paris_new_year()).await.unwrap_err();
    assert_eq!(err.stage, Stage::Acquisition);
    assert!(!err.is_no_imagery());
    assert!(err.is_retryable());
    assert_eq!(err.cause.kind(), "http_status");

    let health = h.health.health().await;
    assert_eq!(health.components[components::IMAGE_SOURCE].status, ComponentStatus::Degraded);
}

#[tokio::test]
async fn test_wrong_output_length_fails_classification_without_write() {
    let mut server = mockito::Server::new_async().await;
    mock_assets_with_tile(&mut server).await;
    let h = harness(&server, vec![0.5, 0.5], ScoreKind::Probabilities, ConflictPolicy::Replace).await;

    let err = h.orchestrator.run_once(&paris_new_year()).await.unwrap_err();
    assert_eq!(err.stage, Stage::Classification);
    assert!(matches!(
        err.cause,
        StageError::Inference(InferenceError::OutputLength { expected: 3, actual: 2 })
    ));
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_rerun_under_reject_policy_reports_persistence() {
    let mut server = mockito::Server::new_async().await;
    mock_assets_with_tile(&mut server).await;
    let h = harness(&server, vec![0.7, 0.2, 0.1], ScoreKind::Probabilities, ConflictPolicy::Reject).await;

    h.orchestrator.run_once(&paris_new_year()).await.unwrap();
    let err = h.orchestrator.run_once(&paris_new_year()).await.unwrap_err();

    assert_eq!(err.stage, Stage::Persistence);
    assert!(matches!(err.cause, StageError::Store(StoreError::DuplicateKey { .. })));
    assert_eq!(err.cause.kind(), "duplicate_key");
    assert_eq!(h.store.count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_rerun_under_replace_policy_keeps_one_record() {
    let mut server = mockito::Server::new_async().await;
    mock_assets_with_tile(&mut server).await;
    let h = harness(&server, vec![0.7, 0.2, 0.1], ScoreKind::Probabilities, ConflictPolicy::Replace).await;

    let first = h.orchestrator.observe(&paris_new_year()).await.unwrap();
    let second = h.orchestrator.observe(&paris_new_year()).await.unwrap();

    assert_eq!(first.outcome, SaveOutcome::Inserted);
    assert_eq!(second.outcome, SaveOutcome::Replaced);
    assert_eq!(h.store.count().await.unwrap(), 1);

    let history = h
        .store
        .history(Coordinate::new(48.8566, 2.3522).unwrap(), None, None)
        .await
        .unwrap();
    assert_eq!(history.len(), 1);
}

#[tokio::test]
async fn test_truncated_raster_fails_acquisition_as_decode() {
    let mut server = mockito::Server::new_async().await;
    let mut truncated = tile_png(256, 256);
    truncated.truncate(64);
    mock_assets_with_body(&mut server, truncated).await;
    let h = harness(&server, vec![0.7, 0.2, 0.1], ScoreKind::Probabilities, ConflictPolicy::Replace).await;

    let err = h.orchestrator.run_once(&paris_new_year()).await.unwrap_err();
    assert_eq!(err.stage, Stage::Acquisition);
    assert!(matches!(err.cause, StageError::Decode(_)));
    assert!(!err.is_retryable());
    assert_eq!(h.store.count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_grayscale_raster_fails_preprocessing() {
    let mut server = mockito::Server::new_async().await;
    let mut gray = Cursor::new(Vec::new());
    DynamicImage::ImageLuma8(GrayImage::from_pixel(64, 64, Luma([90])))
        .write_to(&mut gray, ImageFormat::Png)
        .unwrap();
    mock_assets_with_body(&mut server, gray.into_inner()).await;
    let h = harness(&server, vec![0.7, 0.2, 0.1], ScoreKind::Probabilities, ConflictPolicy::Replace).await;

    let err = h.orchestrator.run_once(&paris_new_year()).await.unwrap_err();
    assert_eq!(err.stage, Stage::Preprocessing);
    assert!(matches!(
        err.cause,
        StageError::Preprocess(PreprocessError::UnsupportedChannels { .. })
    ));
    assert_eq!(h.store.count().await.unwrap(), 0);

    let health = h.health.health().await;
    assert_eq!(health.components[components::CLASSIFIER].status, ComponentStatus::Degraded);
}
