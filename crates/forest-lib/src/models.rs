//! Core data models for the forest monitor

use crate::error::{InferenceError, ModelError};
use chrono::{DateTime, NaiveDate, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Coordinates are keyed at micro-degree precision
pub const COORDINATE_SCALE: f64 = 1_000_000.0;

/// Allowed deviation of a probability vector's sum from 1
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// Label set used when none is configured
pub const DEFAULT_LABELS: [&str; 3] = ["Healthy", "Degraded", "Deforested"];

/// A monitoring site
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCoordinate")]
pub struct Coordinate {
    latitude: f64,
    longitude: f64,
}

#[derive(Deserialize)]
struct RawCoordinate {
    latitude: f64,
    longitude: f64,
}

impl TryFrom<RawCoordinate> for Coordinate {
    type Error = ModelError;

    fn try_from(raw: RawCoordinate) -> Result<Self, Self::Error> {
        Coordinate::new(raw.latitude, raw.longitude)
    }
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, ModelError> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(ModelError::Latitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(ModelError::Longitude(longitude));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    /// Rebuild a coordinate from its micro-degree key
    pub fn from_key(lat_e6: i64, lon_e6: i64) -> Result<Self, ModelError> {
        Self::new(lat_e6 as f64 / COORDINATE_SCALE, lon_e6 as f64 / COORDINATE_SCALE)
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Micro-degree key; two coordinates with the same key are the same site
    pub fn key(&self) -> (i64, i64) {
        (
            (self.latitude * COORDINATE_SCALE).round() as i64,
            (self.longitude * COORDINATE_SCALE).round() as i64,
        )
    }

    pub fn same_site(&self, other: &Coordinate) -> bool {
        self.key() == other.key()
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.6}, {:.6})", self.latitude, self.longitude)
    }
}

/// Provider credential. Never printed.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// One monitoring run's input
#[derive(Debug, Clone)]
pub struct ObservationRequest {
    pub coordinate: Coordinate,
    pub date: NaiveDate,
    pub credential: Credential,
}

impl ObservationRequest {
    pub fn new(coordinate: Coordinate, date: NaiveDate, credential: Credential) -> Self {
        Self {
            coordinate,
            date,
            credential,
        }
    }

    pub fn key(&self) -> ObservationKey {
        ObservationKey::new(self.date, self.coordinate)
    }
}

/// Where a raster came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProvenance {
    pub url: String,
    pub fetched_at: DateTime<Utc>,
}

/// Decoded raster owned by a single pipeline run
///
/// Deliberately not `Clone`: the image lives for one run and is dropped with it.
#[derive(Debug)]
pub struct RasterImage {
    image: DynamicImage,
    provenance: ImageProvenance,
}

impl RasterImage {
    pub fn new(image: DynamicImage, provenance: ImageProvenance) -> Self {
        Self { image, provenance }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    pub fn provenance(&self) -> &ImageProvenance {
        &self.provenance
    }

    pub fn into_parts(self) -> (DynamicImage, ImageProvenance) {
        (self.image, self.provenance)
    }
}

/// Fixed, ordered set of class labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<String>", into = "Vec<String>")]
pub struct LabelSet(Arc<[String]>);

impl LabelSet {
    pub fn new<I, S>(labels: I) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(ModelError::EmptyLabelSet);
        }
        for (i, label) in labels.iter().enumerate() {
            let mut chars = label.chars();
            let valid = chars.next().is_some_and(|c| c.is_ascii_alphabetic())
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
            if !valid {
                return Err(ModelError::InvalidLabel(label.clone()));
            }
            if labels[..i]
                .iter()
                .any(|other| other.eq_ignore_ascii_case(label))
            {
                return Err(ModelError::DuplicateLabel(label.clone()));
            }
        }
        Ok(Self(labels.into()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.0.get(index).map(String::as_str)
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.0.iter().position(|l| l.eq_ignore_ascii_case(label))
    }

    /// Store column names, in label order
    pub fn column_names(&self) -> Vec<String> {
        self.0.iter().map(|l| l.to_ascii_lowercase()).collect()
    }
}

impl Default for LabelSet {
    fn default() -> Self {
        Self(DEFAULT_LABELS.iter().map(|l| l.to_string()).collect())
    }
}

impl TryFrom<Vec<String>> for LabelSet {
    type Error = ModelError;

    fn try_from(labels: Vec<String>) -> Result<Self, Self::Error> {
        LabelSet::new(labels)
    }
}

impl From<LabelSet> for Vec<String> {
    fn from(labels: LabelSet) -> Self {
        labels.0.to_vec()
    }
}

/// Probability distribution over the label set for one site and day
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    date: NaiveDate,
    coordinate: Coordinate,
    labels: LabelSet,
    probabilities: Vec<f64>,
    model: String,
}

impl ClassificationResult {
    /// Build a result, checking length and that the values form a distribution
    pub fn new(
        date: NaiveDate,
        coordinate: Coordinate,
        labels: LabelSet,
        probabilities: Vec<f64>,
        model: impl Into<String>,
    ) -> Result<Self, InferenceError> {
        validate_distribution(&probabilities, labels.len())?;
        Ok(Self {
            date,
            coordinate,
            labels,
            probabilities,
            model: model.into(),
        })
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn coordinate(&self) -> Coordinate {
        self.coordinate
    }

    pub fn labels(&self) -> &LabelSet {
        &self.labels
    }

    pub fn probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn probability(&self, label: &str) -> Option<f64> {
        self.labels
            .position(label)
            .map(|i| self.probabilities[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.labels.iter().zip(self.probabilities.iter().copied())
    }

    /// Most likely label
    pub fn dominant(&self) -> (&str, f64) {
        self.iter()
            .fold(None::<(&str, f64)>, |best, (label, p)| match best {
                Some((_, bp)) if bp >= p => best,
                _ => Some((label, p)),
            })
            .unwrap_or(("", 0.0))
    }

    pub fn key(&self) -> ObservationKey {
        ObservationKey::new(self.date, self.coordinate)
    }
}

/// Check `values` is a probability vector of length `expected`
pub fn validate_distribution(values: &[f64], expected: usize) -> Result<(), InferenceError> {
    if values.len() != expected {
        return Err(InferenceError::OutputLength {
            expected,
            actual: values.len(),
        });
    }
    if let Some(index) = values.iter().position(|v| !v.is_finite()) {
        return Err(InferenceError::NonFinite { index });
    }
    if let Some(index) = values.iter().position(|v| *v < 0.0) {
        return Err(InferenceError::NotNormalized {
            sum: values.iter().sum(),
            detail: format!("negative probability at index {}", index),
        });
    }
    let sum: f64 = values.iter().sum();
    if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
        return Err(InferenceError::NotNormalized {
            sum,
            detail: "probabilities do not sum to 1".to_string(),
        });
    }
    Ok(())
}

/// Durable identity of an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservationKey {
    pub date: NaiveDate,
    pub lat_e6: i64,
    pub lon_e6: i64,
}

impl ObservationKey {
    pub fn new(date: NaiveDate, coordinate: Coordinate) -> Self {
        let (lat_e6, lon_e6) = coordinate.key();
        Self {
            date,
            lat_e6,
            lon_e6,
        }
    }
}

impl fmt::Display for ObservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@({:.6}, {:.6})",
            self.date,
            self.lat_e6 as f64 / COORDINATE_SCALE,
            self.lon_e6 as f64 / COORDINATE_SCALE
        )
    }
}

/// Persisted form of a classification
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub result: ClassificationResult,
    pub source_url: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl StoredRecord {
    pub fn new(result: ClassificationResult, source_url: Option<String>) -> Self {
        Self {
            result,
            source_url,
            recorded_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ObservationKey {
        self.result.key()
    }
}
