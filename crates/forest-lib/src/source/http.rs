//! HTTP imagery provider client
//!
//! Supports two provider profiles. `earth-assets` answers with JSON that
//! points at the image, which is then fetched with a second GET.
//! `direct-download` answers with the raster bytes themselves. Either way a
//! non-success status is a hard failure and is never retried here.

use super::{async_trait, decode_raster, looks_like_raster, ImageSource, SourceError};
use crate::error::AcquisitionError;
use crate::models::{Coordinate, Credential, RasterImage};
use chrono::NaiveDate;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

/// Spatial resolution requested from the provider, in degrees
pub const DEFAULT_RESOLUTION_DEG: f64 = 0.1;

/// Longest provider error body kept in an error
const MAX_ERROR_BODY: usize = 512;

/// Query layout of a provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderProfile {
    /// JSON response carrying a `url` to the image
    #[default]
    EarthAssets,
    /// Raster bytes in the response body
    DirectDownload,
}

impl ProviderProfile {
    fn credential_param(&self) -> &'static str {
        match self {
            ProviderProfile::EarthAssets => "api_key",
            ProviderProfile::DirectDownload => "key",
        }
    }
}

/// Provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub profile: ProviderProfile,
    pub base_url: String,
    pub resolution_deg: f64,
    /// Socket-level bound for each HTTP request
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            profile: ProviderProfile::EarthAssets,
            base_url: "https://api.nasa.gov/planetary/earth/assets".to_string(),
            resolution_deg: DEFAULT_RESOLUTION_DEG,
            request_timeout_secs: 60,
        }
    }
}

/// What a successful provider response contained
#[derive(Debug)]
enum ProviderBody {
    Raster(Vec<u8>),
    Pointer(Url),
}

#[derive(Debug, Deserialize)]
struct AssetResponse {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// Imagery provider reached over HTTP
pub struct HttpImageSource {
    client: Client,
    config: ProviderConfig,
    base_url: Url,
}

impl HttpImageSource {
    /// Create a new source with its own HTTP client
    pub fn new(config: ProviderConfig) -> Result<Self, AcquisitionError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .user_agent(concat!("forest-agent/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(client, config)
    }

    /// Create a source reusing an existing client
    pub fn with_client(client: Client, config: ProviderConfig) -> Result<Self, AcquisitionError> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            AcquisitionError::InvalidRequest(format!("invalid provider URL {}: {}", config.base_url, e))
        })?;
        if !(config.resolution_deg.is_finite() && config.resolution_deg > 0.0) {
            return Err(AcquisitionError::InvalidRequest(format!(
                "resolution must be positive, got {}",
                config.resolution_deg
            )));
        }
        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    pub fn profile(&self) -> ProviderProfile {
        self.config.profile
    }

    /// Build the provider request URL
    fn request_url(&self, coordinate: Coordinate, date: NaiveDate, credential: &Credential) -> Url {
        let mut url = self.base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            match self.config.profile {
                ProviderProfile::EarthAssets => {
                    query
                        .append_pair("lon", &coordinate.longitude().to_string())
                        .append_pair("lat", &coordinate.latitude().to_string());
                }
                ProviderProfile::DirectDownload => {
                    query
                        .append_pair("lat", &coordinate.latitude().to_string())
                        .append_pair("lon", &coordinate.longitude().to_string());
                }
            }
            query
                .append_pair("date", &date.format("%Y-%m-%d").to_string())
                .append_pair("dim", &self.config.resolution_deg.to_string())
                .append_pair(self.config.profile.credential_param(), credential.expose());
        }
        url
    }

    /// The request URL with the credential masked, safe to log or persist
    fn redacted(&self, url: &Url) -> String {
        let secret_param = self.config.profile.credential_param();
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| {
                let value = if k == secret_param {
                    "***".to_string()
                } else {
                    v.into_owned()
                };
                (k.into_owned(), value)
            })
            .collect();

        let mut masked = url.clone();
        masked.query_pairs_mut().clear().extend_pairs(pairs);
        masked.to_string()
    }

    /// GET `url`, failing on non-success status
    async fn get_bytes(&self, url: Url) -> Result<(Option<String>, Vec<u8>), AcquisitionError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(AcquisitionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        let bytes = response.bytes().await?;
        Ok((content_type, bytes.to_vec()))
    }

    /// Decide whether a success body is the image or a pointer to it
    fn interpret(&self, content_type: Option<&str>, bytes: Vec<u8>) -> Result<ProviderBody, AcquisitionError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(AcquisitionError::no_imagery("provider returned an empty body"));
        }

        let is_image_type = content_type.is_some_and(|ct| ct.starts_with("image/"));
        if is_image_type || looks_like_raster(&bytes) {
            return Ok(ProviderBody::Raster(bytes));
        }

        let is_json_type = content_type.is_some_and(|ct| ct.contains("json"));
        let first = bytes.iter().find(|b| !b.is_ascii_whitespace()).copied();
        if !is_json_type && first != Some(b'{') {
            // Not JSON and not a known signature: let the decoder report it
            return Ok(ProviderBody::Raster(bytes));
        }

        let parsed: AssetResponse = serde_json::from_slice(&bytes)
            .map_err(|e| AcquisitionError::MalformedResponse(e.to_string()))?;

        match parsed.url.as_deref().map(str::trim) {
            Some(pointer) if !pointer.is_empty() => {
                let target = self
                    .base_url
                    .join(pointer)
                    .map_err(|e| AcquisitionError::MalformedResponse(format!("bad image URL {}: {}", pointer, e)))?;
                Ok(ProviderBody::Pointer(target))
            }
            _ => {
                let reason = parsed
                    .msg
                    .or(parsed.message)
                    .or(parsed.error)
                    .unwrap_or_else(|| "no image reference in provider response".to_string());
                Err(AcquisitionError::no_imagery(reason))
            }
        }
    }
}

#[async_trait]
impl ImageSource for HttpImageSource {
    async fn fetch(
        &self,
        coordinate: Coordinate,
        date: NaiveDate,
        credential: &Credential,
    ) -> Result<RasterImage, SourceError> {
        let url = self.request_url(coordinate, date, credential);
        let request_label = self.redacted(&url);
        debug!(url = %request_label, "Requesting imagery");

        let (content_type, bytes) = self.get_bytes(url).await?;

        match self.interpret(content_type.as_deref(), bytes)? {
            ProviderBody::Raster(bytes) => {
                debug!(bytes = bytes.len(), "Provider returned raster bytes");
                Ok(decode_raster(&bytes, &request_label)?)
            }
            ProviderBody::Pointer(image_url) => {
                info!(image_url = %image_url, "Resolving image reference");
                let (_, bytes) = self.get_bytes(image_url.clone()).await?;
                if bytes.is_empty() {
                    return Err(AcquisitionError::no_imagery("image reference resolved to an empty body").into());
                }
                Ok(decode_raster(&bytes, image_url.as_str())?)
            }
        }
    }

    fn name(&self) -> &str {
        match self.config.profile {
            ProviderProfile::EarthAssets => "earth-assets",
            ProviderProfile::DirectDownload => "direct-download",
        }
    }
}
