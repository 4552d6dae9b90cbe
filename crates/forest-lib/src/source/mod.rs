//! Satellite image acquisition
//!
//! An [`ImageSource`] turns (coordinate, date, credential) into a decoded
//! [`RasterImage`]. Provider failures and "nothing to fetch" are reported as
//! [`AcquisitionError`]; bytes that are not a raster are a [`DecodeError`].

mod http;

pub use http::{HttpImageSource, ProviderConfig, ProviderProfile, DEFAULT_RESOLUTION_DEG};

use crate::error::{AcquisitionError, DecodeError, StageError};
use crate::models::{Coordinate, Credential, ImageProvenance, RasterImage};
use chrono::{NaiveDate, Utc};
use thiserror::Error;

pub use async_trait::async_trait;

/// Failure from an image source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

impl From<SourceError> for StageError {
    fn from(err: SourceError) -> Self {
        match err {
            SourceError::Acquisition(e) => StageError::Acquisition(e),
            SourceError::Decode(e) => StageError::Decode(e),
        }
    }
}

/// Trait for imagery providers
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Fetch and decode the image for a site and day
    async fn fetch(
        &self,
        coordinate: Coordinate,
        date: NaiveDate,
        credential: &Credential,
    ) -> Result<RasterImage, SourceError>;

    /// Short identifier for logs
    fn name(&self) -> &str;
}

/// Decode raster bytes fetched from `url`
pub fn decode_raster(bytes: &[u8], url: &str) -> Result<RasterImage, DecodeError> {
    let image = image::load_from_memory(bytes).map_err(|e| DecodeError {
        url: url.to_string(),
        reason: e.to_string(),
    })?;

    Ok(RasterImage::new(
        image,
        ImageProvenance {
            url: url.to_string(),
            fetched_at: Utc::now(),
        },
    ))
}

/// True if the bytes start with a known raster signature
pub fn looks_like_raster(bytes: &[u8]) -> bool {
    image::guess_format(bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use std::io::Cursor;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbImage::from_pixel(width, height, Rgb([40, 110, 35]));
        let mut buf = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(img)
            .write_to(&mut buf, ImageFormat::Png)
            .unwrap();
        buf.into_inner()
    }

    #[test]
    fn test_decode_png() {
        let bytes = png_bytes(8, 4);
        assert!(looks_like_raster(&bytes));

        let raster = decode_raster(&bytes, "https://example.test/a.png").unwrap();
        assert_eq!((raster.width(), raster.height()), (8, 4));
        assert_eq!(raster.provenance().url, "https://example.test/a.png");
    }

    #[test]
    fn test_decode_garbage_is_decode_error() {
        let bytes = b"definitely not an image";
        assert!(!looks_like_raster(bytes));

        let err = decode_raster(bytes, "https://example.test/x").unwrap_err();
        assert_eq!(err.url, "https://example.test/x");
    }
}
