//! Raster to tensor conversion
//!
//! Produces the fixed-shape NCHW float tensor a scoring model consumes:
//! resize to a square, drop alpha, scale to [0, 1], then normalise each
//! channel with the configured mean and standard deviation.

use crate::error::PreprocessError;
use crate::models::RasterImage;
use image::imageops::FilterType;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Channels the classifier expects
pub const INPUT_CHANNELS: usize = 3;

/// Default model input edge length
pub const DEFAULT_TARGET_SIZE: u32 = 224;

/// Resampling filter used when resizing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResizeFilter {
    Nearest,
    #[default]
    Triangle,
    CatmullRom,
    Lanczos3,
}

impl From<ResizeFilter> for FilterType {
    fn from(filter: ResizeFilter) -> Self {
        match filter {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Triangle => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

/// Preprocessing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub target_size: u32,
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub filter: ResizeFilter,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        // ViT-style processors map [0, 1] to [-1, 1]
        Self {
            target_size: DEFAULT_TARGET_SIZE,
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
            filter: ResizeFilter::Triangle,
        }
    }
}

/// Dense f32 tensor in NCHW layout
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl ImageTensor {
    pub fn new(shape: [usize; 4], data: Vec<f32>) -> Result<Self, PreprocessError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(PreprocessError::Config(format!(
                "tensor shape {:?} needs {} values, got {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// Values of one channel of the first batch item, `None` past the last channel
    pub fn channel(&self, c: usize) -> Option<&[f32]> {
        if c >= self.shape[1] {
            return None;
        }
        let plane = self.shape[2] * self.shape[3];
        self.data.get(c * plane..(c + 1) * plane)
    }
}

/// Turns rasters into classifier input
#[derive(Debug, Clone, Default)]
pub struct Preprocessor {
    config: PreprocessConfig,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Result<Self, PreprocessError> {
        if config.target_size == 0 {
            return Err(PreprocessError::Config("target_size must be positive".into()));
        }
        if let Some(s) = config.std.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
            return Err(PreprocessError::Config(format!(
                "channel std must be positive, got {}",
                s
            )));
        }
        if config.mean.iter().any(|m| !m.is_finite()) {
            return Err(PreprocessError::Config("channel mean must be finite".into()));
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Shape of every tensor this preprocessor produces
    pub fn output_shape(&self) -> [usize; 4] {
        let size = self.config.target_size as usize;
        [1, INPUT_CHANNELS, size, size]
    }

    /// Convert a raster into a normalised tensor
    pub fn prepare(&self, raster: &RasterImage) -> Result<ImageTensor, PreprocessError> {
        let (width, height) = (raster.width(), raster.height());
        if width == 0 || height == 0 {
            return Err(PreprocessError::ZeroArea { width, height });
        }

        let color = raster.image().color();
        let channels = color.channel_count();
        let colour_channels = channels - u8::from(color.has_alpha());
        if colour_channels as usize != INPUT_CHANNELS {
            return Err(PreprocessError::UnsupportedChannels {
                color: format!("{:?}", color),
                channels,
            });
        }

        let size = self.config.target_size;
        let rgb = raster
            .image()
            .resize_exact(size, size, self.config.filter.into())
            .to_rgb8();

        let plane = (size as usize) * (size as usize);
        let mut data = vec![0f32; INPUT_CHANNELS * plane];
        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..INPUT_CHANNELS {
                let value = pixel.0[c] as f32 / 255.0;
                data[c * plane + i] = (value - self.config.mean[c]) / self.config.std[c];
            }
        }

        debug!(
            source_width = width,
            source_height = height,
            target = size,
            "Prepared image tensor"
        );

        ImageTensor::new(self.output_shape(), data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ImageProvenance;
    use chrono::Utc;
    use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage, Rgba, RgbaImage};

    fn raster(image: DynamicImage) -> RasterImage {
        RasterImage::new(
            image,
            ImageProvenance {
                url: "memory://test".into(),
                fetched_at: Utc::now(),
            },
        )
    }

    #[test]
    fn test_rgb_image_becomes_fixed_shape_tensor() {
        let img = RgbImage::from_pixel(256, 256, Rgb([255, 0, 128]));
        let tensor = Preprocessor::default()
            .prepare(&raster(DynamicImage::ImageRgb8(img)))
            .unwrap();

        assert_eq!(tensor.shape(), [1, 3, 224, 224]);
        assert_eq!(tensor.data().len(), 3 * 224 * 224);
        // 255 -> 1.0, 0 -> -1.0 with mean/std 0.5
        assert!(tensor.channel(0).unwrap().iter().all(|v| (v - 1.0).abs() < 0.01));
        assert!(tensor.channel(1).unwrap().iter().all(|v| (v + 1.0).abs() < 0.01));
        let blue = 128.0 / 255.0;
        assert!(tensor
            .channel(2)
            .unwrap()
            .iter()
            .all(|v| (v - (blue - 0.5) / 0.5).abs() < 0.01));
    }

    #[test]
    fn test_channel_past_last_is_none() {
        let tensor = ImageTensor::new([1, 3, 2, 2], (0..12).map(|v| v as f32).collect()).unwrap();
        assert_eq!(tensor.channel(2), Some(&[8.0, 9.0, 10.0, 11.0][..]));
        assert_eq!(tensor.channel(3), None);
    }

    #[test]
    fn test_non_square_input_is_resized() {
        let img = RgbImage::from_pixel(640, 120, Rgb([10, 200, 10]));
        let pre = Preprocessor::new(PreprocessConfig {
            target_size: 64,
            ..Default::default()
        })
        .unwrap();
        let tensor = pre.prepare(&raster(DynamicImage::ImageRgb8(img))).unwrap();
        assert_eq!(tensor.shape(), [1, 3, 64, 64]);
    }

    #[test]
    fn test_alpha_channel_is_dropped() {
        let img = RgbaImage::from_pixel(32, 32, Rgba([0, 255, 0, 10]));
        let tensor = Preprocessor::default()
            .prepare(&raster(DynamicImage::ImageRgba8(img)))
            .unwrap();
        assert_eq!(tensor.shape()[1], 3);
    }

    #[test]
    fn test_grayscale_rejected() {
        let img = GrayImage::from_pixel(32, 32, Luma([100]));
        let err = Preprocessor::default()
            .prepare(&raster(DynamicImage::ImageLuma8(img)))
            .unwrap_err();
        assert!(matches!(
            err,
            PreprocessError::UnsupportedChannels { channels: 1, .. }
        ));
    }

    #[test]
    fn test_zero_area_rejected() {
        let err = Preprocessor::default()
            .prepare(&raster(DynamicImage::new_rgb8(0, 10)))
            .unwrap_err();
        assert_eq!(
            err,
            PreprocessError::ZeroArea {
                width: 0,
                height: 10
            }
        );
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(Preprocessor::new(PreprocessConfig {
            std: [0.5, 0.0, 0.5],
            ..Default::default()
        })
        .is_err());
        assert!(Preprocessor::new(PreprocessConfig {
            target_size: 0,
            ..Default::default()
        })
        .is_err());
    }
}
