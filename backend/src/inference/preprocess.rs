use image::imageops::FilterType;
use image::{DynamicImage, ImageReader};
use ndarray::Array4;
use std::io::Cursor;
use std::path::Path;

use crate::config::{ImageConfig, ResizeMethod};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Unsupported or corrupt image: {0}")]
    Image(#[from] image::ImageError),
}

/// A model-ready input tensor with shape `(1, channels, height, width)`.
/// Dropping it frees the decode buffer.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    tensor: Array4<f32>,
}

impl DecodedImage {
    pub fn new(tensor: Array4<f32>) -> Self {
        Self { tensor }
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    pub fn as_slice(&self) -> Option<&[f32]> {
        self.tensor.as_slice()
    }

    pub fn tensor(&self) -> &Array4<f32> {
        &self.tensor
    }
}

impl From<ResizeMethod> for FilterType {
    fn from(method: ResizeMethod) -> Self {
        match method {
            ResizeMethod::Nearest => FilterType::Nearest,
            ResizeMethod::Triangle => FilterType::Triangle,
            ResizeMethod::CatmullRom => FilterType::CatmullRom,
            ResizeMethod::Gaussian => FilterType::Gaussian,
            ResizeMethod::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    channels: usize,
    filter: FilterType,
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Preprocessor {
    /// Expects a validated [`ImageConfig`].
    pub fn new(config: &ImageConfig) -> Self {
        Self {
            width: config.size.first().copied().unwrap_or(224),
            height: config.size.get(1).copied().unwrap_or(224),
            channels: config.channels as usize,
            filter: config.preprocessing.resize_method.into(),
            mean: config.normalization.mean.clone(),
            std: config.normalization.std.clone(),
        }
    }

    /// Decodes a staged file. The format is sniffed from the content, not the
    /// extension.
    pub fn decode_file(&self, path: &Path) -> Result<DecodedImage, DecodeError> {
        let image = ImageReader::open(path)?.with_guessed_format()?.decode()?;
        Ok(self.prepare(&image))
    }

    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<DecodedImage, DecodeError> {
        let image = ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()?
            .decode()?;
        Ok(self.prepare(&image))
    }

    fn prepare(&self, image: &DynamicImage) -> DecodedImage {
        let resized = image.resize_exact(self.width, self.height, self.filter);
        let shape = (1, self.channels, self.height as usize, self.width as usize);

        let tensor = if self.channels == 1 {
            let luma = resized.to_luma8();
            Array4::from_shape_fn(shape, |(_, _, y, x)| {
                self.normalize(0, luma.get_pixel(x as u32, y as u32)[0])
            })
        } else {
            let rgb = resized.to_rgb8();
            Array4::from_shape_fn(shape, |(_, c, y, x)| {
                self.normalize(c, rgb.get_pixel(x as u32, y as u32)[c])
            })
        };
        DecodedImage::new(tensor)
    }

    fn normalize(&self, channel: usize, value: u8) -> f32 {
        (value as f32 / 255.0 - self.mean[channel]) / self.std[channel]
    }
}
