//! Image preprocessing in the layout DINOv2 checkpoints expect:
//! shortest-edge resize, center crop, rescale, per-channel normalize.

use candle_core::{DType, Device, Tensor};
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Deserialize;
use std::path::Path;

use crate::ProviderError;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    pub do_resize: bool,
    pub size: ResizeTarget,
    pub do_center_crop: bool,
    pub crop_size: CropSize,
    pub do_rescale: bool,
    pub rescale_factor: f64,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResizeTarget {
    pub shortest_edge: Option<u32>,
    pub height: Option<u32>,
    pub width: Option<u32>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CropSize {
    pub height: u32,
    pub width: u32,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: ResizeTarget {
                shortest_edge: Some(256),
                ..Default::default()
            },
            do_center_crop: true,
            crop_size: CropSize::default(),
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.485, 0.456, 0.406],
            image_std: [0.229, 0.224, 0.225],
        }
    }
}

impl Default for CropSize {
    fn default() -> Self {
        Self {
            height: 224,
            width: 224,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ImageProcessor {
    config: ProcessorConfig,
}

impl ImageProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self { config }
    }

    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let raw = std::fs::read(path).map_err(|source| ProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_slice(&raw).map_err(|source| ProviderError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(config))
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Reads and preprocesses one image into a `[1, 3, H, W]` f32 tensor.
    pub fn load(&self, path: &Path, device: &Device) -> Result<Tensor, ProviderError> {
        let image = image::ImageReader::open(path)
            .map_err(|source| ProviderError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .with_guessed_format()
            .map_err(|source| ProviderError::Io {
                path: path.to_path_buf(),
                source,
            })?
            .decode()
            .map_err(|source| ProviderError::Image {
                path: path.to_path_buf(),
                source,
            })?;
        self.preprocess(&image, device)
    }

    pub fn preprocess(&self, image: &DynamicImage, device: &Device) -> Result<Tensor, ProviderError> {
        let cfg = &self.config;
        let mut image = DynamicImage::ImageRgb8(image.to_rgb8());

        if cfg.do_resize {
            let (width, height) = resize_dims(image.width(), image.height(), &cfg.size);
            if (width, height) != (image.width(), image.height()) {
                image = image.resize_exact(width, height, FilterType::CatmullRom);
            }
        }
        if cfg.do_center_crop {
            image = center_crop(image, cfg.crop_size);
        }

        let (width, height) = (image.width() as usize, image.height() as usize);
        let raw = image.to_rgb8().into_raw();
        let mut pixels = Tensor::from_vec(raw, (height, width, 3), &Device::Cpu)?
            .permute((2, 0, 1))?
            .to_dtype(DType::F32)?;
        if cfg.do_rescale {
            pixels = pixels.affine(cfg.rescale_factor, 0.)?;
        }
        if cfg.do_normalize {
            let mean = Tensor::new(&cfg.image_mean, &Device::Cpu)?.reshape((3, 1, 1))?;
            let std = Tensor::new(&cfg.image_std, &Device::Cpu)?.reshape((3, 1, 1))?;
            pixels = pixels.broadcast_sub(&mean)?.broadcast_div(&std)?;
        }
        Ok(pixels.unsqueeze(0)?.to_device(device)?)
    }
}

fn resize_dims(width: u32, height: u32, target: &ResizeTarget) -> (u32, u32) {
    if let Some(edge) = target.shortest_edge {
        if width <= height {
            let long = (edge as u64 * height as u64 / width.max(1) as u64) as u32;
            (edge, long)
        } else {
            let long = (edge as u64 * width as u64 / height.max(1) as u64) as u32;
            (long, edge)
        }
    } else {
        (
            target.width.unwrap_or(width),
            target.height.unwrap_or(height),
        )
    }
}

fn center_crop(image: DynamicImage, crop: CropSize) -> DynamicImage {
    let (width, height) = (image.width(), image.height());
    if width < crop.width || height < crop.height {
        return image.resize_exact(crop.width, crop.height, FilterType::CatmullRom);
    }
    let left = (width - crop.width) / 2;
    let top = (height - crop.height) / 2;
    image.crop_imm(left, top, crop.width, crop.height)
}
