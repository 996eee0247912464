//! DINOv2 vision transformer in the Hugging Face checkpoint layout.
//!
//! Only the backbone is built: `forward` returns the last hidden state
//! `[batch, 1 + patches, hidden]`, which is what the embedder flattens.

use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{conv2d, layer_norm, linear, linear_b, Conv2d, Conv2dConfig, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info};

use crate::hub::fetch_model_files;
use crate::processor::ImageProcessor;
use crate::{ImageEmbedder, ProviderError};

#[derive(Debug, Clone, Deserialize)]
pub struct Dinov2Config {
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    #[serde(default = "default_mlp_ratio")]
    pub mlp_ratio: f64,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_patch_size")]
    pub patch_size: usize,
    #[serde(default = "default_image_size")]
    pub image_size: usize,
    #[serde(default = "default_num_channels")]
    pub num_channels: usize,
    #[serde(default = "default_qkv_bias")]
    pub qkv_bias: bool,
    #[serde(default)]
    pub use_swiglu_ffn: bool,
}

fn default_mlp_ratio() -> f64 {
    4.0
}
fn default_layer_norm_eps() -> f64 {
    1e-6
}
fn default_patch_size() -> usize {
    14
}
fn default_image_size() -> usize {
    518
}
fn default_num_channels() -> usize {
    3
}
fn default_qkv_bias() -> bool {
    true
}

impl Dinov2Config {
    pub fn from_file(path: &Path) -> Result<Self, ProviderError> {
        let raw = std::fs::read(path).map_err(|source| ProviderError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_slice(&raw).map_err(|source| ProviderError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ProviderError> {
        if self.num_attention_heads == 0 || self.hidden_size % self.num_attention_heads != 0 {
            return Err(ProviderError::Config(format!(
                "hidden_size {} is not divisible by num_attention_heads {}",
                self.hidden_size, self.num_attention_heads
            )));
        }
        if self.patch_size == 0 || self.image_size < self.patch_size {
            return Err(ProviderError::Config(format!(
                "image_size {} cannot hold patches of size {}",
                self.image_size, self.patch_size
            )));
        }
        Ok(())
    }

    fn pretrain_grid(&self) -> usize {
        self.image_size / self.patch_size
    }
}

struct Embeddings {
    cls_token: Tensor,
    position_embeddings: Tensor,
    projection: Conv2d,
    pretrain_grid: usize,
    hidden_size: usize,
    resized_positions: Mutex<HashMap<(usize, usize), Tensor>>,
}

impl Embeddings {
    fn new(cfg: &Dinov2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let grid = cfg.pretrain_grid();
        let cls_token = vb.get((1, 1, cfg.hidden_size), "cls_token")?;
        let position_embeddings =
            vb.get((1, grid * grid + 1, cfg.hidden_size), "position_embeddings")?;
        let conv_cfg = Conv2dConfig {
            stride: cfg.patch_size,
            ..Default::default()
        };
        let projection = conv2d(
            cfg.num_channels,
            cfg.hidden_size,
            cfg.patch_size,
            conv_cfg,
            vb.pp("patch_embeddings").pp("projection"),
        )?;
        Ok(Self {
            cls_token,
            position_embeddings,
            projection,
            pretrain_grid: grid,
            hidden_size: cfg.hidden_size,
            resized_positions: Mutex::new(HashMap::new()),
        })
    }

    fn forward(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        let batch = pixel_values.dim(0)?;
        let patches = self.projection.forward(pixel_values)?;
        let (_, _, grid_h, grid_w) = patches.dims4()?;
        let patches = patches.flatten_from(2)?.transpose(1, 2)?;
        let cls = self
            .cls_token
            .to_dtype(patches.dtype())?
            .broadcast_as((batch, 1, self.hidden_size))?
            .contiguous()?;
        let tokens = Tensor::cat(&[&cls, &patches], 1)?;
        let positions = self.positions_for(grid_h, grid_w)?.to_dtype(tokens.dtype())?;
        tokens.broadcast_add(&positions)
    }

    /// Position embeddings resized from the pretraining grid to `grid_h x grid_w`.
    fn positions_for(&self, grid_h: usize, grid_w: usize) -> candle_core::Result<Tensor> {
        if grid_h == self.pretrain_grid && grid_w == self.pretrain_grid {
            return Ok(self.position_embeddings.clone());
        }
        let mut resized = self
            .resized_positions
            .lock()
            .map_err(|_| candle_core::Error::Msg("position cache poisoned".into()))?;
        if let Some(hit) = resized.get(&(grid_h, grid_w)) {
            return Ok(hit.clone());
        }

        let device = self.position_embeddings.device();
        let dtype = self.position_embeddings.dtype();
        let cls_pos = self.position_embeddings.i((.., 0..1, ..))?;
        let patch_pos = self
            .position_embeddings
            .i((.., 1.., ..))?
            .to_dtype(DType::F32)?
            .to_device(&Device::Cpu)?
            .flatten_all()?
            .to_vec1::<f32>()?;
        let grid = self.pretrain_grid;
        let interpolated = bicubic_resize(
            &patch_pos,
            (grid, grid),
            (grid_h, grid_w),
            self.hidden_size,
        );
        let patch_pos = Tensor::from_vec(interpolated, (1, grid_h * grid_w, self.hidden_size), device)?
            .to_dtype(dtype)?;
        let positions = Tensor::cat(&[&cls_pos, &patch_pos], 1)?;
        debug!(grid_h, grid_w, "interpolated position embeddings");
        resized.insert((grid_h, grid_w), positions.clone());
        Ok(positions)
    }
}

/// Resizes a `[src_h * src_w, channels]` grid to `[dst_h * dst_w, channels]`
/// with antialiased bicubic filtering, as torch's
/// `interpolate(mode="bicubic", antialias=True)` does: a = -0.5, half-pixel
/// centers, support widened by the downscale factor, normalized weights.
pub fn bicubic_resize(
    values: &[f32],
    (src_h, src_w): (usize, usize),
    (dst_h, dst_w): (usize, usize),
    channels: usize,
) -> Vec<f32> {
    let cols = filter_taps(src_w, dst_w);
    let rows = filter_taps(src_h, dst_h);

    let mut horizontal = vec![0f32; src_h * dst_w * channels];
    for y in 0..src_h {
        for (x, taps) in cols.iter().enumerate() {
            let dst = &mut horizontal[(y * dst_w + x) * channels..(y * dst_w + x + 1) * channels];
            for &(sx, weight) in taps {
                let src = &values[(y * src_w + sx) * channels..(y * src_w + sx + 1) * channels];
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += weight * s;
                }
            }
        }
    }

    let mut out = vec![0f32; dst_h * dst_w * channels];
    for (y, taps) in rows.iter().enumerate() {
        for x in 0..dst_w {
            let dst = &mut out[(y * dst_w + x) * channels..(y * dst_w + x + 1) * channels];
            for &(sy, weight) in taps {
                let src = &horizontal[(sy * dst_w + x) * channels..(sy * dst_w + x + 1) * channels];
                for (d, s) in dst.iter_mut().zip(src) {
                    *d += weight * s;
                }
            }
        }
    }
    out
}

/// Source indices and normalized weights for every output position along one axis.
fn filter_taps(src_len: usize, dst_len: usize) -> Vec<Vec<(usize, f32)>> {
    let scale = src_len as f64 / dst_len as f64;
    let support_scale = scale.max(1.0);
    let support = 2.0 * support_scale;
    (0..dst_len)
        .map(|i| {
            let center = scale * (i as f64 + 0.5);
            let start = ((center - support + 0.5) as i64).max(0) as usize;
            let end = ((center + support + 0.5) as i64).min(src_len as i64).max(0) as usize;
            let taps: Vec<(usize, f64)> = (start..end)
                .map(|j| (j, cubic((j as f64 - center + 0.5) / support_scale)))
                .collect();
            let total: f64 = taps.iter().map(|(_, w)| w).sum();
            taps.into_iter()
                .map(|(j, w)| (j, if total != 0.0 { (w / total) as f32 } else { 0.0 }))
                .collect()
        })
        .collect()
}

fn cubic(x: f64) -> f64 {
    const A: f64 = -0.5;
    let x = x.abs();
    if x < 1.0 {
        ((A + 2.0) * x - (A + 3.0)) * x * x + 1.0
    } else if x < 2.0 {
        (((x - 5.0) * x + 8.0) * x - 4.0) * A
    } else {
        0.0
    }
}

struct Attention {
    query: Linear,
    key: Linear,
    value: Linear,
    output: Linear,
    num_heads: usize,
    head_dim: usize,
    scale: f64,
}

impl Attention {
    fn new(cfg: &Dinov2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = cfg.hidden_size;
        let inner = vb.pp("attention");
        let head_dim = hidden / cfg.num_attention_heads;
        Ok(Self {
            query: linear_b(hidden, hidden, cfg.qkv_bias, inner.pp("query"))?,
            key: linear_b(hidden, hidden, cfg.qkv_bias, inner.pp("key"))?,
            value: linear_b(hidden, hidden, cfg.qkv_bias, inner.pp("value"))?,
            output: linear(hidden, hidden, vb.pp("output").pp("dense"))?,
            num_heads: cfg.num_attention_heads,
            head_dim,
            scale: 1.0 / (head_dim as f64).sqrt(),
        })
    }

    fn split_heads(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, tokens, _) = xs.dims3()?;
        xs.reshape((batch, tokens, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (batch, tokens, hidden) = xs.dims3()?;
        let q = self.split_heads(&self.query.forward(xs)?)?;
        let k = self.split_heads(&self.key.forward(xs)?)?;
        let v = self.split_heads(&self.value.forward(xs)?)?;
        let scores = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;
        let weights = candle_nn::ops::softmax_last_dim(&scores)?;
        let context = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, tokens, hidden))?;
        self.output.forward(&context)
    }
}

struct LayerScale {
    lambda: Tensor,
}

impl LayerScale {
    fn new(hidden: usize, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            lambda: vb.get(hidden, "lambda1")?,
        })
    }
}

impl Module for LayerScale {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        xs.broadcast_mul(&self.lambda)
    }
}

enum FeedForward {
    Mlp { fc1: Linear, fc2: Linear },
    SwiGlu { weights_in: Linear, weights_out: Linear },
}

impl FeedForward {
    fn new(cfg: &Dinov2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = cfg.hidden_size;
        let inner = (hidden as f64 * cfg.mlp_ratio) as usize;
        if cfg.use_swiglu_ffn {
            let inner = ((inner * 2 / 3) + 7) / 8 * 8;
            Ok(Self::SwiGlu {
                weights_in: linear(hidden, 2 * inner, vb.pp("weights_in"))?,
                weights_out: linear(inner, hidden, vb.pp("weights_out"))?,
            })
        } else {
            Ok(Self::Mlp {
                fc1: linear(hidden, inner, vb.pp("fc1"))?,
                fc2: linear(inner, hidden, vb.pp("fc2"))?,
            })
        }
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Self::Mlp { fc1, fc2 } => fc2.forward(&fc1.forward(xs)?.gelu_erf()?),
            Self::SwiGlu {
                weights_in,
                weights_out,
            } => {
                let projected = weights_in.forward(xs)?;
                let halves = projected.chunk(2, D::Minus1)?;
                let gated = (halves[0].silu()? * &halves[1])?;
                weights_out.forward(&gated)
            }
        }
    }
}

struct Block {
    norm1: LayerNorm,
    attention: Attention,
    layer_scale1: LayerScale,
    norm2: LayerNorm,
    mlp: FeedForward,
    layer_scale2: LayerScale,
}

impl Block {
    fn new(cfg: &Dinov2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let hidden = cfg.hidden_size;
        Ok(Self {
            norm1: layer_norm(hidden, cfg.layer_norm_eps, vb.pp("norm1"))?,
            attention: Attention::new(cfg, vb.pp("attention"))?,
            layer_scale1: LayerScale::new(hidden, vb.pp("layer_scale1"))?,
            norm2: layer_norm(hidden, cfg.layer_norm_eps, vb.pp("norm2"))?,
            mlp: FeedForward::new(cfg, vb.pp("mlp"))?,
            layer_scale2: LayerScale::new(hidden, vb.pp("layer_scale2"))?,
        })
    }
}

impl Module for Block {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let attended = self
            .layer_scale1
            .forward(&self.attention.forward(&self.norm1.forward(xs)?)?)?;
        let xs = (xs + attended)?;
        let fed = self
            .layer_scale2
            .forward(&self.mlp.forward(&self.norm2.forward(&xs)?)?)?;
        xs + fed
    }
}

pub struct Dinov2Model {
    embeddings: Embeddings,
    layers: Vec<Block>,
    layernorm: LayerNorm,
}

impl Dinov2Model {
    pub fn new(cfg: &Dinov2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        // Checkpoints saved from a task head nest the backbone under `dinov2`.
        let vb = if vb.contains_tensor("embeddings.cls_token") {
            vb
        } else {
            vb.pp("dinov2")
        };
        let embeddings = Embeddings::new(cfg, vb.pp("embeddings"))?;
        let encoder = vb.pp("encoder").pp("layer");
        let layers = (0..cfg.num_hidden_layers)
            .map(|i| Block::new(cfg, encoder.pp(i)))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let layernorm = layer_norm(cfg.hidden_size, cfg.layer_norm_eps, vb.pp("layernorm"))?;
        Ok(Self {
            embeddings,
            layers,
            layernorm,
        })
    }
}

impl Module for Dinov2Model {
    /// `pixel_values: [batch, channels, H, W]` -> last hidden state.
    fn forward(&self, pixel_values: &Tensor) -> candle_core::Result<Tensor> {
        let mut xs = self.embeddings.forward(pixel_values)?;
        for layer in &self.layers {
            xs = layer.forward(&xs)?;
        }
        self.layernorm.forward(&xs)
    }
}

/// [`ImageEmbedder`] returning the flattened DINOv2 last hidden state.
pub struct Dinov2Embedder {
    model: Dinov2Model,
    processor: ImageProcessor,
    device: Device,
    dtype: DType,
}

impl Dinov2Embedder {
    pub fn new(model: Dinov2Model, processor: ImageProcessor, device: Device, dtype: DType) -> Self {
        Self {
            model,
            processor,
            device,
            dtype,
        }
    }

    /// Loads config, processor and weights for `model_id` onto `device`.
    pub fn load(model_id: &str, revision: &str, device: &Device, dtype: DType) -> Result<Self, ProviderError> {
        let files = fetch_model_files(model_id, revision)?;
        let config = Dinov2Config::from_file(&files.config)?;
        let processor = match &files.preprocessor {
            Some(path) => ImageProcessor::from_file(path)?,
            None => ImageProcessor::default(),
        };
        info!(
            model = model_id,
            layers = config.num_hidden_layers,
            hidden = config.hidden_size,
            ?dtype,
            "loading DINOv2 weights"
        );
        // SAFETY: the weight files are only read and are not modified while mapped.
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&files.weights, dtype, device)? };
        let model = Dinov2Model::new(&config, vb)?;
        Ok(Self::new(model, processor, device.clone(), dtype))
    }
}

impl ImageEmbedder for Dinov2Embedder {
    fn embed(&self, path: &Path) -> Result<Vec<f32>, ProviderError> {
        let pixels = self.processor.load(path, &self.device)?.to_dtype(self.dtype)?;
        let hidden = self.model.forward(&pixels)?;
        Ok(hidden.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::{CropSize, ProcessorConfig};
    use image::{Rgb, RgbImage};

    fn tiny_config(use_swiglu_ffn: bool) -> Dinov2Config {
        serde_json::from_value(serde_json::json!({
            "hidden_size": 8,
            "num_hidden_layers": 2,
            "num_attention_heads": 2,
            "patch_size": 4,
            "image_size": 16,
            "use_swiglu_ffn": use_swiglu_ffn,
        }))
        .unwrap()
    }

    #[test]
    fn config_defaults_follow_dinov2() {
        let cfg = tiny_config(false);
        assert_eq!(cfg.mlp_ratio, 4.0);
        assert_eq!(cfg.num_channels, 3);
        assert!(cfg.qkv_bias);
        assert_eq!(cfg.pretrain_grid(), 4);
    }

    #[test]
    fn indivisible_heads_are_rejected() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"hidden_size": 10, "num_hidden_layers": 1, "num_attention_heads": 3}"#,
        )
        .unwrap();
        assert!(matches!(
            Dinov2Config::from_file(&path),
            Err(ProviderError::Config(_))
        ));
    }

    #[test]
    fn last_hidden_state_has_cls_plus_patch_tokens() {
        for swiglu in [false, true] {
            let cfg = tiny_config(swiglu);
            let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
            let model = Dinov2Model::new(&cfg, vb).unwrap();

            // Pretraining grid: 16 / 4 = 4x4 patches.
            let pixels = Tensor::zeros((1, 3, 16, 16), DType::F32, &Device::Cpu).unwrap();
            assert_eq!(model.forward(&pixels).unwrap().dims(), &[1, 17, 8]);

            // Smaller input goes through position interpolation: 2x3 patches.
            let pixels = Tensor::zeros((1, 3, 8, 12), DType::F32, &Device::Cpu).unwrap();
            assert_eq!(model.forward(&pixels).unwrap().dims(), &[1, 7, 8]);
        }
    }

    #[test]
    fn embedder_flattens_the_hidden_state() {
        let cfg = tiny_config(false);
        let model = Dinov2Model::new(&cfg, VarBuilder::zeros(DType::F32, &Device::Cpu)).unwrap();
        let processor = ImageProcessor::new(ProcessorConfig {
            crop_size: CropSize {
                height: 16,
                width: 16,
            },
            size: crate::processor::ResizeTarget {
                shortest_edge: Some(16),
                ..Default::default()
            },
            ..Default::default()
        });
        let embedder = Dinov2Embedder::new(model, processor, Device::Cpu, DType::F32);

        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("red.png");
        RgbImage::from_pixel(20, 24, Rgb([200, 10, 10])).save(&path).unwrap();

        let first = embedder.embed(&path).unwrap();
        assert_eq!(first.len(), 17 * 8);
        assert_eq!(first, embedder.embed(&path).unwrap());
    }

    #[test]
    fn bicubic_resize_preserves_constant_grids() {
        let values = vec![2.5f32; 4 * 4 * 3];
        let out = bicubic_resize(&values, (4, 4), (2, 3), 3);
        assert_eq!(out.len(), 2 * 3 * 3);
        for v in out {
            assert!((v - 2.5).abs() < 1e-5, "{v}");
        }
    }

    #[test]
    fn bicubic_resize_same_size_is_identity() {
        let values: Vec<f32> = (0..9).map(|v| v as f32).collect();
        let out = bicubic_resize(&values, (3, 3), (3, 3), 1);
        for (a, b) in out.iter().zip(&values) {
            assert!((a - b).abs() < 1e-5, "{a} vs {b}");
        }
    }

    #[test]
    fn bicubic_downscale_widens_the_filter() {
        // 4 -> 2: each output averages over all four inputs, so the ramp is
        // pulled toward its middle instead of landing on 0.5 and 2.5.
        let out = bicubic_resize(&[0.0, 1.0, 2.0, 3.0], (1, 4), (1, 2), 1);
        let expected = 1.109_375 / 1.890_625;
        assert!((out[0] - expected).abs() < 1e-5, "{out:?}");
        assert!((out[0] + out[1] - 3.0).abs() < 1e-5, "{out:?}");
    }
}
