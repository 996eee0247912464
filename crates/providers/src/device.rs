use candle_core::{DType, Device};
use tracing::{info, warn};

use crate::ProviderError;

/// Picks the compute device for the whole run.
///
/// A GPU is used when the build supports one and the requested ordinal opens;
/// otherwise the run continues on the CPU.
pub fn select_device(ordinal: usize) -> Device {
    let gpu = if candle_core::utils::cuda_is_available() {
        usable("CUDA", ordinal, Device::new_cuda(ordinal))
    } else if candle_core::utils::metal_is_available() {
        usable("Metal", ordinal, Device::new_metal(ordinal))
    } else {
        warn!("GPU not found; using CPU instead!");
        None
    };
    gpu.unwrap_or(Device::Cpu)
}

fn usable(kind: &str, ordinal: usize, opened: candle_core::Result<Device>) -> Option<Device> {
    match opened {
        Ok(device) => {
            info!("Using {kind} device {ordinal}");
            Some(device)
        }
        Err(err) => {
            warn!("{kind} device {ordinal} unavailable ({err}); using CPU instead!");
            None
        }
    }
}

/// Parses a weight precision name (`f32`, `f16`, `bf16`).
pub fn parse_dtype(name: &str) -> Result<DType, ProviderError> {
    match name.to_ascii_lowercase().as_str() {
        "f32" | "float32" => Ok(DType::F32),
        "f16" | "float16" => Ok(DType::F16),
        "bf16" | "bfloat16" => Ok(DType::BF16),
        other => Err(ProviderError::Config(format!("unsupported dtype {other:?}"))),
    }
}
