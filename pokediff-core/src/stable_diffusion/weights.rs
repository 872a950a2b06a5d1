//! Resolving component checkpoints and converting them to the pipeline
//! precision.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::api::tokio::ApiRepo;

use crate::Precision;

/// A pipeline component and the files it may be published as, most
/// preferred first.
#[derive(Debug, Clone, Copy)]
pub struct Component {
    pub name: &'static str,
    pub candidates: &'static [&'static str],
}

pub const TEXT_ENCODER: Component = Component {
    name: "text_encoder",
    candidates: &["text_encoder/model.safetensors", "text_encoder/pytorch_model.bin"],
};

pub const UNET: Component = Component {
    name: "unet",
    candidates: &[
        "unet/diffusion_pytorch_model.safetensors",
        "unet/diffusion_pytorch_model.bin",
    ],
};

pub const VAE: Component = Component {
    name: "vae",
    candidates: &[
        "vae/diffusion_pytorch_model.safetensors",
        "vae/diffusion_pytorch_model.bin",
    ],
};

/// Downloads (or finds in the cache) the first available checkpoint.
pub async fn fetch(repo: &ApiRepo, component: Component) -> Result<PathBuf> {
    let mut failures = Vec::new();
    for candidate in component.candidates {
        match repo.get(candidate).await {
            Ok(path) => {
                tracing::info!("{}: using {candidate}", component.name);
                return Ok(path);
            }
            Err(e) => failures.push(format!("{candidate}: {e}")),
        }
    }
    Err(anyhow!(
        "no weights found for {} ({})",
        component.name,
        failures.join("; ")
    ))
}

/// Where the converted checkpoint of `component` lives inside the cache.
pub fn converted_path(
    cache_dir: &Path,
    revision: &str,
    component: Component,
    precision: Precision,
) -> PathBuf {
    cache_dir
        .join("converted")
        .join(revision)
        .join(format!("{}-{precision}.safetensors", component.name))
}

/// Loads every tensor of a safetensors or PyTorch pickle checkpoint on the CPU.
pub fn read_tensors(path: &Path) -> Result<Vec<(String, Tensor)>> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => Ok(candle_core::safetensors::load(path, &Device::Cpu)?
            .into_iter()
            .collect()),
        Some("bin" | "pt" | "pth") => Ok(candle_core::pickle::read_all(path)?),
        _ => anyhow::bail!("unsupported checkpoint format: {}", path.display()),
    }
}

/// Casts the floating point tensors of `src` to `dtype` and writes them to
/// `dst` as safetensors. Integer tensors (e.g. position ids) are kept as-is.
///
/// The output is written next to `dst` and renamed into place, so `dst`
/// either does not exist or is complete.
pub fn convert(src: &Path, dst: &Path, dtype: DType) -> Result<()> {
    let tensors = read_tensors(src).with_context(|| format!("failed to read {}", src.display()))?;
    let converted = tensors
        .into_iter()
        .map(|(name, tensor)| -> Result<(String, Tensor)> {
            let tensor = if tensor.dtype().is_float() {
                tensor.to_dtype(dtype)?
            } else {
                tensor
            };
            Ok((name, tensor))
        })
        .collect::<Result<HashMap<String, Tensor>>>()?;

    if let Some(parent) = dst.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let partial = dst.with_extension("safetensors.partial");
    candle_core::safetensors::save(&converted, &partial)
        .with_context(|| format!("failed to write {}", partial.display()))?;
    std::fs::rename(&partial, dst)
        .with_context(|| format!("failed to move {} into place", dst.display()))?;
    Ok(())
}

/// Returns the converted checkpoint, converting on the blocking pool the
/// first time.
pub async fn prepare(src: PathBuf, dst: PathBuf, precision: Precision) -> Result<PathBuf> {
    if dst.is_file() {
        tracing::info!("reusing converted weights {}", dst.display());
        return Ok(dst);
    }
    tracing::info!("converting {} to {precision}", src.display());
    let target = dst.clone();
    tokio::task::spawn_blocking(move || convert(&src, &target, precision.dtype()))
        .await
        .context("weight conversion task panicked")??;
    Ok(dst)
}
