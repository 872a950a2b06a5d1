use std::path::PathBuf;

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::DeviceMap;

pub const DEFAULT_MODEL_ID: &str = "lambdalabs/sd-pokemon-diffusers";
/// Pinned so that the same id always resolves to the same weights.
pub const DEFAULT_REVISION: &str = "6d2fb7c893aac58d79cc17e1b21ac0beeacc8338";
/// SD v1 uses the CLIP ViT-L/14 vocabulary; this repo ships it as `tokenizer.json`.
pub const DEFAULT_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
/// Token ids feed the text encoder, so the vocabulary is pinned like the weights.
pub const DEFAULT_TOKENIZER_REVISION: &str = "32bd64288804d66eefd0ccbe215aa642df71cc41";
pub const DEFAULT_CACHE_DIR: &str = "diffusers-cache";
pub const DEFAULT_IMAGE_SIZE: usize = 512;

/// Numeric precision the pipeline weights are converted to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F16,
    Bf16,
    F32,
}

serde_plain::derive_display_from_serialize!(Precision);
serde_plain::derive_fromstr_from_deserialize!(Precision);

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::F32 => DType::F32,
        }
    }

    /// Half precision kernels are only worth it on accelerators.
    pub fn for_device(self, device: &Device) -> Self {
        if device.is_cpu() && self != Precision::F32 {
            tracing::warn!("{self} is not supported on the CPU, falling back to f32");
            Precision::F32
        } else {
            self
        }
    }
}

/// Where the model comes from and where it is cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSource {
    pub model_id: String,
    pub revision: String,
    pub tokenizer_repo: String,
    pub tokenizer_revision: String,
    pub cache_dir: PathBuf,
}

impl Default for ModelSource {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            revision: DEFAULT_REVISION.to_string(),
            tokenizer_repo: DEFAULT_TOKENIZER_REPO.to_string(),
            tokenizer_revision: DEFAULT_TOKENIZER_REVISION.to_string(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
        }
    }
}

/// How the pipeline is built and placed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOptions {
    pub device_map: DeviceMap,
    pub precision: Precision,
    pub height: usize,
    pub width: usize,
    pub use_flash_attn: bool,
    /// The stock safety checker flags nearly every cartoon creature, so it is
    /// off unless asked for.
    pub content_filter_enabled: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            device_map: DeviceMap::default(),
            precision: Precision::default(),
            height: DEFAULT_IMAGE_SIZE,
            width: DEFAULT_IMAGE_SIZE,
            use_flash_attn: cfg!(feature = "flash-attn"),
            content_filter_enabled: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictorConfig {
    /// Directory receiving `out-<index>.png`.
    pub scratch_dir: PathBuf,
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
        }
    }
}

/// Everything [`crate::setup`] needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub source: ModelSource,
    pub pipeline: PipelineOptions,
    pub predictor: PredictorConfig,
}
