pub mod config;
pub mod device_map;
pub mod generator;
pub mod loader;
pub mod output;
pub mod schema;
pub mod stable_diffusion;

mod error;
mod predictor;
mod request;
mod util;

use anyhow::Result;
use candle_core::Device;
use image::DynamicImage;

pub use config::*;
pub use device_map::*;
pub use error::PredictError;
pub use generator::Generator;
pub use loader::*;
pub use predictor::{Prediction, Predictor};
pub use request::{PredictionRequest, PredictionRequestBuilder};
pub use schema::{ValidationError, PREDICT_INPUTS};
pub use stable_diffusion::{StableDiffusionLoader, StableDiffusionPipeline};
pub use util::*;

/// One batched call into a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// One prompt per output image.
    pub prompts: Vec<String>,
    pub guidance_scale: f64,
    pub num_inference_steps: usize,
}

/// A loaded text-to-image model bound to a device.
///
/// `generate` takes `&self`: a pipeline is never mutated after load, all
/// per-call state (scheduler, generator) lives on the stack of the call.
pub trait Pipeline: Send + Sync {
    fn device(&self) -> &Device;

    /// Returns exactly one image per prompt, in prompt order.
    fn generate(&self, invocation: &Invocation, generator: &mut Generator) -> Result<Vec<DynamicImage>>;
}

/// Loads the pinned model and wraps it in a ready [`Predictor`].
///
/// Slow (downloads and converts weights on first run); call once per process
/// before serving any request.
pub async fn setup(config: ServiceConfig) -> Result<Predictor<StableDiffusionPipeline>> {
    tracing::info!("Loading pipeline...");
    let pipeline = StableDiffusionLoader::load(config.source, config.pipeline).await?;
    Ok(Predictor::new(pipeline, config.predictor))
}
