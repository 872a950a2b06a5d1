use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    ddim::DDIMSchedulerConfig,
    schedulers::{PredictionType, SchedulerConfig},
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::ApiBuilder;
use image::DynamicImage;
use tokenizers::Tokenizer;

pub mod weights;

use crate::{
    select_device, tensor_to_image, Generator, Invocation, Loader, ModelSource, Pipeline,
    PipelineOptions,
};

/// Latent scaling factor of the SD v1 autoencoder.
const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;

/// Negative prompt used when the content filter is enabled; guidance pushes
/// samples away from it.
pub const SAFETY_CONCEPT: &str = "an image showing hate, harassment, violence, suffering, \
    humiliation, harm, suicide, sexual, nudity, bodily fluids, blood, obscene gestures, \
    illegal activity, drug use, theft, vandalism, weapons, child abuse, brutality, cruelty";

pub struct StableDiffusionPipeline {
    device: Device,
    dtype: DType,
    height: usize,
    width: usize,
    max_tokens: usize,
    pad_id: u32,
    scheduler: DDIMSchedulerConfig,
    tokenizer: Tokenizer,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    content_filter_enabled: bool,
}

/// Truncates to `max_len` keeping the final (end-of-text) token, then pads.
fn fit_tokens(mut tokens: Vec<u32>, max_len: usize, pad_id: u32) -> Vec<u32> {
    if tokens.len() > max_len {
        let end = tokens[tokens.len() - 1];
        tokens.truncate(max_len - 1);
        tokens.push(end);
    }
    tokens.resize(max_len, pad_id);
    tokens
}

/// Classifier-free guidance over a `[uncond; cond]` batch.
fn apply_guidance(noise_pred: &Tensor, guidance_scale: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, text) = (&chunks[0], &chunks[1]);
    Ok((uncond + ((text - uncond)? * guidance_scale)?)?)
}

/// The unconditional branch of guidance; empty unless filtering is on.
fn negative_prompt(content_filter_enabled: bool) -> &'static str {
    if content_filter_enabled {
        SAFETY_CONCEPT
    } else {
        ""
    }
}

impl StableDiffusionPipeline {

    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let tokens = fit_tokens(tokens, self.max_tokens, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

impl Pipeline for StableDiffusionPipeline {
    fn device(&self) -> &Device {
        &self.device
    }

    fn generate(&self, invocation: &Invocation, generator: &mut Generator) -> Result<Vec<DynamicImage>> {
        let batch = invocation.prompts.len();
        if batch == 0 {
            return Ok(Vec::new());
        }
        // guidance at scale 1 reduces to the conditional prediction
        let use_guidance = invocation.guidance_scale > 1.0;

        // --- Text embeddings: [uncond x batch; cond x batch] ---
        let cond = invocation
            .prompts
            .iter()
            .map(|prompt| self.encode_prompt(prompt))
            .collect::<Result<Vec<_>>>()?;
        let cond = Tensor::cat(&cond, 0)?;
        let text_embeddings = if use_guidance {
            let uncond = self
                .encode_prompt(negative_prompt(self.content_filter_enabled))?
                .repeat((batch, 1, 1))?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        let text_embeddings = text_embeddings.to_dtype(self.dtype)?;

        // --- Initial noise from the per-call generator ---
        let mut scheduler = self.scheduler.build(invocation.num_inference_steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latents = generator.randn(
            (batch, LATENT_CHANNELS, self.height / 8, self.width / 8),
            DType::F32,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        // --- Denoising ---
        for (index, &timestep) in timesteps.iter().enumerate() {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                apply_guidance(&noise_pred, invocation.guidance_scale)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            tracing::debug!("step {}/{} done", index + 1, timesteps.len());
        }

        // --- Decode and postprocess to u8 RGB ---
        let images = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let images = ((images / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let images = (images.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        (0..batch)
            .map(|index| tensor_to_image(&images.i(index)?))
            .collect()
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Pipeline = StableDiffusionPipeline;

    async fn load(source: ModelSource, options: PipelineOptions) -> Result<Self::Pipeline> {
        if options.height % 8 != 0 || options.width % 8 != 0 {
            anyhow::bail!(
                "image size must be a multiple of 8, got {}x{}",
                options.width,
                options.height
            );
        }

        // Configure device before touching the network so a missing GPU fails fast.
        let device = select_device(options.device_map).context("failed to set up device")?;
        let precision = options.precision.for_device(&device);
        let dtype = precision.dtype();

        std::fs::create_dir_all(&source.cache_dir).with_context(|| {
            format!("failed to create cache dir {}", source.cache_dir.display())
        })?;
        let api = ApiBuilder::new()
            .with_cache_dir(source.cache_dir.clone())
            .build()
            .context("failed to create hf hub API")?;
        let repo = api.repo(hf_hub::Repo::with_revision(
            source.model_id.clone(),
            hf_hub::RepoType::Model,
            source.revision.clone(),
        ));
        tracing::info!(
            "Loading {}@{} on {:?} ({precision})",
            source.model_id,
            source.revision,
            device
        );

        let sd_config = StableDiffusionConfig::v1_5(None, Some(options.height), Some(options.width));

        // --- Tokenizer ---
        let tokenizer_file = api
            .repo(hf_hub::Repo::with_revision(
                source.tokenizer_repo.clone(),
                hf_hub::RepoType::Model,
                source.tokenizer_revision.clone(),
            ))
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;

        // --- Weights, converted once to the target precision ---
        let mut converted = Vec::new();
        for component in [weights::TEXT_ENCODER, weights::UNET, weights::VAE] {
            let src = weights::fetch(&repo, component).await?;
            let dst = weights::converted_path(&source.cache_dir, &source.revision, component, precision);
            let path = weights::prepare(src, dst, precision)
                .await
                .with_context(|| format!("failed to prepare {} weights", component.name))?;
            converted.push(path);
        }
        let [clip_weights, unet_weights, vae_weights] = <[_; 3]>::try_from(converted)
            .map_err(|_| anyhow::anyhow!("expected three pipeline components"))?;

        // --- Models ---
        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_weights, &device, dtype)
                .context("failed to load CLIP text model")?;
        let unet = sd_config
            .build_unet(unet_weights, &device, LATENT_CHANNELS, options.use_flash_attn, dtype)
            .context("failed to load UNet")?;
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load VAE")?;

        if options.content_filter_enabled {
            tracing::info!("content filter enabled");
        }

        Ok(StableDiffusionPipeline {
            device,
            dtype,
            height: sd_config.height,
            width: sd_config.width,
            max_tokens: sd_config.clip.max_position_embeddings,
            pad_id,
            scheduler: DDIMSchedulerConfig {
                prediction_type: PredictionType::Epsilon,
                ..Default::default()
            },
            tokenizer,
            text_model,
            unet,
            vae,
            content_filter_enabled: options.content_filter_enabled,
        })
    }
}
