use anyhow::Result;
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use pokediff_core::{
    schema, DeviceMap, ModelSource, Pipeline, PipelineOptions, Precision, PredictError,
    PredictionRequest, Predictor, PredictorConfig, ServiceConfig, PREDICT_INPUTS,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::{path::PathBuf, sync::Arc, time::Instant};
use tokio::{self, net::TcpListener};
use tracing_subscriber::EnvFilter;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Pokémon Stable Diffusion prediction server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Accelerator ordinal to bind the pipeline to
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Model repository on the Hugging Face hub
    #[arg(long, default_value = pokediff_core::DEFAULT_MODEL_ID)]
    model: String,

    /// Model revision; keep pinned for reproducible outputs
    #[arg(long, default_value = pokediff_core::DEFAULT_REVISION)]
    revision: String,

    /// Tokenizer revision; pinned alongside the model
    #[arg(long, default_value = pokediff_core::DEFAULT_TOKENIZER_REVISION)]
    tokenizer_revision: String,

    /// Directory for downloaded and converted weights
    #[arg(long, default_value = pokediff_core::DEFAULT_CACHE_DIR)]
    cache_dir: PathBuf,

    /// Directory receiving out-<index>.png (defaults to the system temp dir)
    #[arg(long)]
    scratch_dir: Option<PathBuf>,

    /// Weight precision: f16, bf16 or f32
    #[arg(long, default_value_t = Precision::F16)]
    precision: Precision,

    /// Steer generation away from unsafe content
    #[arg(long)]
    content_filter: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 5000)]
    port: u16,
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        let device_map = if self.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::Ordinal(self.device)
        };
        ServiceConfig {
            source: ModelSource {
                model_id: self.model.clone(),
                revision: self.revision.clone(),
                tokenizer_revision: self.tokenizer_revision.clone(),
                cache_dir: self.cache_dir.clone(),
                ..Default::default()
            },
            pipeline: PipelineOptions {
                device_map,
                precision: self.precision,
                content_filter_enabled: self.content_filter,
                ..Default::default()
            },
            predictor: PredictorConfig {
                scratch_dir: self
                    .scratch_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir),
            },
        }
    }
}

#[derive(Deserialize)]
struct PredictionBody {
    #[serde(default)]
    id: Option<String>,
    #[serde(default = "empty_input")]
    input: Value,
}

fn empty_input() -> Value {
    json!({})
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Status {
    Succeeded,
    Failed,
}

#[derive(Serialize)]
struct Metrics {
    predict_time: f64,
}

#[derive(Serialize)]
struct PredictionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    logs: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    metrics: Option<Metrics>,
}

/// Inlines a PNG written by the predictor as a `data:` URI.
fn png_data_uri(path: &std::path::Path) -> Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(format!("data:image/png;base64,{}", BASE64_STANDARD.encode(&bytes)))
}

fn error_status(err: &PredictError) -> StatusCode {
    match err {
        PredictError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
        PredictError::Busy => StatusCode::CONFLICT,
        PredictError::Execution(_) | PredictError::Output { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

// Application state containing the preloaded pipeline.
struct AppState<P>(Arc<Predictor<P>>);

impl<P> Clone for AppState<P> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

/// Runs one prediction on the blocking pool and inlines its outputs.
async fn run_prediction<P: Pipeline + 'static>(
    state: &AppState<P>,
    input: Value,
) -> Result<(u64, Vec<String>), PredictError> {
    // an explicit null input means "all defaults", same as omitting it
    let input = if input.is_null() { empty_input() } else { input };
    let predictor = state.0.clone();
    let joined = tokio::task::spawn_blocking(move || -> Result<_, PredictError> {
        let request = PredictionRequest::from_value(&input)?;
        let prediction = predictor.predict(&request)?;
        let outputs = prediction
            .outputs
            .iter()
            .map(|path| png_data_uri(path))
            .collect::<Result<Vec<_>>>()
            .map_err(PredictError::Execution)?;
        Ok((prediction.seed, outputs))
    })
    .await;
    match joined {
        Ok(result) => result,
        Err(e) => Err(PredictError::Execution(anyhow::anyhow!(
            "prediction task failed: {e}"
        ))),
    }
}

async fn predictions_handler<P: Pipeline + 'static>(
    State(state): State<AppState<P>>,
    Json(body): Json<PredictionBody>,
) -> Response {
    let start = Instant::now();
    let result = run_prediction(&state, body.input).await;
    let predict_time = start.elapsed().as_secs_f64();
    match result {
        Ok((seed, output)) => Json(PredictionResponse {
            id: body.id,
            status: Status::Succeeded,
            output: Some(output),
            error: None,
            logs: format!("Using seed: {seed}\n"),
            metrics: Some(Metrics { predict_time }),
        })
        .into_response(),
        Err(e) => {
            tracing::error!("Error generating image: {e}");
            let response = PredictionResponse {
                id: body.id,
                status: Status::Failed,
                output: None,
                error: Some(e.to_string()),
                logs: String::new(),
                metrics: None,
            };
            (error_status(&e), Json(response)).into_response()
        }
    }
}

async fn health_check_handler() -> impl IntoResponse {
    Json(json!({ "status": "READY" }))
}

fn openapi_document() -> Value {
    json!({
        "openapi": "3.0.2",
        "info": { "title": "pokediff", "version": env!("CARGO_PKG_VERSION") },
        "paths": {
            "/predictions": {
                "post": {
                    "summary": "Predict",
                    "requestBody": {
                        "content": {
                            "application/json": {
                                "schema": { "$ref": "#/components/schemas/PredictionRequest" }
                            }
                        }
                    }
                }
            },
            "/health-check": { "get": { "summary": "Healthcheck" } }
        },
        "components": {
            "schemas": {
                "Input": schema::input_schema(PREDICT_INPUTS),
                "Output": {
                    "title": "Output",
                    "type": "array",
                    "items": { "type": "string", "format": "uri" }
                },
                "PredictionRequest": {
                    "title": "PredictionRequest",
                    "type": "object",
                    "properties": {
                        "id": { "title": "Id", "type": "string" },
                        "input": { "$ref": "#/components/schemas/Input" }
                    }
                }
            }
        }
    })
}

async fn openapi_handler() -> impl IntoResponse {
    Json(openapi_document())
}

fn router<P: Pipeline + 'static>(predictor: Arc<Predictor<P>>) -> Router {
    Router::new()
        .route("/health-check", get(health_check_handler))
        .route("/openapi.json", get(openapi_handler))
        .route("/predictions", post(predictions_handler::<P>))
        .with_state(AppState(predictor))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {e}");
    }
    tracing::info!("Shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // --- Load the pipeline once, before accepting requests ---
    let predictor = pokediff_core::setup(args.service_config()).await?;
    let app = router(Arc::new(predictor));

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    tracing::info!("Started server on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use candle_core::{DType, Device, IndexOp};
    use image::DynamicImage;
    use pokediff_core::{tensor_to_image, Generator, Invocation};

    struct NoisePipeline(Device);

    impl Pipeline for NoisePipeline {
        fn device(&self) -> &Device {
            &self.0
        }

        fn generate(
            &self,
            invocation: &Invocation,
            generator: &mut Generator,
        ) -> anyhow::Result<Vec<DynamicImage>> {
            let batch = invocation.prompts.len();
            let noise = generator.randn((batch, 3, 8, 8), DType::F32)?;
            let pixels = ((noise.clamp(-2f32, 2.)? + 2.)? * 63.)?.to_dtype(DType::U8)?;
            (0..batch).map(|i| tensor_to_image(&pixels.i(i)?)).collect()
        }
    }

    fn state(scratch: &tempfile::TempDir) -> AppState<NoisePipeline> {
        let config = PredictorConfig {
            scratch_dir: scratch.path().to_path_buf(),
        };
        AppState(Arc::new(Predictor::new(NoisePipeline(Device::Cpu), config)))
    }

    async fn post(state: AppState<NoisePipeline>, body: Value) -> (StatusCode, Value) {
        let body: PredictionBody = serde_json::from_value(body).unwrap();
        let response = predictions_handler(State(state), Json(body)).await;
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn successful_prediction_inlines_pngs() {
        let scratch = tempfile::tempdir().unwrap();
        let (status, body) = post(
            state(&scratch),
            json!({"id": "abc", "input": {"prompt": "a red pokemon", "num_outputs": 2, "seed": 42}}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "succeeded");
        assert_eq!(body["id"], "abc");
        assert_eq!(body["logs"], "Using seed: 42\n");
        let output = body["output"].as_array().unwrap();
        assert_eq!(output.len(), 2);
        for uri in output {
            let encoded = uri.as_str().unwrap().strip_prefix("data:image/png;base64,").unwrap();
            let png = BASE64_STANDARD.decode(encoded).unwrap();
            assert!(image::load_from_memory(&png).is_ok());
        }
    }

    #[tokio::test]
    async fn missing_input_uses_defaults() {
        let scratch = tempfile::tempdir().unwrap();
        let (status, body) = post(state(&scratch), json!({})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["output"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn null_input_uses_defaults() {
        let scratch = tempfile::tempdir().unwrap();
        let (status, body) = post(state(&scratch), json!({"input": null})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "succeeded");
        assert_eq!(body["output"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_input_is_unprocessable() {
        let scratch = tempfile::tempdir().unwrap();
        let (status, body) = post(state(&scratch), json!({"input": {"num_outputs": 5}})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["status"], "failed");
        assert!(body["error"].as_str().unwrap().contains("num_outputs"));
        assert!(body.get("output").is_none());
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(error_status(&PredictError::Busy), StatusCode::CONFLICT);
        assert_eq!(
            error_status(&PredictError::Execution(anyhow::anyhow!("oom"))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn openapi_publishes_the_input_schema() {
        let doc = openapi_document();
        let input = &doc["components"]["schemas"]["Input"]["properties"];
        assert_eq!(input["num_outputs"]["enum"], json!([1, 2, 3, 4]));
        assert_eq!(input["guidance_scale"]["default"], json!(7.5));
    }

    #[test]
    fn cli_builds_service_config() {
        let args = Args::parse_from([
            "pokediff-server",
            "--cpu",
            "--precision",
            "f32",
            "--scratch-dir",
            "/tmp/pokediff",
        ]);
        let config = args.service_config();
        assert_eq!(config.pipeline.device_map, DeviceMap::ForceCpu);
        assert_eq!(config.pipeline.precision, Precision::F32);
        assert_eq!(config.predictor.scratch_dir, PathBuf::from("/tmp/pokediff"));
        assert_eq!(config.source.model_id, pokediff_core::DEFAULT_MODEL_ID);
        assert!(!config.pipeline.content_filter_enabled);
        assert_eq!(
            config.source.tokenizer_revision,
            pokediff_core::DEFAULT_TOKENIZER_REVISION
        );
    }

    #[test]
    fn cli_overrides_tokenizer_revision() {
        let hash = "0123456789abcdef0123456789abcdef01234567";
        let args = Args::parse_from(["pokediff-server", "--tokenizer-revision", hash]);
        assert_eq!(args.service_config().source.tokenizer_revision, hash);
    }
}
