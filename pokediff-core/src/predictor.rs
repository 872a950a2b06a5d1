use std::path::PathBuf;
use std::sync::{Mutex, TryLockError};

use serde::Serialize;
use serde_json::{Map, Value};

use crate::generator::{random_seed, Generator};
use crate::{output, Invocation, Pipeline, PredictError, PredictionRequest, PredictorConfig};

/// Result of a successful `predict` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prediction {
    /// Seed actually used; resubmit it to reproduce the outputs.
    pub seed: u64,
    /// One path per requested output, in request order.
    pub outputs: Vec<PathBuf>,
}

/// Owns the pipeline and serves one prediction at a time.
///
/// Overlapping calls are rejected with [`PredictError::Busy`] rather than
/// queued: they would contend for the device and overwrite each other's
/// output files.
pub struct Predictor<P> {
    pipeline: P,
    config: PredictorConfig,
    in_flight: Mutex<()>,
}

impl<P: Pipeline> Predictor<P> {
    pub fn new(pipeline: P, config: PredictorConfig) -> Self {
        Self {
            pipeline,
            config,
            in_flight: Mutex::new(()),
        }
    }

    pub fn pipeline(&self) -> &P {
        &self.pipeline
    }

    pub fn config(&self) -> &PredictorConfig {
        &self.config
    }

    /// Validates raw input against the schema, then predicts.
    pub fn predict_input(&self, input: &Map<String, Value>) -> Result<Prediction, PredictError> {
        let request = PredictionRequest::from_input(input)?;
        self.predict(&request)
    }

    pub fn predict(&self, request: &PredictionRequest) -> Result<Prediction, PredictError> {
        let _in_flight = match self.in_flight.try_lock() {
            Ok(guard) => guard,
            // the guard protects no data, a panic in an earlier call is harmless
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(PredictError::Busy),
        };

        let seed = request.seed().unwrap_or_else(random_seed);
        tracing::info!(seed, "Using seed: {seed}");

        let mut generator = Generator::new(seed, self.pipeline.device());
        let num_outputs = request.num_outputs();
        let invocation = Invocation {
            prompts: vec![request.prompt().to_string(); num_outputs],
            guidance_scale: request.guidance_scale(),
            num_inference_steps: request.num_inference_steps(),
        };

        let start = std::time::Instant::now();
        let images = self
            .pipeline
            .generate(&invocation, &mut generator)
            .map_err(PredictError::Execution)?;
        if images.len() != num_outputs {
            return Err(PredictError::Execution(anyhow::anyhow!(
                "pipeline returned {} images, expected {num_outputs}",
                images.len()
            )));
        }
        tracing::info!(
            "generated {num_outputs} image(s) in {:.2}s",
            start.elapsed().as_secs_f64()
        );

        let outputs = output::write_batch(&self.config.scratch_dir, &images)?;
        Ok(Prediction { seed, outputs })
    }
}
