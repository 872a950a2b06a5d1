use serde::Serialize;
use serde_json::{Map, Value};

use crate::schema::{self, ValidationError, PREDICT_INPUTS};

/// A validated `predict` request. Only constructible through the input
/// schema, so every instance satisfies its constraints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionRequest {
    prompt: String,
    num_outputs: usize,
    num_inference_steps: usize,
    guidance_scale: f64,
    seed: Option<u64>,
}

impl PredictionRequest {
    /// Validates a raw input object (as found under `"input"` in a request).
    pub fn from_input(input: &Map<String, Value>) -> Result<Self, ValidationError> {
        let resolved = schema::validate(PREDICT_INPUTS, input)?;
        let integer = |name: &str| resolved.get(name).and_then(Value::as_u64).unwrap_or_default();
        Ok(Self {
            prompt: resolved
                .get("prompt")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            num_outputs: integer("num_outputs") as usize,
            num_inference_steps: integer("num_inference_steps") as usize,
            guidance_scale: resolved
                .get("guidance_scale")
                .and_then(Value::as_f64)
                .unwrap_or_default(),
            seed: resolved.get("seed").and_then(seed_from_value),
        })
    }

    /// Validates an arbitrary JSON value; anything but an object is rejected.
    pub fn from_value(input: &Value) -> Result<Self, ValidationError> {
        match input {
            Value::Object(map) => Self::from_input(map),
            _ => Err(ValidationError::NotAnObject),
        }
    }

    pub fn builder() -> PredictionRequestBuilder {
        PredictionRequestBuilder::default()
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn num_outputs(&self) -> usize {
        self.num_outputs
    }

    pub fn num_inference_steps(&self) -> usize {
        self.num_inference_steps
    }

    pub fn guidance_scale(&self) -> f64 {
        self.guidance_scale
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }
}

impl Default for PredictionRequest {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            num_outputs: 1,
            num_inference_steps: 25,
            guidance_scale: 7.5,
            seed: None,
        }
    }
}

/// Negative seeds wrap to their two's complement.
fn seed_from_value(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_i64().map(|seed| seed as u64))
}

/// Typed front door to the same schema validation used for JSON input.
#[derive(Debug, Clone, Default)]
pub struct PredictionRequestBuilder {
    input: Map<String, Value>,
}

impl PredictionRequestBuilder {
    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.input.insert("prompt".into(), Value::from(prompt.into()));
        self
    }

    pub fn num_outputs(mut self, num_outputs: i64) -> Self {
        self.input.insert("num_outputs".into(), Value::from(num_outputs));
        self
    }

    pub fn num_inference_steps(mut self, steps: i64) -> Self {
        self.input.insert("num_inference_steps".into(), Value::from(steps));
        self
    }

    pub fn guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.input.insert("guidance_scale".into(), Value::from(guidance_scale));
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.input.insert("seed".into(), Value::from(seed));
        self
    }

    pub fn build(self) -> Result<PredictionRequest, ValidationError> {
        PredictionRequest::from_input(&self.input)
    }
}
