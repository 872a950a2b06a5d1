use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use anyhow::Result;
use candle_core::{DType, Device, IndexOp};
use image::DynamicImage;
use pokediff_core::{
    tensor_to_image, Generator, Invocation, Pipeline, PredictError, PredictionRequest, Predictor,
    PredictorConfig,
};
use rstest::rstest;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

const SIZE: usize = 16;

/// Turns generator noise straight into pixels, so outputs depend only on the
/// seed and batch position.
struct NoisePipeline {
    device: Device,
    calls: AtomicUsize,
    fail: bool,
    panic_once: AtomicBool,
    gate: Option<Arc<Barrier>>,
}

impl Default for NoisePipeline {
    fn default() -> Self {
        Self {
            device: Device::Cpu,
            calls: AtomicUsize::new(0),
            fail: false,
            panic_once: AtomicBool::new(false),
            gate: None,
        }
    }
}

impl NoisePipeline {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    fn panicking_once() -> Self {
        Self {
            panic_once: AtomicBool::new(true),
            ..Default::default()
        }
    }

    fn gated(gate: Arc<Barrier>) -> Self {
        Self {
            gate: Some(gate),
            ..Default::default()
        }
    }
}

impl Pipeline for NoisePipeline {
    fn device(&self) -> &Device {
        &self.device
    }

    fn generate(&self, invocation: &Invocation, generator: &mut Generator) -> Result<Vec<DynamicImage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.wait();
            gate.wait();
        }
        if self.panic_once.swap(false, Ordering::SeqCst) {
            panic!("kernel launch aborted");
        }
        if self.fail {
            anyhow::bail!("CUDA_ERROR_OUT_OF_MEMORY");
        }
        let batch = invocation.prompts.len();
        let noise = generator.randn((batch, 3, SIZE, SIZE), DType::F32)?;
        let pixels = ((noise.clamp(-2f32, 2.)? + 2.)? * 63.)?.to_dtype(DType::U8)?;
        (0..batch).map(|i| tensor_to_image(&pixels.i(i)?)).collect()
    }
}

fn predictor(pipeline: NoisePipeline) -> (Predictor<NoisePipeline>, TempDir) {
    let scratch = tempfile::tempdir().unwrap();
    let config = PredictorConfig {
        scratch_dir: scratch.path().to_path_buf(),
    };
    (Predictor::new(pipeline, config), scratch)
}

fn input(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap()
}

fn read_all(paths: &[std::path::PathBuf]) -> Vec<Vec<u8>> {
    paths.iter().map(|p| std::fs::read(p).unwrap()).collect()
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(4)]
fn returns_one_path_per_output(#[case] num_outputs: i64) {
    let (predictor, scratch) = predictor(NoisePipeline::default());
    let request = PredictionRequest::builder()
        .num_outputs(num_outputs)
        .seed(7)
        .build()
        .unwrap();

    let prediction = predictor.predict(&request).unwrap();

    assert_eq!(prediction.outputs.len(), num_outputs as usize);
    for (index, path) in prediction.outputs.iter().enumerate() {
        assert_eq!(path, &scratch.path().join(format!("out-{index}.png")));
    }
}

#[test]
fn red_pokemon_scenario_is_reproducible() {
    let (predictor, _scratch) = predictor(NoisePipeline::default());
    let request = input(json!({
        "prompt": "a red pokemon",
        "num_outputs": 2,
        "num_inference_steps": 25,
        "guidance_scale": 7.5,
        "seed": 42
    }));

    let first = predictor.predict_input(&request).unwrap();
    assert_eq!(first.seed, 42);
    assert_eq!(first.outputs.len(), 2);
    let first_bytes = read_all(&first.outputs);
    for (path, bytes) in first.outputs.iter().zip(&first_bytes) {
        assert!(!bytes.is_empty());
        let decoded = image::open(path).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (SIZE as u32, SIZE as u32));
    }
    // outputs within a batch come from different noise
    assert_ne!(first_bytes[0], first_bytes[1]);

    let second = predictor.predict_input(&request).unwrap();
    assert_eq!(read_all(&second.outputs), first_bytes);
}

#[test]
fn too_many_outputs_never_reaches_the_pipeline() {
    let (predictor, scratch) = predictor(NoisePipeline::default());

    let err = predictor.predict_input(&input(json!({"num_outputs": 5}))).unwrap_err();

    match err {
        PredictError::Validation(e) => assert_eq!(e.field(), Some("num_outputs")),
        other => panic!("expected a validation error, got {other:?}"),
    }
    assert_eq!(predictor.pipeline().calls.load(Ordering::SeqCst), 0);
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[rstest]
#[case(json!({"num_inference_steps": 0}))]
#[case(json!({"num_inference_steps": 51}))]
#[case(json!({"guidance_scale": 0.5}))]
#[case(json!({"guidance_scale": 21}))]
fn out_of_range_sampling_parameters_are_rejected(#[case] raw: Value) {
    let (predictor, _scratch) = predictor(NoisePipeline::default());
    let err = predictor.predict_input(&input(raw)).unwrap_err();
    assert!(matches!(err, PredictError::Validation(_)), "{err:?}");
    assert_eq!(predictor.pipeline().calls.load(Ordering::SeqCst), 0);
}

#[test]
fn unset_seed_is_randomized_and_recorded() {
    let (predictor, _scratch) = predictor(NoisePipeline::default());
    let request = PredictionRequest::builder().prompt("pikachu").build().unwrap();

    let mut seeds = Vec::new();
    let mut images = Vec::new();
    for _ in 0..8 {
        let prediction = predictor.predict(&request).unwrap();
        assert!(prediction.seed <= u64::from(u16::MAX));
        seeds.push(prediction.seed);
        images.push(read_all(&prediction.outputs));
    }
    seeds.dedup();
    assert!(seeds.len() > 1, "eight random seeds were identical: {seeds:?}");
    images.dedup();
    assert!(images.len() > 1);
}

#[test]
fn recorded_seed_reproduces_a_random_run() {
    let (predictor, _scratch) = predictor(NoisePipeline::default());
    let random = predictor
        .predict(&PredictionRequest::builder().build().unwrap())
        .unwrap();
    let random_bytes = read_all(&random.outputs);

    let replay = PredictionRequest::builder().seed(random.seed).build().unwrap();
    let replayed = predictor.predict(&replay).unwrap();

    assert_eq!(read_all(&replayed.outputs), random_bytes);
}

#[test]
fn execution_failure_writes_nothing() {
    let (predictor, scratch) = predictor(NoisePipeline::failing());

    let err = predictor.predict(&PredictionRequest::default()).unwrap_err();

    assert!(matches!(err, PredictError::Execution(_)));
    assert!(err.to_string().contains("OUT_OF_MEMORY"), "{err}");
    assert!(!err.is_retriable());
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn overlapping_calls_are_rejected() {
    let gate = Arc::new(Barrier::new(2));
    let (predictor, _scratch) = predictor(NoisePipeline::gated(gate.clone()));

    std::thread::scope(|s| {
        let running = s.spawn(|| predictor.predict(&PredictionRequest::default()));
        // first wait: the running call is inside the pipeline
        gate.wait();
        let err = predictor.predict(&PredictionRequest::default()).unwrap_err();
        assert!(matches!(err, PredictError::Busy));
        assert!(err.is_retriable());
        gate.wait();
        assert!(running.join().unwrap().is_ok());
    });
}

#[test]
fn panicked_call_does_not_wedge_the_predictor() {
    let (predictor, scratch) = predictor(NoisePipeline::panicking_once());

    let crashed = catch_unwind(AssertUnwindSafe(|| {
        predictor.predict(&PredictionRequest::default())
    }));
    assert!(crashed.is_err());
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);

    let prediction = predictor
        .predict(&PredictionRequest::builder().seed(3).build().unwrap())
        .unwrap();
    assert_eq!(prediction.outputs.len(), 1);
    assert_eq!(predictor.pipeline().calls.load(Ordering::SeqCst), 2);
}
