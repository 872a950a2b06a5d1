//! Seeded noise source for a single prediction.
//!
//! Samples are produced on the host with MT19937 and a Box-Muller transform,
//! then moved to the pipeline device. Host-side sampling keeps a seed
//! reproducible across CPU, CUDA and Metal, none of which share an RNG.

use anyhow::Result;
use candle_core::{DType, Device, Shape, Tensor};
use rand_mt::Mt;

/// Normal samples are produced in blocks of this many values.
const BLOCK: usize = 16;
const HALF_BLOCK: usize = BLOCK / 2;

/// Draws a fresh seed for requests that did not supply one.
///
/// Seeds are kept to 16 bits so they are short enough to read back from logs.
pub fn random_seed() -> u64 {
    u64::from(rand::random::<u16>())
}

/// Deterministic normal-distribution stream bound to a device.
#[derive(Debug, Clone)]
pub struct Generator {
    seed: u64,
    rng: Mt,
    spare: Option<f32>,
    device: Device,
}

impl Generator {
    /// Seeds that fit in 32 bits use the plain MT19937 initializer; wider
    /// seeds are folded in as a two-word key so every bit counts.
    pub fn new(seed: u64, device: &Device) -> Self {
        let rng = match u32::try_from(seed) {
            Ok(narrow) => Mt::new(narrow),
            Err(_) => Mt::new_with_key([seed as u32, (seed >> 32) as u32]),
        };
        Self {
            seed,
            rng,
            spare: None,
            device: device.clone(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    fn uniform(&mut self) -> f32 {
        // 24 random bits fill an f32 mantissa exactly.
        (self.rng.next_u32() & 0x00FF_FFFF) as f32 / 16_777_216.0
    }

    /// One standard normal sample; every other call is served from the spare.
    pub fn next_normal(&mut self) -> f32 {
        if let Some(spare) = self.spare.take() {
            return spare;
        }
        let u1 = 1.0 - self.uniform();
        let u2 = self.uniform();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f32::consts::PI * u2;
        self.spare = Some(radius * theta.sin());
        radius * theta.cos()
    }

    fn fill_block(&mut self, out: &mut Vec<f32>) {
        let mut uniforms = [0f32; BLOCK];
        for u in uniforms.iter_mut() {
            *u = self.uniform();
        }
        let (first, second) = uniforms.split_at(HALF_BLOCK);
        let mut cos = [0f32; HALF_BLOCK];
        let mut sin = [0f32; HALF_BLOCK];
        for i in 0..HALF_BLOCK {
            let radius = (-2.0 * (1.0 - first[i]).ln()).sqrt();
            let theta = 2.0 * std::f32::consts::PI * second[i];
            cos[i] = radius * theta.cos();
            sin[i] = radius * theta.sin();
        }
        out.extend_from_slice(&cos);
        out.extend_from_slice(&sin);
    }

    /// Samples `shape` values from N(0, 1) as a tensor on the bound device.
    pub fn randn<S: Into<Shape>>(&mut self, shape: S, dtype: DType) -> Result<Tensor> {
        let shape = shape.into();
        let count = shape.elem_count();
        let mut data = Vec::with_capacity(count);
        for _ in 0..count / BLOCK {
            self.fill_block(&mut data);
        }
        while data.len() < count {
            let sample = self.next_normal();
            data.push(sample);
        }
        let tensor = Tensor::from_vec(data, shape, &Device::Cpu)?
            .to_device(&self.device)?
            .to_dtype(dtype)?;
        Ok(tensor)
    }
}
