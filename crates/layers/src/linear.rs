//! Linear projection helpers.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` and return
//! `(batch, seq, out_dim)`. Weights are stored `[out_dim, in_dim]` and are cast
//! to [`PrecisionPolicy::compute`] for the matmul; the result is cast back to
//! storage. Packed projections (fused QKV, gated MLP inputs) are plain linears
//! with a wider output; callers narrow the last axis themselves. Decoder
//! projections carry no bias.

use candle_core::{DType, Device, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by dense projection layers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
        }
    }
}

/// Supported weight initialisation policies.
#[derive(Debug, Clone)]
pub enum LinearInit {
    /// Xavier/Glorot uniform initialisation.
    XavierUniform,
    /// Scales another policy, used to damp residual branch outputs.
    Scaled { base: Box<LinearInit>, scale: f64 },
}

impl LinearInit {
    pub fn scaled(base: LinearInit, scale: f64) -> Self {
        Self::Scaled {
            base: Box::new(base),
            scale,
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device) -> Result<Tensor> {
        let (out_dim, in_dim) = shape;
        let (fan_in, fan_out) = (in_dim as f64, out_dim as f64);
        match self {
            LinearInit::XavierUniform => {
                let bound = (6.0f64 / (fan_in + fan_out)).sqrt() as f32;
                Tensor::rand(-bound, bound, shape, device)
            }
            LinearInit::Scaled { base, scale } => base.sample(shape, device)?.affine(*scale, 0.0),
        }
    }
}

/// Dense projection `y = x W^T`.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Tensor,
}

impl Linear {
    /// Constructs a linear layer from pre-existing parameters.
    pub fn new(config: LinearConfig, weight: Tensor) -> Result<Self> {
        checks::expect_shape("linear.weight", &weight, &[config.output_dim, config.input_dim])?;
        checks::expect_dtype_in("linear.weight", &weight, checks::FLOAT_DTYPES)?;
        Ok(Self { config, weight })
    }

    /// Builds a linear layer with freshly sampled weights in `dtype`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let weight = init
            .sample((config.output_dim, config.input_dim), device)?
            .to_dtype(dtype)?;
        Self::new(config, weight)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("linear.input", hidden, self.config.input_dim)?;
        let (batch, seq, _) = hidden.dims3()?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight = policy.cast_for_matmul(&self.weight)?;
        let flat = input.reshape((batch * seq, self.config.input_dim))?;
        let output = flat
            .matmul(&weight.t()?)?
            .reshape((batch, seq, self.config.output_dim))?;
        policy.cast_to_storage(&output)
    }
}
