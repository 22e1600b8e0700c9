//! RMS normalisation with unified shape and dtype handling.
//!
//! Inputs follow the `(batch, seq, hidden)` convention. Normalisation happens
//! along the last axis; statistics are computed in
//! [`PrecisionPolicy::reduction`] before the result is cast back to storage.
//!
//! Tied-embedding decoders store the RMSNorm scale as an offset from one
//! (`y = x_hat * (1 + w)`), so a freshly zeroed weight is the identity scale.
//! [`NormConfig::unit_offset`] selects that parameterisation.

use candle_core::{DType, Device, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    pub hidden_size: usize,
    /// Numeric stabiliser applied to the mean square.
    pub epsilon: f64,
    /// Scale is applied as `1 + weight` instead of `weight`.
    pub unit_offset: bool,
}

impl NormConfig {
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-6,
            unit_offset: false,
        }
    }

    /// RMSNorm with the `1 + weight` scale used by tied-embedding decoders.
    pub fn offset_rms(hidden_size: usize, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
            unit_offset: true,
        }
    }
}

/// Shared interface for normalisation layers.
pub trait NormalizationLayer: Send + Sync {
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Root mean square norm.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    weight: Tensor,
}

impl RmsNorm {
    pub fn new(weight: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", &weight, checks::FLOAT_DTYPES)?;
        Ok(Self { config, weight })
    }

    /// Builds a norm whose effective scale is one: zeros with a unit offset,
    /// ones otherwise.
    pub fn identity(config: NormConfig, dtype: DType, device: &Device) -> Result<Self> {
        let weight = if config.unit_offset {
            Tensor::zeros(config.hidden_size, dtype, device)?
        } else {
            Tensor::ones(config.hidden_size, dtype, device)?
        };
        Self::new(weight, config)
    }
}

impl NormalizationLayer for RmsNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let compute = policy.cast_for_reduction(hidden)?;
        let mean_square = (compute.sqr()?.sum_keepdim(D::Minus1)? / self.config.hidden_size as f64)?;
        let denom = (mean_square + self.config.epsilon)?.sqrt()?;
        let normalized = compute.broadcast_div(&denom)?;

        let mut scale = self.weight.to_dtype(normalized.dtype())?;
        if self.config.unit_offset {
            scale = (scale + 1.0)?;
        }
        policy.cast_to_storage(&normalized.broadcast_mul(&scale)?)
    }
}
