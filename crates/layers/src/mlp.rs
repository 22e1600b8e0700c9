//! Gated position-wise feed-forward block.
//!
//! The MLP maps `(batch, seq, hidden)` to the same layout:
//! `down(act(gate(x)) * up(x))`. Gate and up projections are packed into one
//! `(batch, seq, 2 * intermediate)` matmul and split along the last axis.

use candle_core::{DType, Device, Result, Tensor};

use crate::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub activation: ActivationKind,
}

#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    gate_up: Linear,
    down: Linear,
}

impl FeedForward {
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let gate_up = Linear::with_init(
            LinearConfig::new(config.hidden_size, 2 * config.intermediate_size),
            init,
            device,
            dtype,
        )?;
        let down = Linear::with_init(
            LinearConfig::new(config.intermediate_size, config.hidden_size),
            init,
            device,
            dtype,
        )?;
        Ok(Self {
            config,
            gate_up,
            down,
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let width = self.config.intermediate_size;
        let packed = self.gate_up.forward(hidden, policy)?;
        let gate = packed.narrow(2, 0, width)?;
        let up = packed.narrow(2, width, width)?;

        let activated = self.config.activation.forward(&gate, policy)?;
        let fused = policy
            .cast_for_matmul(&activated)?
            .mul(&policy.cast_for_matmul(&up)?)?;
        self.down.forward(&policy.cast_to_storage(&fused)?, policy)
    }
}
