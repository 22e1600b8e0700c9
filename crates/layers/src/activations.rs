//! Activation used by the decoder feed-forward stack.
//!
//! Inputs are promoted to [`PrecisionPolicy::compute`] before evaluating the
//! non-linearity; the result is cast back to storage. Tied-embedding decoders
//! use the tanh approximation of GELU.

use candle_core::{Result, Tensor};

use crate::dtypes::PrecisionPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationKind {
    GeluTanh,
}

impl ActivationKind {
    pub fn forward(self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let out = match self {
            ActivationKind::GeluTanh => compute.gelu()?,
        };
        policy.cast_to_storage(&out)
    }
}
