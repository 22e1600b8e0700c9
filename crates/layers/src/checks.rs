//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `context` label so the resulting error names the
//! tensor that failed. They return `candle_core::Result<()>` so call sites can
//! propagate errors without panicking.

use candle_core::{bail, DType, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual != expected {
        bail!("{context}: expected shape {expected:?}, got {actual:?}");
    }
    Ok(())
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [_, _, actual] if *actual == hidden => Ok(()),
        dims => bail!("{context}: expected (batch, seq, {hidden}) layout, got {dims:?}"),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if !allowed.contains(&dtype) {
        bail!("{context}: expected dtype in {allowed:?}, got {dtype:?}");
    }
    Ok(())
}

/// Floating point dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];
