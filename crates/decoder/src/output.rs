//! What a forward pass returns.

use candle_core::{Result, Tensor};

/// Whether an operation may be fused or compiled together with its
/// neighbours by [`compile_model`](crate::compile::compile_model).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FusionPolicy {
    Allowed,
    /// The operation must run eagerly, exactly as written.
    Disabled,
}

/// Logits from [`TransformerDecoder::forward`](crate::TransformerDecoder::forward).
#[derive(Debug, Clone)]
pub enum DecoderOutput {
    /// `[batch, seq, vocab]` in `f32`.
    Logits(Tensor),
    /// Equal sequence slices `[batch, seq / n, vocab]` in the hidden dtype.
    Chunks(Vec<Tensor>),
}

impl DecoderOutput {
    pub fn is_chunked(&self) -> bool {
        matches!(self, DecoderOutput::Chunks(_))
    }

    /// Full logits, concatenating chunks along the sequence axis. This
    /// materialises exactly what chunking avoids, so it is meant for
    /// inspection and tests.
    pub fn into_logits(self) -> Result<Tensor> {
        match self {
            DecoderOutput::Logits(logits) => Ok(logits),
            DecoderOutput::Chunks(chunks) => Tensor::cat(&chunks, 1),
        }
    }

    pub fn into_chunks(self) -> Vec<Tensor> {
        match self {
            DecoderOutput::Logits(logits) => vec![logits],
            DecoderOutput::Chunks(chunks) => chunks,
        }
    }
}
