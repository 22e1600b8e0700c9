//! Cross-entropy over chunked logits.

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::error::{DecoderError, Result};

/// Label value excluded from the loss.
pub const DEFAULT_IGNORE_INDEX: i64 = -100;

/// Mean token cross-entropy computed one logits chunk at a time.
///
/// Consumes the output of
/// [`TransformerDecoder::chunked_output`](crate::TransformerDecoder::chunked_output):
/// each chunk is upcast to `f32` on its own so the full `f32` logits tensor is
/// never materialised.
#[derive(Debug, Clone)]
pub struct ChunkedCrossEntropyLoss {
    ignore_index: i64,
    compiled_backend: Option<String>,
}

impl Default for ChunkedCrossEntropyLoss {
    fn default() -> Self {
        Self {
            ignore_index: DEFAULT_IGNORE_INDEX,
            compiled_backend: None,
        }
    }
}

impl ChunkedCrossEntropyLoss {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_index(mut self, ignore_index: i64) -> Self {
        self.ignore_index = ignore_index;
        self
    }

    pub fn ignore_index(&self) -> i64 {
        self.ignore_index
    }

    /// Marks the per-chunk cross-entropy step as compiled for `backend`.
    ///
    /// Chunk splitting and accumulation stay eager, so only the step is
    /// compiled.
    pub fn apply_compile_strategy(mut self, backend: &str) -> Self {
        self.compiled_backend = Some(backend.to_string());
        self
    }

    pub fn compiled_backend(&self) -> Option<&str> {
        self.compiled_backend.as_deref()
    }

    /// `chunks` are `[batch, seq / n, vocab]` and `targets` is `[batch, seq]`.
    /// Returns a scalar `f32` tensor.
    pub fn compute(&self, chunks: &[Tensor], targets: &Tensor) -> Result<Tensor> {
        if chunks.is_empty() {
            return Err(DecoderError::invalid_argument("no logits chunks supplied"));
        }
        let (batch, seq_len) = targets.dims2()?;
        let total_chunk_len: usize = chunks
            .iter()
            .map(|chunk| chunk.dims3().map(|(_, len, _)| len))
            .sum::<candle_core::Result<usize>>()?;
        if total_chunk_len != seq_len {
            return Err(DecoderError::invalid_argument(format!(
                "chunks cover {total_chunk_len} positions but targets have {seq_len}"
            )));
        }

        let targets = targets.to_dtype(DType::I64)?;
        let mut loss_sum = Tensor::zeros((), DType::F32, targets.device())?;
        let mut valid_tokens = 0f32;
        let mut offset = 0;
        for chunk in chunks {
            let (chunk_batch, chunk_len, vocab) = chunk.dims3()?;
            if chunk_batch != batch {
                return Err(DecoderError::invalid_argument(format!(
                    "chunk batch {chunk_batch} does not match targets batch {batch}"
                )));
            }
            let labels = targets.narrow(1, offset, chunk_len)?.flatten_all()?;
            offset += chunk_len;

            let valid = labels.ne(self.ignore_index)?;
            let safe_labels = valid
                .where_cond(&labels, &labels.zeros_like()?)?
                .to_dtype(DType::U32)?;
            let valid = valid.to_dtype(DType::F32)?;

            let log_probs = ops::log_softmax(
                &chunk.to_dtype(DType::F32)?.reshape((chunk_batch * chunk_len, vocab))?,
                D::Minus1,
            )?;
            let nll = log_probs
                .gather(&safe_labels.unsqueeze(1)?, 1)?
                .squeeze(1)?
                .neg()?;
            loss_sum = (loss_sum + (nll * &valid)?.sum_all()?)?;
            valid_tokens += valid.sum_all()?.to_vec0::<f32>()?;
        }

        if valid_tokens == 0.0 {
            return Err(DecoderError::invalid_argument(
                "no valid tokens remain after applying ignore_index",
            ));
        }
        Ok(loss_sum.affine(1.0 / valid_tokens as f64, 0.0)?)
    }

    /// Same loss over unchunked logits `[batch, seq, vocab]`.
    pub fn compute_full(&self, logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
        self.compute(std::slice::from_ref(logits), targets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn uniform_logits_give_log_vocab() -> Result<()> {
        let logits = Tensor::zeros((1, 4, 8), DType::F32, &Device::Cpu)?;
        let targets = Tensor::from_slice(&[1i64, 2, 3, 4], (1, 4), &Device::Cpu)?;
        let loss = ChunkedCrossEntropyLoss::new()
            .compute_full(&logits, &targets)?
            .to_vec0::<f32>()?;
        assert!((loss - 8f32.ln()).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn chunked_matches_unchunked() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 2.0, (2, 6, 5), &device)?;
        let targets = Tensor::from_slice(&[0i64, 1, 2, 3, 4, 0, 4, 3, -100, 1, 0, 2], (2, 6), &device)?;
        let loss_fn = ChunkedCrossEntropyLoss::new();
        let full = loss_fn.compute_full(&logits, &targets)?.to_vec0::<f32>()?;
        let chunks: Vec<Tensor> = (0..3)
            .map(|i| logits.narrow(1, 2 * i, 2))
            .collect::<candle_core::Result<_>>()?;
        let chunked = loss_fn.compute(&chunks, &targets)?.to_vec0::<f32>()?;
        assert!((full - chunked).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn ignored_positions_do_not_contribute() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::from_vec(vec![0f32, 0.0, 10.0, -10.0], (1, 2, 2), &device)?;
        let targets = Tensor::from_slice(&[0i64, -100], (1, 2), &device)?;
        let loss = ChunkedCrossEntropyLoss::new()
            .compute_full(&logits, &targets)?
            .to_vec0::<f32>()?;
        assert!((loss - 2f32.ln()).abs() < 1e-5);

        let all_ignored = Tensor::from_slice(&[-100i64, -100], (1, 2), &device)?;
        assert!(ChunkedCrossEntropyLoss::new()
            .compute_full(&logits, &all_ignored)
            .is_err());
        Ok(())
    }

    #[test]
    fn compile_strategy_keeps_the_loss_value() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1.0, (1, 4, 6), &device)?;
        let targets = Tensor::from_slice(&[5i64, 0, -100, 2], (1, 4), &device)?;
        let eager = ChunkedCrossEntropyLoss::new().with_ignore_index(-100);
        let compiled = eager.clone().apply_compile_strategy("eager-fused");

        assert_eq!(eager.compiled_backend(), None);
        assert_eq!(compiled.compiled_backend(), Some("eager-fused"));
        assert_eq!(compiled.ignore_index(), -100);
        let a = eager.compute_full(&logits, &targets)?.to_vec0::<f32>()?;
        let b = compiled.compute_full(&logits, &targets)?.to_vec0::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn chunk_coverage_must_match_targets() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device)?;
        let targets = Tensor::zeros((1, 4), DType::I64, &device)?;
        let err = ChunkedCrossEntropyLoss::new()
            .compute_full(&logits, &targets)
            .unwrap_err();
        assert!(matches!(err, DecoderError::InvalidArgument(_)));
        Ok(())
    }
}
