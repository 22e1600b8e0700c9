//! Builders for causal attention masks.

use candle_core::{bail, DType, Device, Result, Tensor};

use super::{BOOL_DTYPE, MASK_DTYPE};

/// Construct the boolean lower-triangular mask `[max_seq_len, max_seq_len]`
/// where `mask[row][col] = col <= row`.
pub fn build_causal_mask(device: &Device, max_seq_len: usize) -> Result<Tensor> {
    if max_seq_len == 0 {
        bail!("causal mask requires max_seq_len > 0");
    }
    let mut data = vec![0u8; max_seq_len * max_seq_len];
    for row in 0..max_seq_len {
        let row_start = row * max_seq_len;
        for col in 0..=row {
            data[row_start + col] = 1;
        }
    }
    Tensor::from_vec(data, (max_seq_len, max_seq_len), device)
}

/// Select one mask row per absolute position.
///
/// `mask` is `[L, L]` and `positions` is an integer `[batch, seq]` tensor; the
/// result is `[batch, seq, L]` with row `(b, s)` equal to `mask[positions[b][s]]`.
pub fn gather_mask_rows(mask: &Tensor, positions: &Tensor) -> Result<Tensor> {
    let (rows, cols) = mask.dims2()?;
    let (batch, seq) = positions.dims2()?;
    if !positions.dtype().is_int() {
        bail!("positions must be an integer tensor, got {:?}", positions.dtype());
    }

    let flat = positions.to_dtype(DType::I64)?.flatten_all()?;
    let (min, max) = (
        flat.min_all()?.to_scalar::<i64>()?,
        flat.max_all()?.to_scalar::<i64>()?,
    );
    if min < 0 || max as usize >= rows {
        bail!("positions must lie in [0, {rows}), got range [{min}, {max}]");
    }

    mask.index_select(&flat, 0)?.reshape((batch, seq, cols))
}

/// Convert a boolean mask into an additive `f32` mask of the same shape.
pub fn to_additive(mask: &Tensor) -> Result<Tensor> {
    if mask.dtype() != BOOL_DTYPE {
        bail!("expected a boolean ({BOOL_DTYPE:?}) mask, got {:?}", mask.dtype());
    }
    let keep = Tensor::zeros(mask.dims(), MASK_DTYPE, mask.device())?;
    let drop = Tensor::full(f32::NEG_INFINITY, mask.dims(), mask.device())?;
    mask.where_cond(&keep, &drop)
}

/// Additive causal mask `[q_len, k_len]` used when no explicit mask is given.
///
/// When `k_len > q_len`, queries are assumed to align with the most recent
/// `q_len` keys, allowing access to the extended prefix.
pub fn build_causal_bias(device: &Device, q_len: usize, k_len: usize) -> Result<Tensor> {
    let mut data = vec![0f32; q_len * k_len];
    let offset = k_len.saturating_sub(q_len);

    for q in 0..q_len {
        let row_start = q * k_len;
        for k in (q + offset + 1)..k_len {
            data[row_start + k] = f32::NEG_INFINITY;
        }
    }

    Tensor::from_vec(data, (q_len, k_len), device)
}
