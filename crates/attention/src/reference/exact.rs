//! Reference attention kernel.
//!
//! Mirrors the semantics described by the [`Attention`](crate::core::Attention)
//! trait, including grouped-query head sharing and boolean masks.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};

use crate::core::{Attention, AttentionError, Config};
use crate::masks::{build_causal_bias, to_additive, BOOL_DTYPE};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Expands `[b, kv_heads, s, d]` to `[b, kv_heads * n_rep, s, d]` so each
/// query head sees its shared key/value head.
fn repeat_kv(x: &Tensor, n_rep: usize) -> candle_core::Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (b, kv_heads, s, d) = x.dims4()?;
    x.unsqueeze(2)?
        .broadcast_as((b, kv_heads, n_rep, s, d))?
        .reshape((b, kv_heads * n_rep, s, d))
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dtype={:?} dropout={:?} explicit_mask={}",
                q.dtype(),
                config.dropout_p,
                mask.is_some()
            );
        }

        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape("q, k, v must share the same dtype"));
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q
            .dims4()
            .map_err(|_| AttentionError::shape("q must have shape [batch, heads, seq_len, head_dim]"))?;
        let (kb, kv_heads, k_len, kd) = k
            .dims4()
            .map_err(|_| AttentionError::shape("k must have shape [batch, kv_heads, seq_len, head_dim]"))?;
        if kb != batch || kd != head_dim || kv_heads == 0 || heads % kv_heads != 0 {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, divisor of {heads}, ?, {head_dim}] got {:?}",
                k.dims()
            )));
        }
        if v.dims() != k.dims() {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected {:?} got {:?}",
                k.dims(),
                v.dims()
            )));
        }

        let bias = match mask {
            Some(mask) => {
                if !device.same_device(mask.device()) {
                    return Err(AttentionError::shape("mask must reside on the same device as q"));
                }
                if mask.dtype() != BOOL_DTYPE {
                    return Err(AttentionError::UnsupportedDType {
                        requested: format!("mask expects dtype {BOOL_DTYPE:?}, got {:?}", mask.dtype()),
                    });
                }
                if mask.dims() != [batch, q_len, k_len] {
                    return Err(AttentionError::shape(format!(
                        "mask shape mismatch: expected [{batch}, {q_len}, {k_len}] got {:?}",
                        mask.dims()
                    )));
                }
                to_additive(mask)?.unsqueeze(1)?
            }
            None => build_causal_bias(device, q_len, k_len)?,
        };

        let n_rep = heads / kv_heads;
        let q_work = q.to_dtype(DType::F32)?;
        let k_work = repeat_kv(&k.to_dtype(DType::F32)?, n_rep)?;
        let v_work = repeat_kv(&v.to_dtype(DType::F32)?, n_rep)?.contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q_work
            .contiguous()?
            .matmul(&k_work.t()?.contiguous()?)?
            .affine(scale, 0.0)?
            .broadcast_add(&bias)?;
        let probs = softmax_last_dim(&scores)?;

        let probs = match config.dropout_p {
            Some(p) if !(0.0..1.0).contains(&p) => {
                return Err(AttentionError::shape(format!(
                    "dropout probability must be in [0, 1), got {p}"
                )));
            }
            Some(p) if p > 0.0 => dropout(&probs, p)?,
            _ => probs,
        };

        Ok(probs.matmul(&v_work)?.to_dtype(dtype)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::build_causal_mask;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device, kv_heads: usize) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let q: Vec<f32> = (0..64).map(|i| ((i * 7 % 13) as f32) * 0.05).collect();
        let kv: Vec<f32> = (0..32 * kv_heads).map(|i| ((i * 5 % 11) as f32) * 0.04).collect();
        let q = Tensor::from_vec(q, (1, 2, 4, 8), device)?;
        let k = Tensor::from_vec(kv.clone(), (1, kv_heads, 4, 8), device)?;
        let v = Tensor::from_vec(kv, (1, kv_heads, 4, 8), device)?.affine(-1.0, 0.3)?;
        Ok((q, k, v))
    }

    fn naive_attention(q: &Tensor, k: &Tensor, v: &Tensor, causal: bool) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, kv_heads, k_len, _) = k.dims4()?;
        let group = heads / kv_heads;
        let q_vec = q.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.flatten_all()?.to_vec1::<f32>()?;
        let scale = 1.0 / (head_dim as f32).sqrt();
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        for b in 0..batch {
            for h in 0..heads {
                let kh = h / group;
                for qi in 0..q_len {
                    let visible = if causal { qi + 1 + k_len - q_len } else { k_len };
                    let mut row = vec![0f32; visible];
                    for (ki, slot) in row.iter_mut().enumerate() {
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            dot += q_vec[((b * heads + h) * q_len + qi) * head_dim + d]
                                * k_vec[((b * kv_heads + kh) * k_len + ki) * head_dim + d];
                        }
                        *slot = dot * scale;
                    }
                    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
                    let exps: Vec<f32> = row.iter().map(|x| (x - max).exp()).collect();
                    let denom: f32 = exps.iter().sum();
                    for d in 0..head_dim {
                        let acc: f32 = exps
                            .iter()
                            .enumerate()
                            .map(|(ki, w)| {
                                w / denom * v_vec[((b * kv_heads + kh) * k_len + ki) * head_dim + d]
                            })
                            .sum();
                        output[((b * heads + h) * q_len + qi) * head_dim + d] = acc;
                    }
                }
            }
        }
        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        for kv_heads in [2, 1] {
            let (q, k, v) = build_inputs(&device, kv_heads)?;
            let output = ExactAttention::new()
                .attend(&q, &k, &v, None, &Config::default())
                .unwrap();
            let expected = naive_attention(&q, &k, &v, true)?;
            assert!(max_diff(&output, &expected)? < 1e-5, "kv_heads={kv_heads}");
        }
        Ok(())
    }

    #[test]
    fn boolean_mask_matches_implicit_causal() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 2)?;
        let mask = build_causal_mask(&device, 4)?.unsqueeze(0)?;
        let attention = ExactAttention::new();
        let explicit = attention.attend(&q, &k, &v, Some(&mask), &Config::default()).unwrap();
        let implicit = attention.attend(&q, &k, &v, None, &Config::default()).unwrap();
        assert!(max_diff(&explicit, &implicit)? < 1e-6);
        Ok(())
    }

    #[test]
    fn all_ones_mask_is_bidirectional() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 1)?;
        let mask = Tensor::ones((1, 4, 4), DType::U8, &device)?;
        let output = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask), &Config::default())
            .unwrap();
        let expected = naive_attention(&q, &k, &v, false)?;
        assert!(max_diff(&output, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn head_grouping_must_divide() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 3, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &k, None, &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_validation() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let attention = ExactAttention::new();

        let wrong_shape = Tensor::ones((1, 3, 4), DType::U8, &device).unwrap();
        let err = attention
            .attend(&q, &k, &k, Some(&wrong_shape), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let additive = Tensor::zeros((1, 4, 4), DType::F32, &device).unwrap();
        let err = attention
            .attend(&q, &k, &k, Some(&additive), &Config::default())
            .unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 2)?;
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap();
        for dtype in [DType::BF16, DType::F16] {
            let out = ExactAttention::new()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    None,
                    &Config::default(),
                )
                .unwrap();
            assert_eq!(out.dtype(), dtype);
            let max = max_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {:?} diverged by {max}", dtype);
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let out = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap()
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(out.iter().all(|value| value.is_finite()));
        Ok(())
    }

    #[test]
    fn dropout_zero_probability_is_noop() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 2)?;
        let config = Config { dropout_p: Some(0.0) };
        let out = ExactAttention::new().attend(&q, &k, &v, None, &config).unwrap();
        let reference = ExactAttention::new()
            .attend(&q, &k, &v, None, &Config::default())
            .unwrap();
        assert!(max_diff(&out, &reference)? < 1e-6);
        Ok(())
    }

    #[test]
    fn explicit_config_wins_over_environment() -> CandleResult<()> {
        std::env::set_var(crate::core::config::DROPOUT_ENV, "0.5");
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 2)?;
        let attention = ExactAttention::new();
        let first = attention.attend(&q, &k, &v, None, &Config::default()).unwrap();
        let second = attention.attend(&q, &k, &v, None, &Config::default()).unwrap();
        let reference = naive_attention(&q, &k, &v, true)?;
        assert_eq!(max_diff(&first, &second)?, 0.0);
        assert!(max_diff(&first, &reference)? < 1e-5);
        Ok(())
    }

    #[test]
    fn dropout_out_of_range_is_rejected() {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device, 2).unwrap();
        let config = Config { dropout_p: Some(1.0) };
        let err = ExactAttention::new().attend(&q, &k, &v, None, &config).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }
}
