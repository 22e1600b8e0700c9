//! Rotary positional embeddings.
//!
//! Sine/cosine tables are built once in `f32` for every position up to
//! `max_seq_len` and indexed with absolute positions, so a cached decode step
//! at position `p` rotates exactly as position `p` of a full forward pass does.
//! Feature pairs `(2i, 2i + 1)` are rotated by `pos * base^(-2i / head_dim)`.

use candle_core::{bail, DType, Device, Result, Tensor};

/// Configuration for rotary positional embeddings.
#[derive(Debug, Clone, PartialEq)]
pub struct RopeConfig {
    /// Per-head dimensionality of the representations being rotated.
    pub head_dim: usize,
    /// Base angle parameter controlling the frequency spectrum.
    pub rope_theta: f32,
}

impl Default for RopeConfig {
    fn default() -> Self {
        Self {
            head_dim: 0,
            rope_theta: 10_000.0,
        }
    }
}

/// Build `(sin, cos)` tables shaped `[max_seq_len, head_dim / 2]` in `f32`.
pub fn sin_cos_tables(max_seq_len: usize, cfg: &RopeConfig, device: &Device) -> Result<(Tensor, Tensor)> {
    let half_dim = cfg.head_dim / 2;
    let base = cfg.rope_theta as f64;
    let inv_freqs: Vec<f64> = (0..half_dim)
        .map(|idx| base.powf(-((2 * idx) as f64) / cfg.head_dim as f64))
        .collect();

    let mut sin_data = Vec::with_capacity(max_seq_len * half_dim);
    let mut cos_data = Vec::with_capacity(max_seq_len * half_dim);
    for pos in 0..max_seq_len {
        for &inv_freq in &inv_freqs {
            let angle = pos as f64 * inv_freq;
            sin_data.push(angle.sin() as f32);
            cos_data.push(angle.cos() as f32);
        }
    }

    let sin = Tensor::from_vec(sin_data, (max_seq_len, half_dim), device)?;
    let cos = Tensor::from_vec(cos_data, (max_seq_len, half_dim), device)?;
    Ok((sin, cos))
}

/// Rotary embedding with precomputed tables.
#[derive(Debug, Clone)]
pub struct Rope {
    config: RopeConfig,
    max_seq_len: usize,
    sin: Tensor,
    cos: Tensor,
}

impl Rope {
    pub fn new(config: RopeConfig, max_seq_len: usize, device: &Device) -> Result<Self> {
        if config.head_dim == 0 || config.head_dim % 2 != 0 {
            bail!("rope head_dim must be even and non-zero, got {}", config.head_dim);
        }
        if max_seq_len == 0 {
            bail!("rope requires max_seq_len > 0");
        }
        let (sin, cos) = sin_cos_tables(max_seq_len, &config, device)?;
        log::debug!(
            "rope tables built: max_seq_len={} head_dim={} theta={}",
            max_seq_len,
            config.head_dim,
            config.rope_theta
        );
        Ok(Self {
            config,
            max_seq_len,
            sin,
            cos,
        })
    }

    pub fn config(&self) -> &RopeConfig {
        &self.config
    }

    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    /// Rotates `x` (`[batch, heads, seq, head_dim]`) at `positions`
    /// (integer `[batch, seq]`). The output keeps the dtype of `x`.
    pub fn apply(&self, x: &Tensor, positions: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq, head_dim) = x.dims4()?;
        if head_dim != self.config.head_dim {
            bail!("rope expects head_dim {}, got {head_dim}", self.config.head_dim);
        }
        if positions.dims() != [batch, seq] {
            bail!("positions must be [{batch}, {seq}], got {:?}", positions.dims());
        }
        if !positions.dtype().is_int() {
            bail!("positions must be an integer tensor, got {:?}", positions.dtype());
        }

        let flat = positions.to_dtype(DType::I64)?.flatten_all()?;
        let max_pos = flat.max_all()?.to_scalar::<i64>()?;
        let min_pos = flat.min_all()?.to_scalar::<i64>()?;
        if min_pos < 0 || max_pos as usize >= self.max_seq_len {
            bail!(
                "rope positions must lie in [0, {}), got range [{min_pos}, {max_pos}]",
                self.max_seq_len
            );
        }

        let half_dim = head_dim / 2;
        let gather = |table: &Tensor| -> Result<Tensor> {
            table
                .index_select(&flat, 0)?
                .reshape((batch, 1, seq, half_dim))?
                .broadcast_as((batch, heads, seq, half_dim))
        };
        let sin = gather(&self.sin)?;
        let cos = gather(&self.cos)?;

        let pairs = x
            .to_dtype(DType::F32)?
            .reshape((batch, heads, seq, half_dim, 2))?;
        let even = pairs.narrow(4, 0, 1)?.squeeze(4)?;
        let odd = pairs.narrow(4, 1, 1)?.squeeze(4)?;

        let rotated_even = (even.mul(&cos)? - odd.mul(&sin)?)?;
        let rotated_odd = (odd.mul(&cos)? + even.mul(&sin)?)?;

        Tensor::stack(&[&rotated_even, &rotated_odd], 4)?
            .reshape((batch, heads, seq, head_dim))?
            .to_dtype(x.dtype())
    }
}
