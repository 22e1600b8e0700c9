//! Fixed-capacity key/value cache addressed by absolute position.

use candle_core::{DType, Device, Tensor};

use crate::core::AttentionError;
use crate::kv_cache::layout::CacheLayout;

#[derive(Debug)]
pub struct KvCache {
    layout: CacheLayout,
    dtype: DType,
    keys: Tensor,
    values: Tensor,
    filled: usize,
}

impl KvCache {
    /// Allocates zeroed key and value buffers.
    pub fn new(layout: CacheLayout, dtype: DType, device: &Device) -> Result<Self, AttentionError> {
        if layout.elem_count() == 0 {
            return Err(AttentionError::shape(format!(
                "kv cache dimensions must be non-zero, got {layout:?}"
            )));
        }
        if !dtype.is_float() {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        let keys = Tensor::zeros(layout.dims(), dtype, device)?;
        let values = Tensor::zeros(layout.dims(), dtype, device)?;
        log::info!(
            "kv-cache init: batch={} heads={} max_seq_len={} head_dim={} dtype={:?}",
            layout.batch,
            layout.num_heads,
            layout.max_seq_len,
            layout.head_dim,
            dtype
        );
        Ok(Self {
            layout,
            dtype,
            keys,
            values,
            filled: 0,
        })
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// One past the highest position written since allocation or reset.
    pub fn filled_len(&self) -> usize {
        self.filled
    }

    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    /// Zeroes both buffers, keeping their allocation geometry.
    pub fn reset(&mut self) -> Result<(), AttentionError> {
        self.keys = self.keys.zeros_like()?;
        self.values = self.values.zeros_like()?;
        self.filled = 0;
        Ok(())
    }

    /// Writes `k`/`v` (`[batch, heads, seq, head_dim]`) at `positions`
    /// (`[batch, seq]`) and returns the full buffers.
    ///
    /// Positions in each batch row must be consecutive; rows may start at
    /// different offsets.
    pub fn update(
        &mut self,
        k: &Tensor,
        v: &Tensor,
        positions: &Tensor,
    ) -> Result<(Tensor, Tensor), AttentionError> {
        let (batch, heads, seq, head_dim) = k.dims4()?;
        if k.dims() != v.dims() {
            return Err(AttentionError::shape(format!(
                "k {:?} and v {:?} must share a shape",
                k.dims(),
                v.dims()
            )));
        }
        let layout = &self.layout;
        if (batch, heads, head_dim) != (layout.batch, layout.num_heads, layout.head_dim) {
            return Err(AttentionError::shape(format!(
                "cache expects [{}, {}, seq, {}] got {:?}",
                self.layout.batch,
                self.layout.num_heads,
                self.layout.head_dim,
                k.dims()
            )));
        }
        if positions.dims() != [batch, seq] {
            return Err(AttentionError::shape(format!(
                "positions must be [{batch}, {seq}], got {:?}",
                positions.dims()
            )));
        }

        let starts = self.row_starts(positions, seq)?;
        let k = k.to_dtype(self.dtype)?;
        let v = v.to_dtype(self.dtype)?;

        for (row, &start) in starts.iter().enumerate() {
            let ranges = [row..row + 1, 0..heads, start..start + seq, 0..head_dim];
            let k_row = k.narrow(0, row, 1)?.contiguous()?;
            let v_row = v.narrow(0, row, 1)?.contiguous()?;
            self.keys = self.keys.slice_assign(&ranges, &k_row)?;
            self.values = self.values.slice_assign(&ranges, &v_row)?;
            self.filled = self.filled.max(start + seq);
        }

        Ok((self.keys.clone(), self.values.clone()))
    }

    fn row_starts(&self, positions: &Tensor, seq: usize) -> Result<Vec<usize>, AttentionError> {
        if !positions.dtype().is_int() {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("positions {:?}", positions.dtype()),
            });
        }
        let rows = positions.to_dtype(DType::I64)?.to_vec2::<i64>()?;
        let capacity = self.layout.max_seq_len;
        let mut starts = Vec::with_capacity(rows.len());
        for row in rows {
            let first = row.first().copied().unwrap_or(0);
            if first < 0 {
                return Err(AttentionError::shape(format!(
                    "positions must be non-negative, got {first}"
                )));
            }
            if row.iter().enumerate().any(|(i, &p)| p != first + i as i64) {
                return Err(AttentionError::shape(format!(
                    "positions within a row must be consecutive, got {row:?}"
                )));
            }
            let start = first as usize;
            if start + seq > capacity {
                return Err(AttentionError::CacheOverflow {
                    position: start + seq - 1,
                    capacity,
                });
            }
            starts.push(start);
        }
        Ok(starts)
    }
}
