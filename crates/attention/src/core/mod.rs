//! Core traits and types shared across attention implementations.
//!
//! * `q` is `[batch, n_heads, q_len, head_dim]`.
//! * `k` and `v` are `[batch, n_kv_heads, k_len, head_dim]`, where `n_heads`
//!   must be a multiple of `n_kv_heads` (grouped-query attention).
//! * Masks, when present, are boolean `[batch, q_len, k_len]`.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
pub trait Attention {
    /// Compute attention. A `None` mask means causal attention where the
    /// queries line up with the last `q_len` keys.
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor, AttentionError>;
}
