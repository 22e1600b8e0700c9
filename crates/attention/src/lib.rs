//! Exact attention, masking, and key/value caching for the decoder stack.
//!
//! Attention operates on tensors with layout `[batch, n_heads, seq_len,
//! head_dim]`. Reductions are performed in `f32` and the output matches the
//! query dtype.
//!
//! Masks crossing crate boundaries are boolean (`u8`, `1` = may attend) and
//! shaped `[batch, q_len, k_len]`; they are converted to additive `f32` biases
//! right before the softmax. When no mask is supplied the kernel falls back to
//! a causal mask aligned to the most recent keys.
//!
//! [`kv_cache::KvCache`] holds fixed-capacity key/value buffers addressed by
//! absolute token position, which is what incremental decoding writes into.

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, Config};
