//! Mask utilities shared by attention implementations.
//!
//! Two representations exist:
//!
//! * boolean masks (dtype [`BOOL_DTYPE`], `1` = attend) are what callers pass
//!   around, e.g. the `[max_seq_len, max_seq_len]` causal table and the
//!   `[batch, q_len, k_len]` rows gathered from it;
//! * additive masks (dtype [`MASK_DTYPE`]) hold `0.0` (keep) or
//!   `f32::NEG_INFINITY` (discard) and are added to attention scores.

pub mod causal;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

/// Dtype used for boolean masks.
pub const BOOL_DTYPE: DType = DType::U8;

pub use causal::{build_causal_bias, build_causal_mask, gather_mask_rows, to_additive};
