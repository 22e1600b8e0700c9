//! Key/value cache management for incremental decoding.
//!
//! Each decoder layer owns one [`KvCache`]. Buffers are allocated up front at
//! full capacity and written in place at absolute token positions, so the
//! attention kernel always sees `max_seq_len` keys; unwritten slots are hidden
//! by the causal mask rows selected for the current positions.

pub mod cache;
pub mod layout;

pub use cache::KvCache;
pub use layout::CacheLayout;
