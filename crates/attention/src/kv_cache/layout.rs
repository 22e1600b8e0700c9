//! Layout definitions for key/value caches.

/// Geometry of a cache buffer shaped `[batch, num_heads, max_seq_len, head_dim]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLayout {
    pub batch: usize,
    /// Number of key/value heads stored in the cache.
    pub num_heads: usize,
    /// Capacity along the sequence axis.
    pub max_seq_len: usize,
    pub head_dim: usize,
}

impl CacheLayout {
    pub fn dims(&self) -> (usize, usize, usize, usize) {
        (self.batch, self.num_heads, self.max_seq_len, self.head_dim)
    }

    /// Elements held by one of the two (key or value) buffers.
    pub fn elem_count(&self) -> usize {
        self.batch * self.num_heads * self.max_seq_len * self.head_dim
    }
}
