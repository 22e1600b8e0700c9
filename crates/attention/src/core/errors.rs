//! Error types emitted by attention kernels and caches.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype {requested}")]
    UnsupportedDType { requested: String },
    /// A cache write would land past the configured capacity.
    #[error("kv cache overflow: position {position} exceeds capacity {capacity}")]
    CacheOverflow { position: usize, capacity: usize },
    /// A backend failure propagated from candle.
    #[error(transparent)]
    Backend(#[from] candle_core::Error),
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }
}
