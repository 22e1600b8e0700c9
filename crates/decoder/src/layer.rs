//! Capability interface every decoder layer exposes to the orchestrator.

use candle_core::{DType, Result, Tensor};

/// Role of a layer, which decides the cache lengths it is set up with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LayerKind {
    /// Caches decoder keys/values; receives `decoder_max_seq_len`.
    SelfAttention,
    /// Caches encoder keys/values; receives `encoder_max_seq_len`.
    CrossAttention,
    /// Wraps both; receives both lengths.
    Fusion,
}

impl LayerKind {
    /// Selects the `(encoder, decoder)` cache lengths for this role.
    pub fn route_cache_lengths(
        self,
        encoder_max_seq_len: Option<usize>,
        decoder_max_seq_len: Option<usize>,
    ) -> (Option<usize>, Option<usize>) {
        match self {
            LayerKind::SelfAttention => (None, decoder_max_seq_len),
            LayerKind::CrossAttention => (encoder_max_seq_len, None),
            LayerKind::Fusion => (encoder_max_seq_len, decoder_max_seq_len),
        }
    }

    /// Whether the per-layer compile pass applies to this role.
    pub fn is_compilable(self) -> bool {
        matches!(self, LayerKind::SelfAttention | LayerKind::CrossAttention)
    }
}

/// One transformer block as seen by [`TransformerDecoder`](crate::TransformerDecoder).
///
/// A layer owns its parameters and its key/value cache. It must only read and
/// write its own cache during `forward`.
pub trait DecoderLayer: Send {
    fn kind(&self) -> LayerKind;

    /// Allocates (or reallocates) the layer cache.
    fn setup_cache(
        &mut self,
        batch_size: usize,
        dtype: DType,
        encoder_max_seq_len: Option<usize>,
        decoder_max_seq_len: Option<usize>,
    ) -> Result<()>;

    fn cache_enabled(&self) -> bool;

    /// Zeroes cache contents without releasing them. A no-op without a cache.
    fn reset_cache(&mut self) -> Result<()>;

    /// `hidden` is `[batch, seq, embed_dim]` and the result has the same shape.
    ///
    /// `mask` is boolean `[batch, seq, k_len]`; `None` asks for causal masking
    /// over the current sequence. `input_pos` holds absolute positions
    /// `[batch, seq]`.
    fn forward(
        &mut self,
        hidden: &Tensor,
        mask: Option<&Tensor>,
        input_pos: Option<&Tensor>,
    ) -> Result<Tensor>;

    /// Marks the layer for compilation with `backend`.
    fn compile(&mut self, backend: &str);

    fn compiled_backend(&self) -> Option<&str>;
}
