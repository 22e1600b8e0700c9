//! Decoder stack orchestration: embedding, layers, final norm, tied output.
//!
//! Without caches the decoder is in training mode and passes the caller's
//! mask straight to the layers. After [`TransformerDecoder::setup_caches`] it
//! is in cached mode: every forward call must carry absolute positions, and
//! the mask is always the rows of the causal mask at those positions.

use std::fmt;

use attention::masks::{build_causal_mask, gather_mask_rows};
use candle_core::{DType, Device, Tensor};
use embedding::token::{TokenEmbedding, TokenEmbeddingConfig};
use layers::{
    dtypes::PrecisionPolicy,
    norm::{NormConfig, NormalizationLayer, RmsNorm},
};

use crate::block::self_attention_factory;
use crate::config::{DecoderConfig, RuntimeOptions};
use crate::error::{DecoderError, Result};
use crate::layer::DecoderLayer;
use crate::output::{DecoderOutput, FusionPolicy};

pub struct TransformerDecoder {
    config: DecoderConfig,
    embedding: TokenEmbedding,
    layers: Vec<Box<dyn DecoderLayer>>,
    norm: Box<dyn NormalizationLayer>,
    policy: PrecisionPolicy,
    causal_mask: Option<Tensor>,
    num_output_chunks: usize,
    encoder_max_seq_len: Option<usize>,
    decoder_max_seq_len: Option<usize>,
}

impl fmt::Debug for TransformerDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerDecoder")
            .field("num_layers", &self.layers.len())
            .field("max_seq_len", &self.config.max_seq_len)
            .field("caches_are_setup", &self.caches_are_setup())
            .field("num_output_chunks", &self.num_output_chunks)
            .finish()
    }
}

impl TransformerDecoder {
    /// The chunked projector always runs eagerly.
    pub const CHUNKED_OUTPUT_FUSION: FusionPolicy = FusionPolicy::Disabled;

    /// Assembles a decoder, calling `layer_factory` once per layer index.
    pub fn new<F>(
        config: DecoderConfig,
        embedding: TokenEmbedding,
        norm: Box<dyn NormalizationLayer>,
        mut layer_factory: F,
    ) -> Result<Self>
    where
        F: FnMut(usize) -> candle_core::Result<Box<dyn DecoderLayer>>,
    {
        config.validate()?;
        if embedding.vocab_size() != config.vocab_size || embedding.hidden_dim() != config.embed_dim {
            return Err(DecoderError::Config(format!(
                "embedding table is [{}, {}] but config expects [{}, {}]",
                embedding.vocab_size(),
                embedding.hidden_dim(),
                config.vocab_size,
                config.embed_dim
            )));
        }
        if norm.config().hidden_size != config.embed_dim {
            return Err(DecoderError::Config(format!(
                "final norm width {} does not match embed_dim {}",
                norm.config().hidden_size,
                config.embed_dim
            )));
        }

        let layers = (0..config.num_layers)
            .map(&mut layer_factory)
            .collect::<candle_core::Result<Vec<_>>>()?;
        let policy = PrecisionPolicy::from_parameter_dtype(embedding.config().dtype);

        Ok(Self {
            config,
            embedding,
            layers,
            norm,
            policy,
            causal_mask: None,
            num_output_chunks: 0,
            encoder_max_seq_len: None,
            decoder_max_seq_len: None,
        })
    }

    /// Builds a decoder of [`SelfAttentionLayer`](crate::SelfAttentionLayer)s
    /// with freshly initialised weights.
    pub fn from_config(config: DecoderConfig, runtime: &RuntimeOptions) -> Result<Self> {
        config.validate()?;
        let embedding = TokenEmbedding::new(TokenEmbeddingConfig {
            vocab_size: config.vocab_size,
            hidden_dim: config.embed_dim,
            dtype: runtime.dtype,
            device: runtime.device.clone(),
        })?;
        let norm = RmsNorm::identity(
            NormConfig::offset_rms(config.embed_dim, config.norm_eps),
            runtime.dtype,
            &runtime.device,
        )?;
        let layer_config = config.clone();
        Self::new(
            config,
            embedding,
            Box::new(norm),
            self_attention_factory(&layer_config, runtime),
        )
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn embedding(&self) -> &TokenEmbedding {
        &self.embedding
    }

    pub fn layers(&self) -> &[Box<dyn DecoderLayer>] {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut [Box<dyn DecoderLayer>] {
        &mut self.layers
    }

    fn device(&self) -> &Device {
        self.embedding.weight().device()
    }

    /// Allocates every layer cache and builds the causal mask.
    ///
    /// Each layer receives the lengths matching its
    /// [`LayerKind`](crate::LayerKind). Calling this again reallocates caches
    /// and rebuilds the mask. If a layer fails, the mask is dropped and the
    /// recorded lengths keep their previous values.
    pub fn setup_caches(
        &mut self,
        batch_size: usize,
        dtype: DType,
        encoder_max_seq_len: Option<usize>,
        decoder_max_seq_len: Option<usize>,
    ) -> Result<()> {
        if batch_size == 0 {
            return Err(DecoderError::invalid_argument("batch_size must be greater than 0"));
        }
        let causal_mask = build_causal_mask(self.device(), self.config.max_seq_len)?;

        // Cleared until every layer has a cache.
        self.causal_mask = None;
        for layer in self.layers.iter_mut() {
            let (encoder, decoder) = layer
                .kind()
                .route_cache_lengths(encoder_max_seq_len, decoder_max_seq_len);
            layer.setup_cache(batch_size, dtype, encoder, decoder)?;
        }

        if encoder_max_seq_len.is_some() {
            self.encoder_max_seq_len = encoder_max_seq_len;
        }
        if decoder_max_seq_len.is_some() {
            self.decoder_max_seq_len = decoder_max_seq_len;
        }
        self.causal_mask = Some(causal_mask);
        log::info!(
            "kv caches ready: layers={} batch={} dtype={:?} encoder_max_seq_len={:?} decoder_max_seq_len={:?} mask={}x{}",
            self.layers.len(),
            batch_size,
            dtype,
            encoder_max_seq_len,
            decoder_max_seq_len,
            self.config.max_seq_len,
            self.config.max_seq_len
        );
        Ok(())
    }

    /// Whether the first layer has a cache. Layers are assumed to be set up
    /// together by [`setup_caches`](Self::setup_caches).
    pub fn caches_are_setup(&self) -> bool {
        self.layers.first().is_some_and(|layer| layer.cache_enabled())
    }

    /// Zeroes every layer cache so a new sequence can be decoded. Buffers and
    /// the causal mask are kept.
    pub fn reset_caches(&mut self) -> Result<()> {
        for layer in self.layers.iter_mut() {
            layer.reset_cache()?;
        }
        Ok(())
    }

    /// The `[max_seq_len, max_seq_len]` boolean mask, present once caches are set up.
    pub fn causal_mask(&self) -> Option<&Tensor> {
        self.causal_mask.as_ref()
    }

    pub fn encoder_max_seq_len(&self) -> Option<usize> {
        self.encoder_max_seq_len
    }

    pub fn decoder_max_seq_len(&self) -> Option<usize> {
        self.decoder_max_seq_len
    }

    /// `0` disables chunking.
    pub fn set_num_output_chunks(&mut self, num_output_chunks: usize) {
        self.num_output_chunks = num_output_chunks;
    }

    pub fn num_output_chunks(&self) -> usize {
        self.num_output_chunks
    }

    /// Runs the decoder over `tokens` (`[batch, seq]`).
    ///
    /// `mask` is a boolean `[batch, seq, seq]` tensor (`1` = may attend) and is
    /// only accepted without caches; `None` leaves masking to the layers,
    /// which apply a causal mask. `input_pos` (`[batch, seq]` absolute
    /// positions) is required once caches are set up.
    pub fn forward(
        &mut self,
        tokens: &Tensor,
        mask: Option<&Tensor>,
        input_pos: Option<&Tensor>,
    ) -> Result<DecoderOutput> {
        let (batch, seq_len) = tokens.dims2()?;
        if self.num_output_chunks > 0 && seq_len % self.num_output_chunks != 0 {
            return Err(DecoderError::IndivisibleChunks {
                seq_len,
                num_chunks: self.num_output_chunks,
            });
        }

        let mut h = self.embedding.forward(tokens)?;

        let gathered;
        let mask = match &self.causal_mask {
            Some(causal_mask) => {
                let positions = input_pos.ok_or_else(|| {
                    DecoderError::invalid_argument(
                        "caches are set up, but the position of the input tokens is missing",
                    )
                })?;
                if mask.is_some() {
                    return Err(DecoderError::invalid_argument(
                        "an attention mask was supplied; cached decoding only uses the causal mask",
                    ));
                }
                if positions.dims() != [batch, seq_len] {
                    return Err(DecoderError::invalid_argument(format!(
                        "input_pos must be [{batch}, {seq_len}], got {:?}",
                        positions.dims()
                    )));
                }
                gathered = gather_mask_rows(causal_mask, positions)?;
                Some(&gathered)
            }
            None => mask,
        };
        log::debug!(
            "decoder forward: cached={} batch={} seq={} explicit_mask={}",
            self.causal_mask.is_some(),
            batch,
            seq_len,
            mask.is_some()
        );

        if self.config.normalize_embeddings {
            let scale = Tensor::new((self.config.embed_dim as f32).sqrt(), h.device())?
                .to_dtype(h.dtype())?;
            h = h.broadcast_mul(&scale)?;
        }

        for layer in self.layers.iter_mut() {
            h = layer.forward(&h, mask, input_pos)?;
        }

        let h = self.norm.forward(&h, &self.policy)?;

        if self.num_output_chunks > 0 {
            Ok(DecoderOutput::Chunks(self.chunked_output(&h)?))
        } else {
            let logits = self.embedding.project(&h)?;
            Ok(DecoderOutput::Logits(self.policy.upcast_logits(&logits)?))
        }
    }

    /// Projects `last_hidden` (`[batch, seq, embed_dim]`) onto the vocabulary
    /// in `num_output_chunks` equal sequence slices.
    ///
    /// Chunks stay in the hidden dtype; upcasting is left to the consumer,
    /// typically [`ChunkedCrossEntropyLoss`](crate::ChunkedCrossEntropyLoss).
    /// See [`Self::CHUNKED_OUTPUT_FUSION`].
    pub fn chunked_output(&self, last_hidden: &Tensor) -> Result<Vec<Tensor>> {
        let num_chunks = self.num_output_chunks;
        if num_chunks == 0 {
            return Err(DecoderError::invalid_argument(
                "chunked output requires set_num_output_chunks(n > 0)",
            ));
        }
        let (_, seq_len, _) = last_hidden.dims3()?;
        if seq_len % num_chunks != 0 {
            return Err(DecoderError::IndivisibleChunks {
                seq_len,
                num_chunks,
            });
        }
        let chunk_len = seq_len / num_chunks;
        (0..num_chunks)
            .map(|idx| -> Result<Tensor> {
                let chunk = last_hidden.narrow(1, idx * chunk_len, chunk_len)?;
                Ok(self.embedding.project(&chunk)?)
            })
            .collect()
    }
}
