//! Reference pre-norm self-attention block.

use std::fmt;

use attention::core::{Attention, AttentionError, Config as AttentionConfig};
use attention::kv_cache::{CacheLayout, KvCache};
use attention::reference::ExactAttention;
use candle_core::{bail, DType, Device, Error, Result, Tensor};
use embedding::positional::rope::{Rope, RopeConfig};
use layers::{
    activations::ActivationKind,
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
    mlp::{FeedForward, FeedForwardConfig},
    norm::{NormConfig, NormalizationLayer, RmsNorm},
};

use crate::config::{DecoderConfig, RuntimeOptions};
use crate::layer::{DecoderLayer, LayerKind};

fn attention_error(err: AttentionError) -> Error {
    Error::Msg(err.to_string())
}

/// `x + attn(norm(x))` followed by `x + mlp(norm(x))`, with rotary
/// embeddings and grouped-query heads.
pub struct SelfAttentionLayer {
    index: usize,
    embed_dim: usize,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
    max_seq_len: usize,
    device: Device,
    policy: PrecisionPolicy,
    norm_attn: RmsNorm,
    norm_mlp: RmsNorm,
    qkv_proj: Linear,
    out_proj: Linear,
    mlp: FeedForward,
    rope: Rope,
    attention: ExactAttention,
    attention_config: AttentionConfig,
    kv_cache: Option<KvCache>,
    compiled_backend: Option<String>,
}

impl fmt::Debug for SelfAttentionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelfAttentionLayer")
            .field("index", &self.index)
            .field("num_heads", &self.num_heads)
            .field("num_kv_heads", &self.num_kv_heads)
            .field("head_dim", &self.head_dim)
            .field("cache_enabled", &self.kv_cache.is_some())
            .finish()
    }
}

impl SelfAttentionLayer {
    /// Builds layer `index` with freshly initialised parameters.
    pub fn new(index: usize, config: &DecoderConfig, runtime: &RuntimeOptions) -> Result<Self> {
        let (device, dtype) = (&runtime.device, runtime.dtype);
        let policy = PrecisionPolicy::from_parameter_dtype(dtype);

        let norm_config = NormConfig::offset_rms(config.embed_dim, config.norm_eps);
        let norm_attn = RmsNorm::identity(norm_config.clone(), dtype, device)?;
        let norm_mlp = RmsNorm::identity(norm_config, dtype, device)?;

        let q_width = config.num_heads * config.head_dim;
        let kv_width = config.num_kv_heads * config.head_dim;
        let qkv_proj = Linear::with_init(
            LinearConfig::new(config.embed_dim, q_width + 2 * kv_width),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;
        let residual_scale = 1.0 / (2.0 * config.num_layers as f64).sqrt();
        let out_proj = Linear::with_init(
            LinearConfig::new(q_width, config.embed_dim),
            &LinearInit::scaled(LinearInit::XavierUniform, residual_scale),
            device,
            dtype,
        )?;
        let mlp = FeedForward::with_init(
            FeedForwardConfig {
                hidden_size: config.embed_dim,
                intermediate_size: config.intermediate_dim,
                activation: ActivationKind::GeluTanh,
            },
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?;

        let rope = Rope::new(
            RopeConfig {
                head_dim: config.head_dim,
                rope_theta: config.rope_base,
            },
            config.max_seq_len,
            device,
        )?;

        Ok(Self {
            index,
            embed_dim: config.embed_dim,
            num_heads: config.num_heads,
            num_kv_heads: config.num_kv_heads,
            head_dim: config.head_dim,
            max_seq_len: config.max_seq_len,
            device: device.clone(),
            policy,
            norm_attn,
            norm_mlp,
            qkv_proj,
            out_proj,
            mlp,
            rope,
            attention: ExactAttention::new(),
            attention_config: runtime.attention.clone(),
            kv_cache: None,
            compiled_backend: None,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kv_cache(&self) -> Option<&KvCache> {
        self.kv_cache.as_ref()
    }

    /// `[batch, seq, heads * head_dim]` -> `[batch, heads, seq, head_dim]`.
    fn split_heads(&self, tensor: &Tensor, heads: usize) -> Result<Tensor> {
        let (batch, seq, _) = tensor.dims3()?;
        tensor
            .reshape((batch, seq, heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn merge_heads(&self, tensor: &Tensor) -> Result<Tensor> {
        let (batch, heads, seq, head_dim) = tensor.dims4()?;
        tensor
            .transpose(1, 2)?
            .reshape((batch, seq, heads * head_dim))
    }

    fn default_positions(&self, batch: usize, seq: usize) -> Result<Tensor> {
        Tensor::arange(0u32, seq as u32, &self.device)?
            .unsqueeze(0)?
            .broadcast_as((batch, seq))?
            .contiguous()
    }

    fn attend(
        &mut self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
        input_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        let Some(cache) = self.kv_cache.as_mut() else {
            return self
                .attention
                .attend(q, k, v, mask, &self.attention_config)
                .map_err(attention_error);
        };

        let (Some(positions), Some(mask)) = (input_pos, mask) else {
            bail!("layer {}: cached attention requires input positions and a mask", self.index);
        };
        let capacity = cache.layout().max_seq_len;
        let mask_width = mask.dim(2)?;
        if mask_width < capacity {
            bail!(
                "layer {}: mask covers {mask_width} keys but the cache holds {capacity}",
                self.index
            );
        }
        let mask = mask.narrow(2, 0, capacity)?.contiguous()?;

        let (keys, values) = cache.update(k, v, positions).map_err(attention_error)?;
        let keys = keys.to_dtype(q.dtype())?;
        let values = values.to_dtype(q.dtype())?;
        // Dropout only applies to the uncached path.
        self.attention
            .attend(q, &keys, &values, Some(&mask), &AttentionConfig::default())
            .map_err(attention_error)
    }
}

impl DecoderLayer for SelfAttentionLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::SelfAttention
    }

    fn setup_cache(
        &mut self,
        batch_size: usize,
        dtype: DType,
        _encoder_max_seq_len: Option<usize>,
        decoder_max_seq_len: Option<usize>,
    ) -> Result<()> {
        let max_seq_len = decoder_max_seq_len.unwrap_or(self.max_seq_len);
        if max_seq_len > self.max_seq_len {
            bail!(
                "layer {}: decoder_max_seq_len {max_seq_len} exceeds max_seq_len {}",
                self.index,
                self.max_seq_len
            );
        }
        let layout = CacheLayout {
            batch: batch_size,
            num_heads: self.num_kv_heads,
            max_seq_len,
            head_dim: self.head_dim,
        };
        self.kv_cache = Some(KvCache::new(layout, dtype, &self.device).map_err(attention_error)?);
        Ok(())
    }

    fn cache_enabled(&self) -> bool {
        self.kv_cache.is_some()
    }

    fn reset_cache(&mut self) -> Result<()> {
        match self.kv_cache.as_mut() {
            Some(cache) => cache.reset().map_err(attention_error),
            None => Ok(()),
        }
    }

    fn forward(
        &mut self,
        hidden: &Tensor,
        mask: Option<&Tensor>,
        input_pos: Option<&Tensor>,
    ) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("self_attention.input", hidden, self.embed_dim)?;
        let (batch, seq, _) = hidden.dims3()?;
        let positions = match input_pos {
            Some(pos) => pos.clone(),
            None => self.default_positions(batch, seq)?,
        };

        let normed = self.norm_attn.forward(hidden, &self.policy)?;
        let qkv = self.qkv_proj.forward(&normed, &self.policy)?;
        let q_width = self.num_heads * self.head_dim;
        let kv_width = self.num_kv_heads * self.head_dim;
        let q = self.split_heads(&qkv.narrow(2, 0, q_width)?, self.num_heads)?;
        let k = self.split_heads(&qkv.narrow(2, q_width, kv_width)?, self.num_kv_heads)?;
        let v = self.split_heads(&qkv.narrow(2, q_width + kv_width, kv_width)?, self.num_kv_heads)?;

        let q = self.rope.apply(&q, &positions)?;
        let k = self.rope.apply(&k, &positions)?;

        let attn = self.attend(&q, &k, &v, mask, input_pos)?;
        let projected = self.out_proj.forward(&self.merge_heads(&attn)?, &self.policy)?;
        let after_attn = (hidden + projected)?;

        let normed_mlp = self.norm_mlp.forward(&after_attn, &self.policy)?;
        let mlp_out = self.mlp.forward(&normed_mlp, &self.policy)?;
        after_attn + mlp_out
    }

    fn compile(&mut self, backend: &str) {
        self.compiled_backend = Some(backend.to_string());
    }

    fn compiled_backend(&self) -> Option<&str> {
        self.compiled_backend.as_deref()
    }
}

/// Layer factory for [`TransformerDecoder::new`](crate::TransformerDecoder::new):
/// each call builds an independent layer with its own parameters.
pub fn self_attention_factory<'a>(
    config: &'a DecoderConfig,
    runtime: &'a RuntimeOptions,
) -> impl FnMut(usize) -> Result<Box<dyn DecoderLayer>> + 'a {
    move |index| {
        let layer = SelfAttentionLayer::new(index, config, runtime)?;
        Ok(Box::new(layer) as Box<dyn DecoderLayer>)
    }
}
