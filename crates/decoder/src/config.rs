//! Decoder hyperparameters and runtime options.

use std::{fs, path::Path};

use attention::Config as AttentionConfig;
use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

use crate::error::{DecoderError, Result};

/// Parameter storage precision.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

/// Construction-time hyperparameters of a tied-embedding decoder.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct DecoderConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    /// Key/value heads; query heads are grouped over them.
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub intermediate_dim: usize,
    /// Size of the causal mask and of the rotary tables.
    pub max_seq_len: usize,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_rope_base")]
    pub rope_base: f32,
    /// Scale token embeddings by `sqrt(embed_dim)` before the first layer.
    #[serde(default)]
    pub normalize_embeddings: bool,
    #[serde(default)]
    pub precision: Precision,
}

fn default_norm_eps() -> f64 {
    1e-6
}

fn default_rope_base() -> f32 {
    10_000.0
}

impl DecoderConfig {
    /// Loads a config from JSON (`.json`) or TOML (`.toml` or no extension)
    /// and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: DecoderConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DecoderError::Config(format!(
                    "unsupported configuration extension '{other}'"
                )))
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reports every structural problem at once.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("vocab_size", self.vocab_size),
            ("embed_dim", self.embed_dim),
            ("num_layers", self.num_layers),
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("head_dim", self.head_dim),
            ("intermediate_dim", self.intermediate_dim),
            ("max_seq_len", self.max_seq_len),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        if self.num_kv_heads > 0 && self.num_heads % self.num_kv_heads != 0 {
            errors.push(format!(
                "num_heads ({}) must be divisible by num_kv_heads ({})",
                self.num_heads, self.num_kv_heads
            ));
        }
        if self.head_dim % 2 != 0 {
            errors.push(format!("head_dim ({}) must be even for rotary embeddings", self.head_dim));
        }
        if self.norm_eps <= 0.0 {
            errors.push("norm_eps must be positive".to_string());
        }
        if self.rope_base <= 1.0 {
            errors.push("rope_base must be greater than 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DecoderError::Config(errors.join("; ")))
        }
    }
}

/// Where and how a decoder is materialised.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub device: Device,
    pub dtype: DType,
    /// Attention knobs for the uncached (training) path.
    pub attention: AttentionConfig,
}

impl RuntimeOptions {
    /// Options for `config.precision` on `device`, with attention settings
    /// taken from the environment.
    pub fn new(config: &DecoderConfig, device: Device) -> Self {
        Self {
            device,
            dtype: config.precision.dtype(),
            attention: AttentionConfig::from_env(),
        }
    }

    pub fn cpu(config: &DecoderConfig) -> Self {
        Self::new(config, Device::Cpu)
    }
}
