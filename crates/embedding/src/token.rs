//! Token embedding layer and tied readout head.

use candle_core::{bail, DType, Device, Error, Result, Tensor, Var};
use layers::PrecisionPolicy;

/// Configuration for building a token embedding table.
#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    /// Size of the vocabulary (number of distinct tokens).
    pub vocab_size: usize,
    /// Dimensionality of each embedding vector.
    pub hidden_dim: usize,
    /// Storage dtype used for the underlying parameters and outputs.
    pub dtype: DType,
    /// Device hosting the parameters.
    pub device: Device,
}

impl TokenEmbeddingConfig {
    fn policy(&self) -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(self.dtype)
    }
}

/// Learnable token embedding table whose transpose doubles as the output
/// projection.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Var,
    policy: PrecisionPolicy,
}

impl TokenEmbedding {
    /// Builds a new token embedding table and samples the parameters from `N(0, 1)`.
    pub fn new(config: TokenEmbeddingConfig) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if config.hidden_dim == 0 {
            bail!("token embedding requires hidden_dim > 0");
        }
        let shape = (config.vocab_size, config.hidden_dim);
        let initial = Tensor::randn(0f32, 1f32, shape, &config.device)?.to_dtype(config.dtype)?;
        Self::from_weight(config, initial)
    }

    /// Wraps an existing `[vocab_size, hidden_dim]` table.
    pub fn from_weight(config: TokenEmbeddingConfig, weight: Tensor) -> Result<Self> {
        if weight.dims() != [config.vocab_size, config.hidden_dim] {
            bail!(
                "embedding weight must be [{}, {}], got {:?}",
                config.vocab_size,
                config.hidden_dim,
                weight.dims()
            );
        }
        let weight = Var::from_tensor(&weight.to_dtype(config.dtype)?)?;
        let policy = config.policy();
        Ok(Self {
            config,
            weight,
            policy,
        })
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    pub fn hidden_dim(&self) -> usize {
        self.config.hidden_dim
    }

    /// The shared `[vocab_size, hidden_dim]` table.
    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    /// Looks up embeddings for the provided token ids.
    ///
    /// Inputs must be shaped `(batch, seq)` with an integer dtype. Outputs follow the
    /// `(batch, seq, hidden)` layout using the configured storage dtype.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = self.validate_token_ids(token_ids)?;
        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;

        self.weight
            .as_tensor()
            .index_select(&flat, 0)?
            .reshape((batch, seq, self.config.hidden_dim))
    }

    /// Tied projection `hidden @ weight^T`.
    ///
    /// `hidden` is `(batch, seq, hidden_dim)`; the product is computed in the
    /// policy's compute dtype and returned in the dtype of `hidden`, so a
    /// sequence slice projects to exactly the rows a full projection would give.
    pub fn project(&self, hidden: &Tensor) -> Result<Tensor> {
        let (batch, seq, hidden_dim) = match hidden.dims() {
            [batch, seq, hidden_dim] => (*batch, *seq, *hidden_dim),
            _ => {
                return Err(Error::Msg(
                    "project expects input shaped [batch, seq, hidden]".into(),
                ))
            }
        };
        if hidden_dim != self.config.hidden_dim {
            return Err(Error::Msg(format!(
                "project expected hidden dim {} but received {}",
                self.config.hidden_dim, hidden_dim
            )));
        }

        let input = self.policy.cast_for_matmul(hidden)?;
        let weight = self.policy.cast_for_matmul(self.weight.as_tensor())?;
        input
            .reshape((batch * seq, hidden_dim))?
            .matmul(&weight.t()?)?
            .reshape((batch, seq, self.config.vocab_size))?
            .to_dtype(hidden.dtype())
    }

    fn validate_token_ids(&self, token_ids: &Tensor) -> Result<(usize, usize)> {
        let (batch, seq) = match token_ids.dims() {
            [batch, seq] if *batch > 0 && *seq > 0 => (*batch, *seq),
            [_, _] => {
                return Err(Error::Msg(
                    "token_ids must have non-zero batch and seq dimensions".into(),
                ))
            }
            _ => return Err(Error::Msg("token_ids must be shaped [batch, seq]".into())),
        };
        if !token_ids.dtype().is_int() {
            return Err(Error::Msg(format!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            )));
        }
        Ok((batch, seq))
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            bail!("encountered negative token id {min_id} (minimum)");
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        let vocab = self.config.vocab_size as i64;
        if max_id >= vocab {
            bail!("token id {max_id} exceeds vocab size {vocab}");
        }
        Ok(())
    }
}
