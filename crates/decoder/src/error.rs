use thiserror::Error;

pub type Result<T> = std::result::Result<T, DecoderError>;

#[derive(Debug, Error)]
pub enum DecoderError {
    /// The call was rejected before any layer ran.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("sequence length {seq_len} is not divisible into {num_chunks} output chunks")]
    IndivisibleChunks { seq_len: usize, num_chunks: usize },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

impl DecoderError {
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }
}

impl From<serde_json::Error> for DecoderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(format!("failed to parse config: {err}"))
    }
}

impl From<toml::de::Error> for DecoderError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("failed to parse config: {err}"))
    }
}
