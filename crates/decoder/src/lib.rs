//! Tied-embedding transformer decoder with key/value caching.
//!
//! [`TransformerDecoder`] runs token ids through an embedding table, a stack
//! of [`DecoderLayer`]s and a final norm, then projects back onto the
//! vocabulary with the transposed embedding table. The same forward call
//! serves full-sequence training and incremental decoding once
//! [`TransformerDecoder::setup_caches`] has been called.

pub mod block;
pub mod compile;
pub mod config;
pub mod decoder;
pub mod error;
pub mod layer;
pub mod loss;
pub mod output;

pub use block::{self_attention_factory, SelfAttentionLayer};
pub use compile::{compile_loss, compile_model, CompileReport};
pub use config::{DecoderConfig, Precision, RuntimeOptions};
pub use decoder::TransformerDecoder;
pub use error::{DecoderError, Result};
pub use layer::{DecoderLayer, LayerKind};
pub use loss::ChunkedCrossEntropyLoss;
pub use output::{DecoderOutput, FusionPolicy};
