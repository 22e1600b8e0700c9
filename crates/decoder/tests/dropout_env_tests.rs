//! Runs in its own test binary: it sets `ATTENTION_DROPOUT` for the process.

use anyhow::Result;
use attention::core::config::DROPOUT_ENV;
use candle_core::{DType, Device, Tensor};
use decoder::{DecoderConfig, Precision, RuntimeOptions, TransformerDecoder};

fn config() -> DecoderConfig {
    DecoderConfig {
        vocab_size: 40,
        embed_dim: 8,
        num_layers: 2,
        num_heads: 2,
        num_kv_heads: 1,
        head_dim: 4,
        intermediate_dim: 16,
        max_seq_len: 8,
        norm_eps: 1e-6,
        rope_base: 10_000.0,
        normalize_embeddings: true,
        precision: Precision::Fp32,
    }
}

#[test]
fn cached_decoding_ignores_training_dropout() -> Result<()> {
    std::env::set_var(DROPOUT_ENV, "0.5");
    let config = config();
    let runtime = RuntimeOptions::cpu(&config);
    assert_eq!(runtime.attention.dropout_p, Some(0.5));

    let mut decoder = TransformerDecoder::from_config(config, &runtime)?;
    decoder.setup_caches(1, DType::F32, None, Some(8))?;

    let tokens = Tensor::from_slice(&[3i64, 17, 8, 25], (1, 4), &Device::Cpu)?;
    let positions = Tensor::arange(0u32, 4, &Device::Cpu)?.unsqueeze(0)?;
    let first = decoder
        .forward(&tokens, None, Some(&positions))?
        .into_logits()?;
    decoder.reset_caches()?;
    let second = decoder
        .forward(&tokens, None, Some(&positions))?
        .into_logits()?;

    let diff = first
        .sub(&second)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    assert_eq!(diff, 0.0);
    Ok(())
}
