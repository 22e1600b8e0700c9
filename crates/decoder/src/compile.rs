//! Per-layer and loss compile passes.
//!
//! Compilation here is bookkeeping: layers and the loss record the backend
//! they were compiled for and keep computing exactly as before. Only self-
//! and cross-attention layers are compiled; the chunked output projection is
//! never touched (see [`TransformerDecoder::CHUNKED_OUTPUT_FUSION`]).

use std::env;

use crate::decoder::TransformerDecoder;
use crate::loss::ChunkedCrossEntropyLoss;
use crate::output::FusionPolicy;

/// Environment variable selecting the compile backend.
pub const COMPILE_BACKEND_ENV: &str = "DECODER_COMPILE_BACKEND";
pub const DEFAULT_COMPILE_BACKEND: &str = "eager-fused";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileReport {
    pub backend: String,
    /// Indices of the layers that were compiled, in compile order.
    pub compiled_layers: Vec<usize>,
}

pub fn compile_backend() -> String {
    env::var(COMPILE_BACKEND_ENV).unwrap_or_else(|_| DEFAULT_COMPILE_BACKEND.to_string())
}

/// Compiles every eligible layer of `decoder` in place, last layer first.
pub fn compile_model(decoder: &mut TransformerDecoder, verbose: bool) -> CompileReport {
    let backend = compile_backend();
    if verbose {
        log::info!("compiling decoder layers with backend {backend}; expect a slower first step");
    }

    let mut compiled_layers = Vec::new();
    for (index, layer) in decoder.layers_mut().iter_mut().enumerate().rev() {
        if layer.kind().is_compilable() {
            layer.compile(&backend);
            compiled_layers.push(index);
        }
    }

    if TransformerDecoder::CHUNKED_OUTPUT_FUSION == FusionPolicy::Disabled {
        log::debug!("chunked output projection left uncompiled");
    }

    CompileReport {
        backend,
        compiled_layers,
    }
}

/// Compiles `loss` with the environment-selected backend and returns it.
pub fn compile_loss(loss: ChunkedCrossEntropyLoss, verbose: bool) -> ChunkedCrossEntropyLoss {
    let backend = compile_backend();
    if verbose {
        log::info!("compiling loss with backend {backend}");
    }
    loss.apply_compile_strategy(&backend)
}
