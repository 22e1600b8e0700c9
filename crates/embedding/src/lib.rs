//! Embedding crate
//!
//! Token lookup with a tied readout head, plus rotary positional embeddings
//! applied at absolute token positions.

pub mod positional;
pub mod token;

pub use positional::*;
pub use token::*;
