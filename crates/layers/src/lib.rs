//! Building blocks for decoder layers.
//!
//! Everything here works on `(batch, seq, hidden)` tensors and threads a
//! [`PrecisionPolicy`] through the forward pass so reduced-precision
//! parameters can still be computed in `f32`.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use dtypes::PrecisionPolicy;
