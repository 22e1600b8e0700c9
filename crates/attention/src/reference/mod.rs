//! Portable, exact implementation of scaled dot-product attention.
//!
//! The path favours clarity over absolute performance: scores and softmax are
//! computed in `f32` on whatever device the inputs live on.

pub mod exact;

pub use exact::ExactAttention;
