pub mod rope;

pub use rope::{Rope, RopeConfig};
