//! Run-time knobs shared by attention implementations.

use std::env;

/// Environment variable overriding [`Config::dropout_p`].
pub const DROPOUT_ENV: &str = "ATTENTION_DROPOUT";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    pub dropout_p: Option<f32>,
}

impl Config {
    /// Default configuration with `ATTENTION_DROPOUT` applied when set.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env_overrides();
        cfg
    }

    /// Layers environment overrides on top of the current values. Unparseable
    /// values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(raw) = env::var(DROPOUT_ENV) {
            match raw.trim().parse::<f32>() {
                Ok(p) => self.dropout_p = Some(p),
                Err(_) => log::warn!("ignoring {DROPOUT_ENV}={raw:?}: not a float"),
            }
        }
    }
}
