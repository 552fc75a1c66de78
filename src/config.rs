//! Tool-wide defaults, overridable from the environment and then from CLI flags

use thiserror::Error;

use fragsim_core::freeze::DEFAULT_FRAME_SIZE;
use fragsim_core::quantize::DEFAULT_PRECISION;

pub const ENV_PRECISION: &str = "FRAGSIM_PRECISION";
pub const ENV_FRAME_SIZE: &str = "FRAGSIM_FRAME_SIZE";
pub const ENV_CUTOFF: &str = "FRAGSIM_CUTOFF";

/// Query cutoff used when neither the environment nor a flag sets one
pub const DEFAULT_CUTOFF: f64 = 0.55;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid {expected}")]
    InvalidValue {
        var: &'static str,
        value: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfig {
    pub precision: u16,
    pub frame_size: usize,
    pub cutoff: f64,
    pub limit: Option<usize>,
}

impl Default for ToolConfig {
    fn default() -> Self {
        Self {
            precision: DEFAULT_PRECISION,
            frame_size: DEFAULT_FRAME_SIZE,
            cutoff: DEFAULT_CUTOFF,
            limit: None,
        }
    }
}

impl ToolConfig {
    /// Defaults overlaid with `FRAGSIM_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(value) = lookup(ENV_PRECISION) {
            config.precision = match value.trim().parse::<u16>() {
                Ok(p) if p > 0 => p,
                _ => return Err(invalid(ENV_PRECISION, value, "precision in 1..=65535")),
            };
        }
        if let Some(value) = lookup(ENV_FRAME_SIZE) {
            config.frame_size = match value.trim().parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => return Err(invalid(ENV_FRAME_SIZE, value, "positive frame size")),
            };
        }
        if let Some(value) = lookup(ENV_CUTOFF) {
            config.cutoff = match value.trim().parse::<f64>() {
                Ok(c) if (0.0..=1.0).contains(&c) => c,
                _ => return Err(invalid(ENV_CUTOFF, value, "cutoff in 0..=1")),
            };
        }
        Ok(config)
    }

    /// Apply per-invocation flags on top of the environment
    pub fn with_overrides(
        mut self,
        precision: Option<u16>,
        frame_size: Option<usize>,
        cutoff: Option<f64>,
        limit: Option<usize>,
    ) -> Self {
        if let Some(precision) = precision {
            self.precision = precision;
        }
        if let Some(frame_size) = frame_size {
            self.frame_size = frame_size;
        }
        if let Some(cutoff) = cutoff {
            self.cutoff = cutoff;
        }
        if limit.is_some() {
            self.limit = limit;
        }
        self
    }
}

fn invalid(var: &'static str, value: String, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue { var, value, expected }
}
