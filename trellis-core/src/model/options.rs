//! Model configuration.
//!
//! Options can be built in code or deserialized from JSON using the same
//! camelCase field names JSON Graph clients use.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{DEFAULT_COLLECT_RATIO, DEFAULT_MAX_SIZE};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ModelOptions {
    /// Upper bound on the cache's accounted size.
    pub max_size: usize,

    /// Fraction of `max_size` eviction shrinks the cache to.
    pub collect_ratio: f64,

    /// Let synchronous accessors run outside request selectors.
    pub unsafe_mode: bool,

    /// Deliver leaves in their `$type` envelopes.
    pub boxed: bool,

    /// Emit each value as it settles instead of once at the end.
    pub progressive: bool,

    /// Batching window in milliseconds. `None` flushes on the next tick.
    pub batch_delay_ms: Option<u64>,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_SIZE,
            collect_ratio: DEFAULT_COLLECT_RATIO,
            unsafe_mode: true,
            boxed: false,
            progressive: false,
            batch_delay_ms: None,
        }
    }
}

impl ModelOptions {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|err| Error::Configuration(format!("invalid model options: {err}")))?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(Error::Configuration("maxSize must be positive".into()));
        }
        if !(self.collect_ratio > 0.0 && self.collect_ratio <= 1.0) {
            return Err(Error::Configuration(format!(
                "collectRatio must be in (0, 1], got {}",
                self.collect_ratio
            )));
        }
        Ok(())
    }
}
