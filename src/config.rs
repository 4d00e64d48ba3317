//! Pool configuration.
//!
//! A pool is built from nothing (defaults), from a bare positive integer
//! (shorthand for `concurrency`), or from a mapping of recognized options.
//! The last two shapes can also arrive as a `serde_json::Value`; anything
//! else is rejected with [`ForkPoolError::InvalidArgument`].

use crate::error::{ForkPoolError, Result};
use crate::log::{LogSink, TracingSink};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// Default number of workers the master may run at once.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Recognized keys of a configuration mapping.
const RECOGNIZED_KEYS: &[&str] = &["concurrency"];

/// Configuration for a [`ForkPool`](crate::ForkPool).
#[derive(Clone)]
pub struct Config {
    /// Maximum number of worker processes running at once (>= 1).
    pub concurrency: usize,
    /// Destination for log lines.
    pub logger: Arc<dyn LogSink>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            logger: Arc::new(TracingSink),
        }
    }
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the concurrency limit. Zero is rejected.
    pub fn with_concurrency(mut self, concurrency: usize) -> Result<Self> {
        if concurrency == 0 {
            return Err(ForkPoolError::invalid_argument(
                "concurrency must be a positive integer",
            ));
        }
        self.concurrency = concurrency;
        Ok(self)
    }

    /// Set the log sink.
    pub fn with_logger(mut self, logger: Arc<dyn LogSink>) -> Self {
        self.logger = logger;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Reads `FORKPOOL_CONCURRENCY`; unparsable or zero values are ignored.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var("FORKPOOL_CONCURRENCY")
            && let Ok(n) = raw.trim().parse::<usize>()
            && n > 0
        {
            self.concurrency = n;
        }
        self
    }

    /// Build from a loosely-typed value: `null`, a positive integer, or an
    /// object with recognized keys.
    pub fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Number(_) => Self::default().with_concurrency(positive_integer(value)?),
            Value::Object(map) => {
                if let Some(unknown) = map.keys().find(|k| !RECOGNIZED_KEYS.contains(&k.as_str())) {
                    return Err(ForkPoolError::invalid_argument(format!(
                        "unknown option '{}'",
                        unknown
                    )));
                }
                let mut config = Self::default();
                if let Some(concurrency) = map.get("concurrency") {
                    config = config.with_concurrency(positive_integer(concurrency)?)?;
                }
                Ok(config)
            }
            other => Err(ForkPoolError::invalid_argument(format!(
                "expected nothing, a positive integer or an options map, got {}",
                other
            ))),
        }
    }
}

impl TryFrom<Value> for Config {
    type Error = ForkPoolError;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(&value)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

fn positive_integer(value: &Value) -> Result<usize> {
    value
        .as_u64()
        .filter(|n| *n >= 1)
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            ForkPoolError::invalid_argument(format!(
                "concurrency must be a positive integer, got {}",
                value
            ))
        })
}
