//! Runtime configuration.
//!
//! Every field has a default, so an empty JSON object or an empty
//! environment yields a working in-memory setup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::{ActorflowError, Result};
use crate::observability::LogFormat;
use crate::retry::RetryPolicy;

/// Gateway settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Default call deadline in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 30_000,
        }
    }
}

impl GatewayConfig {
    /// The call deadline.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Queue bridge settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Redeliveries after the first attempt.
    pub max_retries: u32,
    /// Backoff base in milliseconds.
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds.
    pub max_delay_ms: u64,
    /// Messages requested per receive.
    pub batch_size: usize,
    /// Messages processed at once within a batch.
    pub max_concurrency: usize,
    /// Acknowledge a fully successful batch with one call.
    pub ack_all: bool,
    /// Wait between empty receives in the consumer loop.
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 60_000,
            batch_size: 10,
            max_concurrency: 8,
            ack_all: false,
            poll_interval_ms: 100,
        }
    }
}

impl BridgeConfig {
    /// The redelivery policy described by this config.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new()
            .with_max_retries(self.max_retries)
            .with_base_delay_ms(self.base_delay_ms)
            .with_max_delay_ms(self.max_delay_ms)
    }

    /// The consumer loop's idle wait.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Storage settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for the file backend; in-memory storage when unset.
    pub root: Option<PathBuf>,
}

/// Registry settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Salt mixed into every identity.
    pub salt: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorflowConfig {
    /// Gateway settings.
    pub gateway: GatewayConfig,
    /// Queue bridge settings.
    pub bridge: BridgeConfig,
    /// Storage settings.
    pub storage: StorageConfig,
    /// Registry settings.
    pub registry: RegistryConfig,
    /// Log output format.
    pub log_format: LogFormat,
}

impl ActorflowConfig {
    /// Creates the default config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` for malformed JSON.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Overlays `ACTORFLOW_*` environment variables on the defaults.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the variable that failed to parse.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`ActorflowConfig::from_env`] with a custom variable source.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` naming the variable that failed to parse.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);
        let mut config = Self::default();

        if let Some(ms) = env.parse("ACTORFLOW_CALL_TIMEOUT_MS")? {
            config.gateway.call_timeout_ms = ms;
        }
        if let Some(retries) = env.parse("ACTORFLOW_MAX_RETRIES")? {
            config.bridge.max_retries = retries;
        }
        if let Some(ms) = env.parse("ACTORFLOW_BASE_DELAY_MS")? {
            config.bridge.base_delay_ms = ms;
        }
        if let Some(ms) = env.parse("ACTORFLOW_MAX_DELAY_MS")? {
            config.bridge.max_delay_ms = ms;
        }
        if let Some(size) = env.parse("ACTORFLOW_BATCH_SIZE")? {
            config.bridge.batch_size = size;
        }
        if let Some(n) = env.parse("ACTORFLOW_MAX_CONCURRENCY")? {
            config.bridge.max_concurrency = n;
        }
        if let Some(ack_all) = env.bool("ACTORFLOW_ACK_ALL")? {
            config.bridge.ack_all = ack_all;
        }
        if let Some(ms) = env.parse("ACTORFLOW_POLL_INTERVAL_MS")? {
            config.bridge.poll_interval_ms = ms;
        }
        if let Some(root) = env.string("ACTORFLOW_STORAGE_ROOT") {
            config.storage.root = Some(PathBuf::from(root));
        }
        config.registry.salt = env.string("ACTORFLOW_REGISTRY_SALT");
        if let Some(format) = env.string("ACTORFLOW_LOG_FORMAT") {
            config.log_format = format
                .parse()
                .map_err(|e: String| ActorflowError::invalid_argument("ACTORFLOW_LOG_FORMAT", e))?;
        }

        Ok(config)
    }

    /// Sets the default call deadline.
    #[must_use]
    pub fn with_call_timeout_ms(mut self, ms: u64) -> Self {
        self.gateway.call_timeout_ms = ms;
        self
    }

    /// Sets the bridge redelivery budget.
    #[must_use]
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.bridge.max_retries = retries;
        self
    }

    /// Sets the bridge backoff base and cap.
    #[must_use]
    pub fn with_backoff_ms(mut self, base: u64, max: u64) -> Self {
        self.bridge.base_delay_ms = base;
        self.bridge.max_delay_ms = max;
        self
    }

    /// Sets the bridge batch size.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.bridge.batch_size = size;
        self
    }

    /// Sets the bridge concurrency bound.
    #[must_use]
    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.bridge.max_concurrency = n;
        self
    }

    /// Enables batch-wide acknowledgement.
    #[must_use]
    pub fn with_ack_all(mut self, ack_all: bool) -> Self {
        self.bridge.ack_all = ack_all;
        self
    }

    /// Uses file storage under `root`.
    #[must_use]
    pub fn with_storage_root(mut self, root: impl AsRef<Path>) -> Self {
        self.storage.root = Some(root.as_ref().to_path_buf());
        self
    }

    /// Sets the registry salt.
    #[must_use]
    pub fn with_salt(mut self, salt: impl Into<String>) -> Self {
        self.registry.salt = Some(salt.into());
        self
    }

    /// Sets the log format.
    #[must_use]
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name).and_then(|v| {
            let trimmed = v.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        v.parse::<T>()
            .map(Some)
            .map_err(|e| ActorflowError::invalid_argument(name, format!("not a number: {e}")))
    }

    fn bool(&self, name: &str) -> Result<Option<bool>> {
        let Some(v) = self.string(name) else {
            return Ok(None);
        };
        match v.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(Some(true)),
            "false" | "0" | "no" | "n" => Ok(Some(false)),
            _ => Err(ActorflowError::invalid_argument(
                name,
                "must be a boolean (true/false/1/0)",
            )),
        }
    }
}
