//! Control plane configuration loader
//!
//! Loads [`ControlPlaneConfig`] from a TOML or JSON file (or string), then
//! applies environment overrides.
//!
//! ## Environment Variables
//! - `ACCORA_BREAKER_FAILURE_THRESHOLD`: failures that open a breaker
//! - `ACCORA_BREAKER_TIMEOUT_MS`: how long a breaker stays open
//! - `ACCORA_BREAKER_VOLUME_THRESHOLD`: minimum window volume for the
//!   percentage trip (0 disables it)
//! - `ACCORA_RETRY_MAX_RETRIES`: retries after the first attempt
//! - `ACCORA_RETRY_INITIAL_DELAY_MS`: first backoff delay
//! - `ACCORA_RETRY_MAX_DELAY_MS`: backoff cap
//! - `ACCORA_TX_MAX_RETRIES`: default transaction retries
//! - `ACCORA_TX_TIMEOUT_MS`: default transaction deadline
//! - `ACCORA_TX_IDEMPOTENCY_TTL_MS`: lifetime of stored idempotent results
//! - `ACCORA_QUEUE_MAX_SIZE`: pending entries allowed per queue
//! - `ACCORA_QUEUE_DEFAULT_MAX_RETRIES`: replays granted by default
//!
//! Every section is optional; missing values keep their defaults.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult, ControlResult};
use crate::queue::QueueConfig;
use crate::resilience::{CircuitBreakerConfig, RetryPolicy};
use crate::transaction::TransactionConfig;

/// Prefix shared by every environment override
pub const ENV_PREFIX: &str = "ACCORA_";

/// Top-level configuration for a [`ResilienceContext`](crate::ResilienceContext)
/// and the components built around it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// Config used for breakers created through the context
    pub circuit_breaker: CircuitBreakerConfig,
    /// Default retry policy for call sites that do not bring their own
    pub retry: RetryPolicy,
    pub transaction: TransactionConfig,
    pub queue: QueueConfig,
}

impl ControlPlaneConfig {
    /// Parse a TOML document
    pub fn from_toml_str(contents: &str) -> ControlResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file, then apply environment overrides
    ///
    /// # Errors
    /// Returns `ControlError::Config` for a missing file, an unsupported
    /// extension, or an invalid value, and a serialization error when the
    /// file does not parse.
    pub fn load(path: &Path) -> ControlResult<Self> {
        if !path.exists() {
            return Err(ConfigError::invalid(format!("Config file not found: {}", path.display()))
                .into());
        }

        tracing::info!(path = %path.display(), "Loading control plane configuration");
        let contents = std::fs::read_to_string(path)?;

        let mut config: Self = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&contents)?,
            Some("json") => serde_json::from_str(&contents)?,
            other => {
                return Err(ConfigError::invalid(format!(
                    "Unsupported config format: {}",
                    other.unwrap_or("<none>")
                ))
                .into())
            }
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ACCORA_*` overrides from the process environment
    pub fn apply_env(&mut self) -> ConfigResult<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup` (keys include the prefix)
    pub fn apply_overrides<L>(&mut self, lookup: L) -> ConfigResult<()>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = Overrides { lookup };

        if let Some(threshold) = env.parse("BREAKER_FAILURE_THRESHOLD")? {
            self.circuit_breaker.failure_threshold = threshold;
        }
        if let Some(timeout) = env.millis("BREAKER_TIMEOUT_MS")? {
            self.circuit_breaker.timeout = timeout;
        }
        if let Some(volume) = env.parse("BREAKER_VOLUME_THRESHOLD")? {
            self.circuit_breaker.volume_threshold = volume;
        }

        if let Some(retries) = env.parse("RETRY_MAX_RETRIES")? {
            self.retry.max_retries = retries;
        }
        if let Some(delay) = env.millis("RETRY_INITIAL_DELAY_MS")? {
            self.retry.initial_delay = delay;
        }
        if let Some(delay) = env.millis("RETRY_MAX_DELAY_MS")? {
            self.retry.max_delay = delay;
        }

        if let Some(retries) = env.parse("TX_MAX_RETRIES")? {
            self.transaction.retry.max_retries = retries;
        }
        if let Some(timeout) = env.millis("TX_TIMEOUT_MS")? {
            self.transaction.timeout = timeout;
        }
        if let Some(ttl) = env.millis("TX_IDEMPOTENCY_TTL_MS")? {
            self.transaction.idempotency_ttl = ttl;
        }

        if let Some(size) = env.parse("QUEUE_MAX_SIZE")? {
            self.queue.max_queue_size = size;
        }
        if let Some(retries) = env.parse("QUEUE_DEFAULT_MAX_RETRIES")? {
            self.queue.default_max_retries = retries;
        }

        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        self.circuit_breaker.validate()?;
        self.retry.validate()?;
        self.transaction.validate()?;
        self.queue.validate()
    }
}

struct Overrides<L> {
    lookup: L,
}

impl<L: Fn(&str) -> Option<String>> Overrides<L> {
    fn parse<T: FromStr>(&self, suffix: &str) -> ConfigResult<Option<T>>
    where
        T::Err: std::fmt::Display,
    {
        let key = format!("{ENV_PREFIX}{suffix}");
        match (self.lookup)(&key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::field(key, format!("invalid value '{raw}': {e}"))),
        }
    }

    fn millis(&self, suffix: &str) -> ConfigResult<Option<Duration>> {
        Ok(self.parse::<u64>(suffix)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use tempfile::Builder;

    use super::*;
    use crate::error::ControlError;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> =
            vars.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = ControlPlaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.retry.max_retries, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = ControlPlaneConfig::from_toml_str(
            r#"
[circuit_breaker]
failure_threshold = 3
timeout = 15000

[queue]
max_queue_size = 50
"#,
        )
        .expect("valid toml");

        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout, Duration::from_secs(15));
        assert_eq!(config.circuit_breaker.success_threshold, 2);
        assert_eq!(config.queue.max_queue_size, 50);
        assert_eq!(config.transaction, TransactionConfig::default());
    }

    #[test]
    fn test_transaction_retry_budget_lives_in_retry_table() {
        let config = ControlPlaneConfig::from_toml_str("[transaction.retry]\nmax_retries = 1\n")
            .expect("valid toml");
        assert_eq!(config.transaction.retry.max_retries, 1);

        let mut config = ControlPlaneConfig::default();
        config.apply_overrides(lookup(&[("ACCORA_TX_MAX_RETRIES", "6")])).expect("valid overrides");
        assert_eq!(config.transaction.retry.max_retries, 6);

        let stale = ControlPlaneConfig::from_toml_str("[transaction]\nmax_retries = 2\n");
        assert!(stale.is_err(), "top-level transaction max_retries has no effect");
    }

    #[test]
    fn test_invalid_toml_value_rejected() {
        let result = ControlPlaneConfig::from_toml_str("[circuit_breaker]\nfailure_threshold = 0\n");
        assert!(matches!(result, Err(ControlError::Config(_))));
    }

    #[test]
    fn test_overrides_apply() {
        let mut config = ControlPlaneConfig::default();
        config
            .apply_overrides(lookup(&[
                ("ACCORA_BREAKER_TIMEOUT_MS", "2500"),
                ("ACCORA_RETRY_MAX_RETRIES", " 5 "),
                ("ACCORA_QUEUE_DEFAULT_MAX_RETRIES", "1"),
            ]))
            .expect("valid overrides");

        assert_eq!(config.circuit_breaker.timeout, Duration::from_millis(2500));
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.queue.default_max_retries, 1);
        assert_eq!(config.transaction.retry.max_retries, 3);
    }

    #[test]
    fn test_unparseable_override_names_the_variable() {
        let mut config = ControlPlaneConfig::default();
        let err = config
            .apply_overrides(lookup(&[("ACCORA_TX_TIMEOUT_MS", "soon")]))
            .expect_err("not a number");

        assert!(matches!(
            err,
            ConfigError::InvalidField { ref field, .. } if field == "ACCORA_TX_TIMEOUT_MS"
        ));
    }

    #[test]
    fn test_load_json_file() {
        let mut file = Builder::new().suffix(".json").tempfile().expect("temp file");
        file.write_all(br#"{"retry": {"max_retries": 1, "initial_delay": 250}}"#)
            .expect("write");

        let config = ControlPlaneConfig::load(file.path()).expect("valid json");
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.initial_delay, Duration::from_millis(250));
    }

    #[test]
    fn test_load_rejects_unknown_extension() {
        let file = Builder::new().suffix(".yaml").tempfile().expect("temp file");
        let result = ControlPlaneConfig::load(file.path());
        assert!(matches!(result, Err(ControlError::Config(ConfigError::Invalid { .. }))));
    }

    #[test]
    fn test_load_missing_file() {
        let result = ControlPlaneConfig::load(Path::new("/nonexistent/accora.toml"));
        assert!(matches!(result, Err(ControlError::Config(_))));
    }
}
