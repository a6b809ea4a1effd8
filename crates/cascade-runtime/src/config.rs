#![forbid(unsafe_code)]

//! Broker configuration.

use crate::error::{BrokerError, Result};

/// Environment variable overriding [`BrokerConfig::max_cascade_depth`].
pub const ENV_MAX_DEPTH: &str = "CASCADE_MAX_DEPTH";
/// Environment variable overriding [`BrokerConfig::queue_pool_size`].
pub const ENV_QUEUE_POOL: &str = "CASCADE_QUEUE_POOL";
/// Environment variable overriding [`BrokerConfig::rollback_on_failure`].
pub const ENV_ROLLBACK: &str = "CASCADE_ROLLBACK";
/// Environment variable overriding [`BrokerConfig::catch_panics`].
pub const ENV_CATCH_PANICS: &str = "CASCADE_CATCH_PANICS";

/// Configuration for a [`Broker`](crate::Broker).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct BrokerConfig {
    /// Maximum nesting of cascades below a top-level update.
    /// A branch deeper than this is logged and dropped.
    /// Default: 64.
    pub max_cascade_depth: usize,

    /// Change queues allocated up front in the reentrancy pool.
    /// Default: 1.
    pub queue_pool_size: usize,

    /// Restore a target's previous value when its update fails.
    /// Default: true.
    pub rollback_on_failure: bool,

    /// Treat a panicking update method as a failed update instead of
    /// unwinding through the broker.
    /// Default: true.
    pub catch_panics: bool,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_cascade_depth: 64,
            queue_pool_size: 1,
            rollback_on_failure: true,
            catch_panics: true,
        }
    }
}

impl BrokerConfig {
    /// Set the cascade depth limit.
    #[must_use]
    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    /// Set the number of pre-allocated change queues.
    #[must_use]
    pub fn with_queue_pool_size(mut self, size: usize) -> Self {
        self.queue_pool_size = size;
        self
    }

    /// Toggle rollback of failed updates.
    #[must_use]
    pub fn with_rollback_on_failure(mut self, enabled: bool) -> Self {
        self.rollback_on_failure = enabled;
        self
    }

    /// Toggle panic isolation for update methods.
    #[must_use]
    pub fn with_catch_panics(mut self, enabled: bool) -> Self {
        self.catch_panics = enabled;
        self
    }

    /// Defaults overridden by `CASCADE_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overridden by values from `lookup`.
    ///
    /// Unset keys keep their defaults; malformed values are rejected.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(raw) = lookup(ENV_MAX_DEPTH) {
            config.max_cascade_depth = parse_usize(ENV_MAX_DEPTH, &raw)?;
        }
        if let Some(raw) = lookup(ENV_QUEUE_POOL) {
            config.queue_pool_size = parse_usize(ENV_QUEUE_POOL, &raw)?;
        }
        if let Some(raw) = lookup(ENV_ROLLBACK) {
            config.rollback_on_failure = parse_bool(ENV_ROLLBACK, &raw)?;
        }
        if let Some(raw) = lookup(ENV_CATCH_PANICS) {
            config.catch_panics = parse_bool(ENV_CATCH_PANICS, &raw)?;
        }
        Ok(config)
    }
}

fn parse_usize(key: &'static str, raw: &str) -> Result<usize> {
    raw.trim()
        .parse()
        .map_err(|_| BrokerError::invalid_config(key, raw))
}

fn parse_bool(key: &'static str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BrokerError::invalid_config(key, raw)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_cascade_depth, 64);
        assert_eq!(config.queue_pool_size, 1);
        assert!(config.rollback_on_failure);
        assert!(config.catch_panics);
    }

    #[test]
    fn builders_override_fields() {
        let config = BrokerConfig::default()
            .with_max_cascade_depth(3)
            .with_queue_pool_size(4)
            .with_rollback_on_failure(false)
            .with_catch_panics(false);
        assert_eq!(config.max_cascade_depth, 3);
        assert_eq!(config.queue_pool_size, 4);
        assert!(!config.rollback_on_failure);
        assert!(!config.catch_panics);
    }

    #[test]
    fn lookup_with_no_keys_is_default() {
        let config = BrokerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn lookup_overrides_each_key() {
        let config = BrokerConfig::from_lookup(lookup_from(&[
            (ENV_MAX_DEPTH, " 8 "),
            (ENV_QUEUE_POOL, "2"),
            (ENV_ROLLBACK, "off"),
            (ENV_CATCH_PANICS, "FALSE"),
        ]))
        .unwrap();
        assert_eq!(config.max_cascade_depth, 8);
        assert_eq!(config.queue_pool_size, 2);
        assert!(!config.rollback_on_failure);
        assert!(!config.catch_panics);
    }

    #[test]
    fn lookup_rejects_malformed_values() {
        let err = BrokerConfig::from_lookup(lookup_from(&[(ENV_MAX_DEPTH, "deep")])).unwrap_err();
        assert_eq!(err, BrokerError::invalid_config(ENV_MAX_DEPTH, "deep"));

        let err = BrokerConfig::from_lookup(lookup_from(&[(ENV_ROLLBACK, "maybe")])).unwrap_err();
        assert!(err.to_string().contains(ENV_ROLLBACK));
    }

    #[cfg(feature = "serde")]
    #[test]
    fn serde_fills_missing_fields_with_defaults() {
        let config: BrokerConfig = serde_json::from_str(r#"{"max_cascade_depth": 5}"#).unwrap();
        assert_eq!(config.max_cascade_depth, 5);
        assert_eq!(config.queue_pool_size, 1);
    }
}
