use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

/// Wiring and configuration failures.
///
/// These are programmer errors and surface immediately at registration time,
/// unlike data-path failures which are logged and absorbed by the holder.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("duplicate coupling: {target_type} already accepts {source_type}")]
    DuplicateCoupling {
        source_type: &'static str,
        target_type: &'static str,
    },

    #[error("coupling for {found} registered under key {expected}")]
    CouplingKindMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid config value for {key}: {value:?}")]
    InvalidConfig { key: &'static str, value: String },
}

impl BrokerError {
    #[must_use]
    pub fn invalid_config(key: &'static str, value: impl Into<String>) -> Self {
        Self::InvalidConfig {
            key,
            value: value.into(),
        }
    }
}
