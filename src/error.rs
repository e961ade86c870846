//! Error taxonomy for the protection engine.

use thiserror::Error;

/// Errors surfaced by the engine's components.
///
/// `Config` is fatal for the offending rule or option and fatal for the
/// process at startup; `TransientEnforcement` is retried with backoff and
/// escalated once the attempt budget is spent; `StateCorruption` is detected
/// defensively, resolved locally, and logged as an anomaly.
#[derive(Debug, Error)]
pub enum WatchdogError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("enforcement call failed: {0}")]
    TransientEnforcement(String),

    #[error("state corruption: {0}")]
    StateCorruption(String),

    #[error("state store error: {0}")]
    Store(String),
}

impl From<redis::RedisError> for WatchdogError {
    fn from(err: redis::RedisError) -> Self {
        WatchdogError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for WatchdogError {
    fn from(err: serde_json::Error) -> Self {
        WatchdogError::Store(format!("record serialization: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, WatchdogError>;
