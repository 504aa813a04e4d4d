// =============================================================================
// Error taxonomy — typed results at every subsystem boundary
// =============================================================================
//
// Retries live at the adapter's HTTP boundary, not in callers. The scheduler
// converts anything unexpected into a log-and-continue at the outer loop;
// inner transactional boundaries roll back before an error leaves them.
//
// Lock contention is deliberately NOT an error: the lock primitive returns
// `Ok(None)` when another holder owns the key and callers skip silently.
// =============================================================================

use thiserror::Error;

/// Errors surfaced by the exchange adapter.
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Authentication failure. Never retried; surfaced immediately.
    #[error("exchange authentication failed: {0}")]
    Auth(String),

    /// The exchange asked us to slow down. `retry_after_secs` comes from the
    /// Retry-After header when present.
    #[error("rate limited by exchange (retry_after={retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// Margin too low for the requested order.
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The request was malformed or violates an exchange rule. Never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Transient network / timeout failure. Retried with backoff up to three
    /// attempts before this variant escapes the adapter.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The referenced order or entity no longer exists. Cancel paths treat
    /// this as "already gone".
    #[error("not found: {0}")]
    NotFound(String),

    /// Our clock drifted outside the exchange's recv window. The adapter
    /// resynchronises and retries once before surfacing this.
    #[error("clock skew rejected by exchange: {0}")]
    ClockSkew(String),

    /// A stop or take-profit price failed direction/proximity validation
    /// after the one permitted adjustment retry.
    #[error("price validation failed: {0}")]
    PriceValidation(String),

    /// The exchange returned a payload we could not interpret.
    #[error("malformed exchange response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Whether the HTTP core may transparently retry this failure.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited { .. } | Self::ClockSkew(_)
        )
    }
}

/// Errors surfaced by the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Store and exchange disagree (orphan order, phantom position). Surfaced
    /// as a warning and handled by the reconciliation routine.
    #[error("consistency violation: {0}")]
    Consistency(String),
}

/// Configuration problems. Always fatal at startup (exit code 1).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key '{0}'")]
    Missing(String),

    #[error("invalid value '{value}' for configuration key '{key}': {reason}")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },
}

/// Umbrella error for the engine's outer loops.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
pub type StoreResult<T> = Result<T, StoreError>;

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(ExchangeError::Transport("timeout".into()).is_retryable());
        assert!(ExchangeError::RateLimited { retry_after_secs: Some(3) }.is_retryable());
        assert!(ExchangeError::ClockSkew("recvWindow".into()).is_retryable());
        assert!(!ExchangeError::Auth("bad key".into()).is_retryable());
        assert!(!ExchangeError::InsufficientFunds("margin".into()).is_retryable());
        assert!(!ExchangeError::InvalidArgument("qty".into()).is_retryable());
        assert!(!ExchangeError::NotFound("order 42".into()).is_retryable());
    }

    #[test]
    fn engine_error_wraps_subsystems() {
        let e: EngineError = ExchangeError::Auth("denied".into()).into();
        assert!(matches!(e, EngineError::Exchange(_)));

        let e: EngineError = StoreError::Consistency("phantom".into()).into();
        assert!(matches!(e, EngineError::Store(_)));
    }
}
