use std::time::Duration;
use thiserror::Error;

/// Errors raised while building or running a throttle stage.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ThrottleError {
    /// Invalid construction parameters, or a cost function that produced a
    /// zero cost for an item.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Enforcing mode saw an item that could not be admitted immediately.
    #[error("Maximum throttle throughput exceeded: item cost {cost} would need to wait {wait:?}")]
    RateExceeded {
        /// Cost of the rejected item.
        cost: u64,
        /// Wait the bucket demanded for it.
        wait: Duration,
    },

    /// The upstream producer failed.
    #[error("Upstream failure: {0}")]
    UpstreamFailure(String),
}

pub type ThrottleResult<T> = Result<T, ThrottleError>;

impl ThrottleError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        ThrottleError::Configuration(msg.into())
    }

    /// True for errors that were raised by the stage itself rather than
    /// relayed from an adjacent stage.
    pub fn is_local(&self) -> bool {
        !matches!(self, ThrottleError::UpstreamFailure(_))
    }
}

impl From<validator::ValidationErrors> for ThrottleError {
    fn from(err: validator::ValidationErrors) -> Self {
        ThrottleError::Configuration(err.to_string())
    }
}

impl From<serde_json::Error> for ThrottleError {
    fn from(err: serde_json::Error) -> Self {
        ThrottleError::Configuration(format!("invalid throttle configuration document: {}", err))
    }
}
