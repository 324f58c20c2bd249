use std::time::Duration;

use thiserror::Error;

use crate::types::SubscriberId;

/// All errors generated in `volume-watch`.
///
/// `Clone` so that every single-flight waiter observes the exact failure the
/// leading fetch produced.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),

    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("transport write failed for subscriber {subscriber_id}: {reason}")]
    Transport {
        subscriber_id: SubscriberId,
        reason: String,
    },

    #[error("messaging dispatch failed: {0}")]
    Dispatch(String),

    #[error("subscription store error: {0}")]
    Store(String),

    #[error("in-flight fetch for {0} was abandoned")]
    FlightAbandoned(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("json: {0}")]
    Json(String),
}

impl Error {
    /// Transient upstream failures are worth another attempt. An open breaker
    /// is not: retrying it would only burn the backoff budget.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Upstream(_) | Error::Timeout(_) | Error::FlightAbandoned(_)
        )
    }
}

/// Client construction failures. Request errors are mapped where the
/// configured timeout is known.
impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Upstream(err.without_url().to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Json(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retryable() {
        struct TestCase {
            input: Error,
            expected: bool,
        }

        let tests = vec![
            TestCase {
                // TC0: rate limit from the exchange
                input: Error::Upstream("429 Too Many Requests".into()),
                expected: true,
            },
            TestCase {
                // TC1: per-call timeout
                input: Error::Timeout(Duration::from_secs(10)),
                expected: true,
            },
            TestCase {
                // TC2: breaker open fails fast
                input: Error::ServiceUnavailable("breaker open".into()),
                expected: false,
            },
            TestCase {
                // TC3: subscriber transport failures are never retried upstream
                input: Error::Transport { subscriber_id: 7, reason: "closed".into() },
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.input.is_retryable(), test.expected, "TC{} failed", index);
        }
    }
}
