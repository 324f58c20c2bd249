use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::types::{AnomalySubscription, SubscriberId};

/// Durations are written as (fractional) seconds in config files.
pub(crate) mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!("invalid duration: {secs}s")));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    #[serde(with = "secs")]
    pub price_interval: Duration,
    #[serde(with = "secs")]
    pub anomaly_interval: Duration,
    /// A failed iteration sleeps `interval * failure_backoff_factor`.
    pub failure_backoff_factor: u32,
    pub ohlcv_window: usize,
    #[serde(with = "secs")]
    pub upstream_timeout: Duration,
    /// Bound on one push write; a stalled subscriber is dropped after it.
    #[serde(with = "secs")]
    pub push_send_timeout: Duration,
    #[serde(with = "secs")]
    pub messaging_timeout: Duration,
    pub alert_history: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            price_interval: Duration::from_secs(2),
            anomaly_interval: Duration::from_secs(10),
            failure_backoff_factor: 5,
            ohlcv_window: crate::detection::MIN_SAMPLES,
            upstream_timeout: Duration::from_secs(10),
            push_send_timeout: Duration::from_secs(5),
            messaging_timeout: Duration::from_secs(10),
            alert_history: 200,
        }
    }
}

impl ServiceConfig {
    pub fn with_price_interval(mut self, interval: Duration) -> Self {
        self.price_interval = interval;
        self
    }

    pub fn with_anomaly_interval(mut self, interval: Duration) -> Self {
        self.anomaly_interval = interval;
        self
    }

    pub fn with_upstream_timeout(mut self, timeout: Duration) -> Self {
        self.upstream_timeout = timeout;
        self
    }

    pub fn with_push_send_timeout(mut self, timeout: Duration) -> Self {
        self.push_send_timeout = timeout;
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    #[serde(with = "secs")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(60) }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "secs")]
    pub price_ttl: Duration,
    #[serde(with = "secs")]
    pub market_ttl: Duration,
    #[serde(with = "secs")]
    pub analytics_ttl: Duration,
    #[serde(with = "secs")]
    pub profile_ttl: Duration,
    #[serde(with = "secs")]
    pub config_ttl: Duration,
    #[serde(with = "secs")]
    pub sweep_interval: Duration,
    pub max_key_len: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            price_ttl: Duration::from_secs(30),
            market_ttl: Duration::from_secs(60),
            analytics_ttl: Duration::from_secs(300),
            profile_ttl: Duration::from_secs(600),
            config_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(300),
            max_key_len: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub breaker: BreakerConfig,
    pub retry: crate::resilience::RetryPolicy,
    pub cache: CacheConfig,
    pub subscriptions: Vec<AnomalySubscription>,
    pub messaging_targets: HashMap<SubscriberId, String>,
}

impl AppConfig {
    /// Load from a JSON file, or fall back to defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut config: AppConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("failed to parse {}: {e}", path.display())))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    fn normalize(&mut self) {
        for sub in &mut self.subscriptions {
            sub.symbol = crate::types::normalize_symbol(&sub.symbol);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.price_interval.is_zero() || self.service.anomaly_interval.is_zero() {
            return Err(Error::Config("polling intervals must be non-zero".into()));
        }
        if self.service.push_send_timeout.is_zero() || self.service.messaging_timeout.is_zero() {
            return Err(Error::Config("delivery timeouts must be non-zero".into()));
        }
        if self.service.ohlcv_window < crate::detection::MIN_SAMPLES {
            return Err(Error::Config(format!(
                "ohlcv_window must be at least {}",
                crate::detection::MIN_SAMPLES
            )));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config("breaker failure_threshold must be at least 1".into()));
        }
        if self.retry.factor < 1.0 {
            return Err(Error::Config("retry factor must be >= 1.0".into()));
        }
        if let Some(sub) = self.subscriptions.iter().find(|s| s.threshold <= 0.0) {
            return Err(Error::Config(format!(
                "subscription {}/{} has non-positive threshold",
                sub.subscriber_id, sub.symbol
            )));
        }
        Ok(())
    }
}
