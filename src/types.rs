use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque subscriber identity issued by the (external) account layer.
pub type SubscriberId = u64;

// ── Market data (consumed from the data provider) ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ticker {
    pub symbol: String,
    pub last: f64,
    pub high: f64,
    pub low: f64,
    pub percentage_change: f64,
    pub base_volume: f64,
    /// Exchange timestamp, unix millis.
    pub timestamp: i64,
}

/// One OHLCV candle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn flat(timestamp: i64, price: f64, volume: f64) -> Self {
        Self { timestamp, open: price, high: price, low: price, close: price, volume }
    }
}

// ── Subscription store rows ──

fn default_threshold() -> f64 {
    2.0
}

fn default_timeframe() -> String {
    "5m".to_string()
}

fn default_notification_interval() -> u64 {
    120
}

/// A subscriber's anomaly-detection settings for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalySubscription {
    pub subscriber_id: SubscriberId,
    pub symbol: String,
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_timeframe")]
    pub analysis_timeframe: String,
    #[serde(default = "default_notification_interval")]
    pub notification_interval_secs: u64,
}

impl AnomalySubscription {
    pub fn new(subscriber_id: SubscriberId, symbol: impl Into<String>, threshold: f64) -> Self {
        Self {
            subscriber_id,
            symbol: normalize_symbol(&symbol.into()),
            threshold,
            analysis_timeframe: default_timeframe(),
            notification_interval_secs: default_notification_interval(),
        }
    }

    pub fn with_timeframe(mut self, timeframe: impl Into<String>) -> Self {
        self.analysis_timeframe = timeframe.into();
        self
    }

    pub fn with_notification_interval(mut self, secs: u64) -> Self {
        self.notification_interval_secs = secs;
        self
    }

    pub fn notification_interval(&self) -> Duration {
        Duration::from_secs(self.notification_interval_secs)
    }
}

/// Symbols are compared upper-cased with surrounding whitespace removed.
pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_uppercase()
}

// ── Outbound push envelopes ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertAnalysis {
    pub current_volume: f64,
    pub avg_volume: f64,
    pub multiplier: f64,
    pub price: f64,
    pub std_dev: f64,
    pub analysis_timeframe: String,
    pub notification_interval: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connection {
        status: String,
        message: String,
        timestamp: DateTime<Utc>,
    },
    PriceUpdate {
        symbol: String,
        data: Ticker,
        timestamp: DateTime<Utc>,
    },
    VolumeAlert {
        symbol: String,
        threshold: f64,
        message: String,
        timestamp: DateTime<Utc>,
        analysis: AlertAnalysis,
    },
    Subscribed {
        symbol: String,
        message: String,
    },
    Unsubscribed {
        symbol: String,
        message: String,
    },
    Pong {
        message: String,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn connected() -> Self {
        ServerMessage::Connection {
            status: "connected".to_string(),
            message: "Connected to volume-watch feed".to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn price_update(ticker: Ticker) -> Self {
        ServerMessage::PriceUpdate {
            symbol: ticker.symbol.clone(),
            data: ticker,
            timestamp: Utc::now(),
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

// ── Inbound client messages ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { symbol: String },
    Unsubscribe { symbol: String },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_de() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"subscribe","symbol":"btc"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Subscribe { symbol: "btc".into() });

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg, ClientMessage::Ping);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"trade"}"#).is_err());
    }

    #[test]
    fn test_volume_alert_envelope_shape() {
        let msg = ServerMessage::VolumeAlert {
            symbol: "BTC".into(),
            threshold: 2.0,
            message: "spike".into(),
            timestamp: Utc::now(),
            analysis: AlertAnalysis {
                current_volume: 500.0,
                avg_volume: 100.0,
                multiplier: 5.0,
                price: 42_000.0,
                std_dev: 0.0,
                analysis_timeframe: "5m".into(),
                notification_interval: 120,
            },
        };

        let value: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "volume_alert");
        assert_eq!(value["analysis"]["currentVolume"], 500.0);
        assert_eq!(value["analysis"]["stdDev"], 0.0);
        assert_eq!(value["analysis"]["notificationInterval"], 120);
    }

    #[test]
    fn test_subscription_defaults() {
        let sub: AnomalySubscription =
            serde_json::from_str(r#"{"subscriber_id":1,"symbol":"ETH"}"#).unwrap();
        assert_eq!(sub.threshold, 2.0);
        assert_eq!(sub.analysis_timeframe, "5m");
        assert_eq!(sub.notification_interval(), Duration::from_secs(120));
    }
}
