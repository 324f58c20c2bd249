use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ServiceConfig;
use crate::detection::AnomalyVerdict;
use crate::error::{Error, Result};

/// Out-of-band messaging channel (chat bot).
#[async_trait]
pub trait MessagingChannel: Send + Sync {
    /// `Ok(false)` when the channel accepted the request but declined it.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<bool>;
}

pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

pub struct TelegramBot {
    client: reqwest::Client,
    api_url: String,
    token: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramBot {
    pub fn new(token: impl Into<String>, timeout: Duration) -> Result<Self> {
        Self::with_api_url(TELEGRAM_API_URL, token, timeout)
    }

    /// Bot bounded by the configured messaging timeout.
    pub fn from_config(token: impl Into<String>, config: &ServiceConfig) -> Result<Self> {
        Self::new(token, config.messaging_timeout)
    }

    pub fn with_api_url(api_url: impl Into<String>, token: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, api_url: api_url.into(), token: token.into(), timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[async_trait]
impl MessagingChannel for TelegramBot {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<bool> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.token);
        let body = SendMessage { chat_id, text, parse_mode: "HTML", disable_web_page_preview: true };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Dispatch(format!("telegram request timed out after {:?}", self.timeout))
                } else {
                    Error::Dispatch(e.without_url().to_string())
                }
            })?;
        let status = response.status();
        let reply: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Dispatch(format!("{status}: {}", e.without_url())))?;

        if reply.ok {
            debug!(%chat_id, "telegram message sent");
        } else {
            warn!(%chat_id, %status, description = ?reply.description, "telegram rejected message");
        }
        Ok(reply.ok)
    }
}

/// `1_234_567.0` -> `1.23M`.
pub fn format_volume(volume: f64) -> String {
    if volume >= 1e9 {
        format!("{:.2}B", volume / 1e9)
    } else if volume >= 1e6 {
        format!("{:.2}M", volume / 1e6)
    } else if volume >= 1e3 {
        format!("{:.2}K", volume / 1e3)
    } else {
        format!("{volume:.0}")
    }
}

/// HTML body of a volume alert for the messaging channel.
pub fn format_volume_alert(symbol: &str, verdict: &AnomalyVerdict, timeframe: &str, at: DateTime<Utc>) -> String {
    format!(
        "📈 <b>Volume alert - {symbol}</b>\n\n\
         🪙 <b>Symbol:</b> {symbol}\n\
         💰 <b>Price:</b> ${price:.6}\n\
         📊 <b>Current volume:</b> {current}\n\
         📊 <b>Average volume:</b> {avg}\n\
         🔥 <b>Multiplier:</b> {multiplier:.2}x\n\
         ⏱️ <b>Timeframe:</b> {timeframe}\n\
         ⏰ <b>Time:</b> {time}\n\n\
         ⚠️ Unusual volume detected, keep an eye on the market.",
        price = verdict.price,
        current = format_volume(verdict.current_volume),
        avg = format_volume(verdict.avg_volume),
        multiplier = verdict.multiplier,
        time = at.format("%Y-%m-%d %H:%M:%S UTC"),
    )
}

/// Short push-channel message.
pub fn alert_headline(symbol: &str, verdict: &AnomalyVerdict) -> String {
    format!(
        "{symbol} volume spike: {} vs avg {} ({:.2}x)",
        format_volume(verdict.current_volume),
        format_volume(verdict.avg_volume),
        verdict.multiplier
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_volume() {
        assert_eq!(format_volume(999.4), "999");
        assert_eq!(format_volume(1_500.0), "1.50K");
        assert_eq!(format_volume(2_345_678.0), "2.35M");
        assert_eq!(format_volume(7_000_000_000.0), "7.00B");
    }

    #[test]
    fn test_alert_body_mentions_figures() {
        let verdict = AnomalyVerdict {
            current_volume: 500_000.0,
            avg_volume: 100_000.0,
            std_dev: 0.0,
            multiplier: 5.0,
            is_anomaly: true,
            price: 1.5,
            timestamp: 0,
        };
        let body = format_volume_alert("SOL/USDT", &verdict, "5m", Utc::now());
        assert!(body.contains("<b>Volume alert - SOL/USDT</b>"));
        assert!(body.contains("500.00K"));
        assert!(body.contains("5.00x"));
        assert!(body.contains("$1.500000"));
    }

    #[test]
    fn test_bot_uses_configured_messaging_timeout() {
        let config = ServiceConfig { messaging_timeout: Duration::from_secs(3), ..Default::default() };
        let bot = TelegramBot::from_config("token", &config).unwrap();
        assert_eq!(bot.timeout(), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_unresponsive_bot_api_fails_within_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let bot = TelegramBot::with_api_url(format!("http://{addr}"), "token", Duration::from_millis(200)).unwrap();
        let started = std::time::Instant::now();
        let result = bot.send_message("42", "hello").await;
        assert!(matches!(&result, Err(Error::Dispatch(reason)) if reason.contains("timed out")), "{result:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }
}
