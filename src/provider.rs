use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::IgnoredAny;
use serde::Deserialize;
use tracing::debug;

use crate::cache::{CacheDomain, CacheKey, CacheManager};
use crate::error::{Error, Result};
use crate::resilience::{retry_with_backoff, with_timeout, BreakerState, CircuitBreaker, RetryPolicy};
use crate::types::{Candle, Ticker};

/// Upstream market-data source.
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker>;

    /// The most recent `limit` candles for `timeframe`, oldest first.
    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>>;
}

/// Candle width of a timeframe such as `1m`, `5m`, `1h` or `1d`.
pub fn timeframe_millis(timeframe: &str) -> Option<i64> {
    let (idx, _) = timeframe.char_indices().last()?;
    let (digits, unit) = timeframe.split_at(idx);
    let n: i64 = digits.parse().ok().filter(|n| *n > 0)?;
    let unit_ms = match unit {
        "m" => 60_000,
        "h" => 3_600_000,
        "d" => 86_400_000,
        "w" => 604_800_000,
        _ => return None,
    };
    Some(n * unit_ms)
}

/// `BTC/USDT` -> `BTCUSDT`.
pub fn exchange_symbol(symbol: &str) -> String {
    symbol.chars().filter(|c| c.is_ascii_alphanumeric()).collect::<String>().to_uppercase()
}

pub const BINANCE_BASE_URL: &str = "https://api.binance.com";

pub struct BinanceProvider {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker24h {
    last_price: String,
    high_price: String,
    low_price: String,
    price_change_percent: String,
    volume: String,
    close_time: i64,
}

/// `[openTime, open, high, low, close, volume, closeTime, ...]`
#[derive(Deserialize)]
struct Kline(
    i64,
    String,
    String,
    String,
    String,
    String,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
    IgnoredAny,
);

fn num(field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| Error::Upstream(format!("malformed {field}: {raw:?}")))
}

impl BinanceProvider {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url: base_url.into(), timeout })
    }

    fn request_error(&self, err: reqwest::Error) -> Error {
        if err.is_timeout() {
            Error::Timeout(self.timeout)
        } else {
            Error::Upstream(err.without_url().to_string())
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Upstream(format!("{path} returned {status}: {body}")));
        }
        response.json::<T>().await.map_err(|e| self.request_error(e))
    }
}

#[async_trait]
impl DataProvider for BinanceProvider {
    fn name(&self) -> &str {
        "binance"
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        let raw: Ticker24h = self
            .get("/api/v3/ticker/24hr", &[("symbol", exchange_symbol(symbol))])
            .await?;
        Ok(Ticker {
            symbol: symbol.to_string(),
            last: num("lastPrice", &raw.last_price)?,
            high: num("highPrice", &raw.high_price)?,
            low: num("lowPrice", &raw.low_price)?,
            percentage_change: num("priceChangePercent", &raw.price_change_percent)?,
            base_volume: num("volume", &raw.volume)?,
            timestamp: raw.close_time,
        })
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>> {
        let rows: Vec<Kline> = self
            .get(
                "/api/v3/klines",
                &[
                    ("symbol", exchange_symbol(symbol)),
                    ("interval", timeframe.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;
        rows.into_iter()
            .map(|k| {
                Ok(Candle {
                    timestamp: k.0,
                    open: num("open", &k.1)?,
                    high: num("high", &k.2)?,
                    low: num("low", &k.3)?,
                    close: num("close", &k.4)?,
                    volume: num("volume", &k.5)?,
                })
            })
            .collect()
    }
}

/// Provider access for the polling loops: cached, single-flight, bounded by
/// a per-call timeout, guarded by a circuit breaker and retried with backoff.
pub struct MarketData {
    provider: Arc<dyn DataProvider>,
    breaker: CircuitBreaker,
    retry: RetryPolicy,
    timeout: Duration,
    cache: Arc<CacheManager>,
}

impl MarketData {
    pub fn new(
        provider: Arc<dyn DataProvider>,
        breaker: CircuitBreaker,
        retry: RetryPolicy,
        timeout: Duration,
        cache: Arc<CacheManager>,
    ) -> Self {
        Self { provider, breaker, retry, timeout, cache }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    async fn guarded<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let f = &f;
        let breaker = &self.breaker;
        let timeout = self.timeout;
        retry_with_backoff(&self.retry, move || breaker.call(move || with_timeout(timeout, f()))).await
    }

    pub async fn ticker(&self, symbol: &str, ttl: Option<Duration>) -> Result<Ticker> {
        let key = CacheKey::new("ticker").arg(symbol).build();
        self.cache
            .get_or_fetch(CacheDomain::Price, &key, ttl, move || async move {
                debug!(provider = self.provider.name(), %symbol, "fetching ticker");
                self.guarded(|| self.provider.fetch_ticker(symbol)).await
            })
            .await
    }

    pub async fn ohlcv(&self, symbol: &str, timeframe: &str, limit: usize, ttl: Option<Duration>) -> Result<Vec<Candle>> {
        let key = CacheKey::new("ohlcv")
            .arg(symbol)
            .named("tf", timeframe)
            .named("limit", limit)
            .build();
        self.cache
            .get_or_fetch(CacheDomain::Market, &key, ttl, move || async move {
                debug!(provider = self.provider.name(), %symbol, %timeframe, limit, "fetching candles");
                self.guarded(|| self.provider.fetch_ohlcv(symbol, timeframe, limit)).await
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_millis() {
        assert_eq!(timeframe_millis("5m"), Some(300_000));
        assert_eq!(timeframe_millis("1h"), Some(3_600_000));
        assert_eq!(timeframe_millis("0m"), None);
        assert_eq!(timeframe_millis("m"), None);
        assert_eq!(timeframe_millis(""), None);
    }

    #[test]
    fn test_kline_row_parses() {
        let raw = r#"[[1499040000000,"0.01634790","0.80000000","0.01575800","0.01577100","148976.11427815",1499644799999,"2434.19055334",308,"1756.87402397","28.46694368","0"]]"#;
        let rows: Vec<Kline> = serde_json::from_str(raw).unwrap();
        assert_eq!(rows[0].0, 1499040000000);
        assert_eq!(num("volume", &rows[0].5).unwrap(), 148976.11427815);
        assert_eq!(exchange_symbol("btc/usdt"), "BTCUSDT");
    }

    #[tokio::test]
    async fn test_unresponsive_exchange_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept and hold connections without ever answering.
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let timeout = Duration::from_millis(200);
        let provider = BinanceProvider::new(format!("http://{addr}"), timeout).unwrap();
        let result = provider.fetch_ticker("BTC/USDT").await;
        assert_eq!(result.map(|t| t.last), Err(Error::Timeout(timeout)));
        assert!(Error::Timeout(timeout).is_retryable());
        server.abort();
    }
}
