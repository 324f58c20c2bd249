//! End-to-end fan-out tests: registry, polling ticks and two-channel
//! dispatch, wired through `pipeline::setup` with scripted collaborators.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use volume_watch::alerts::Delivery;
use volume_watch::config::AppConfig;
use volume_watch::notifier::MessagingChannel;
use volume_watch::pipeline::{self, Pipeline};
use volume_watch::provider::DataProvider;
use volume_watch::registry::{ChannelTransport, ConnectionRegistry, Transport};
use volume_watch::resilience::RetryPolicy;
use volume_watch::store::{MemoryStore, SubscriptionStore};
use volume_watch::throttle::NotificationThrottle;
use volume_watch::types::{AnomalySubscription, Candle, ServerMessage, SubscriberId, Ticker};
use volume_watch::web::handle_client_message;
use volume_watch::{Error, Result};

// ── Scripted collaborators ──

#[derive(Default)]
struct ScriptedProvider {
    tickers: Mutex<HashMap<String, Ticker>>,
    candles: Mutex<HashMap<String, Vec<Candle>>>,
    ticker_calls: AtomicUsize,
    ohlcv_calls: AtomicUsize,
}

impl ScriptedProvider {
    fn with_ticker(self, symbol: &str, last: f64) -> Self {
        self.tickers.lock().insert(
            symbol.to_string(),
            Ticker {
                symbol: symbol.to_string(),
                last,
                high: last * 1.01,
                low: last * 0.99,
                percentage_change: 0.4,
                base_volume: 12_000.0,
                timestamp: 1_700_000_000_000,
            },
        );
        self
    }

    /// Flat 100-unit history ending in a 5x spike.
    fn with_spike(self, symbol: &str) -> Self {
        let candles = (0..20)
            .map(|i| Candle::flat(i * 300_000, 42_000.0, if i == 19 { 500.0 } else { 100.0 }))
            .collect();
        self.candles.lock().insert(symbol.to_string(), candles);
        self
    }
}

#[async_trait]
impl DataProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        self.ticker_calls.fetch_add(1, Ordering::SeqCst);
        self.tickers
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| Error::Upstream(format!("unknown symbol {symbol}")))
    }

    async fn fetch_ohlcv(&self, symbol: &str, _timeframe: &str, limit: usize) -> Result<Vec<Candle>> {
        self.ohlcv_calls.fetch_add(1, Ordering::SeqCst);
        let candles = self
            .candles
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| Error::Upstream(format!("unknown symbol {symbol}")))?;
        let skip = candles.len().saturating_sub(limit);
        Ok(candles.into_iter().skip(skip).collect())
    }
}

/// Accepts every chat except the ones listed in `failing`.
#[derive(Default)]
struct RecordingMessenger {
    failing: Vec<String>,
    sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl MessagingChannel for RecordingMessenger {
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<bool> {
        if self.failing.iter().any(|c| c == chat_id) {
            return Err(Error::Dispatch(format!("chat {chat_id} unreachable")));
        }
        self.sent.lock().push((chat_id.to_string(), text.to_string()));
        Ok(true)
    }
}

/// Accepts the connection acknowledgement, then never completes a write.
#[derive(Default)]
struct StalledTransport {
    writes: AtomicUsize,
}

#[async_trait]
impl Transport for StalledTransport {
    async fn send(&self, _payload: &str) -> Result<()> {
        if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
            return Ok(());
        }
        std::future::pending().await
    }
}

struct FailingStore;

#[async_trait]
impl SubscriptionStore for FailingStore {
    async fn anomaly_subscriptions(&self) -> Result<Vec<AnomalySubscription>> {
        Err(Error::Store("connection refused".to_string()))
    }

    async fn messaging_chat_id(&self, _subscriber_id: SubscriberId) -> Result<Option<String>> {
        Err(Error::Store("connection refused".to_string()))
    }
}

fn test_config() -> AppConfig {
    AppConfig {
        retry: RetryPolicy::new(0, Duration::from_millis(10), Duration::from_millis(10), 2.0),
        ..Default::default()
    }
}

fn build(
    provider: Arc<ScriptedProvider>,
    store: Arc<dyn SubscriptionStore>,
    messenger: Option<Arc<dyn MessagingChannel>>,
) -> Pipeline {
    pipeline::setup(test_config(), provider, store, messenger)
}

fn parse(raw: &str) -> ServerMessage {
    serde_json::from_str(raw).expect("server message")
}

// ── Test 1: Registry bookkeeping ──

#[tokio::test]
async fn test_disconnect_prunes_reverse_index() {
    let registry = ConnectionRegistry::new(Arc::new(NotificationThrottle::new()));
    let (t1, _rx1) = ChannelTransport::pair(1);
    let (t2, _rx2) = ChannelTransport::pair(2);
    registry.connect(1, t1).await.expect("connect 1");
    registry.connect(2, t2).await.expect("connect 2");

    assert!(registry.subscribe(1, "btc/usdt"));
    assert!(registry.subscribe(1, "ETH/USDT"));
    assert!(registry.subscribe(2, "BTC/USDT"));
    assert!(!registry.subscribe(3, "BTC/USDT"), "no session, no subscription");

    assert_eq!(registry.subscribers_of("BTC/USDT"), vec![1, 2]);
    assert_eq!(registry.active_symbols(), vec!["BTC/USDT".to_string(), "ETH/USDT".to_string()]);

    registry.disconnect(1);
    assert_eq!(registry.subscribers_of("BTC/USDT"), vec![2]);
    assert!(registry.subscribers_of("ETH/USDT").is_empty());
    assert_eq!(registry.active_symbols(), vec!["BTC/USDT".to_string()], "empty symbol sets are removed");

    assert!(registry.unsubscribe(2, "BTC/USDT"));
    assert!(registry.active_symbols().is_empty());

    let stats = registry.stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.total_subscriptions, 0);
    assert_eq!(stats.active_symbols, 0);
}

#[tokio::test]
async fn test_connect_sends_acknowledgement() {
    let registry = ConnectionRegistry::new(Arc::new(NotificationThrottle::new()));
    let (transport, mut rx) = ChannelTransport::pair(9);
    let session = registry.connect(9, transport).await.expect("connect");

    assert!(session.subscriptions.is_empty());
    let ack = parse(&rx.recv().await.expect("ack"));
    assert!(matches!(ack, ServerMessage::Connection { ref status, .. } if status == "connected"), "{ack:?}");
}

#[tokio::test]
async fn test_failed_handshake_leaves_no_session() {
    let registry = ConnectionRegistry::new(Arc::new(NotificationThrottle::new()));
    let (transport, rx) = ChannelTransport::pair(4);
    drop(rx);

    let result = registry.connect(4, transport).await;
    assert!(matches!(result, Err(Error::Transport { subscriber_id: 4, .. })), "{result:?}");
    assert!(!registry.is_connected(4));
    assert_eq!(registry.stats().total_connections, 0);
}

#[tokio::test]
async fn test_send_to_absent_subscriber_is_not_an_error() {
    let registry = ConnectionRegistry::new(Arc::new(NotificationThrottle::new()));
    assert_eq!(registry.send_to_one(77, "{}").await, Ok(false));
}

// ── Test 2: Client protocol ──

#[tokio::test]
async fn test_client_message_acknowledgements() {
    let registry = ConnectionRegistry::new(Arc::new(NotificationThrottle::new()));
    let (transport, _rx) = ChannelTransport::pair(5);
    registry.connect(5, transport).await.expect("connect");

    let reply = handle_client_message(&registry, 5, r#"{"type":"subscribe","symbol":" sol/usdt "}"#);
    assert_eq!(
        reply,
        ServerMessage::Subscribed { symbol: "SOL/USDT".into(), message: "Subscribed to SOL/USDT".into() }
    );
    assert_eq!(registry.subscribers_of("SOL/USDT"), vec![5]);

    let reply = handle_client_message(&registry, 5, r#"{"type":"unsubscribe","symbol":"SOL/USDT"}"#);
    assert_eq!(
        reply,
        ServerMessage::Unsubscribed { symbol: "SOL/USDT".into(), message: "Unsubscribed from SOL/USDT".into() }
    );
    assert!(registry.active_symbols().is_empty());

    let reply = handle_client_message(&registry, 5, r#"{"type":"ping"}"#);
    assert_eq!(reply, ServerMessage::Pong { message: "pong".into() });

    let reply = handle_client_message(&registry, 5, r#"{"type":"subscribe","symbol":"  "}"#);
    assert!(matches!(reply, ServerMessage::Error { .. }), "empty symbol rejected");

    let reply = handle_client_message(&registry, 5, "not json");
    assert!(matches!(reply, ServerMessage::Error { ref message } if message.starts_with("invalid message")));
}

// ── Test 3: Price fan-out with partial failure ──

#[tokio::test]
async fn test_price_tick_survives_a_dead_session() {
    let provider = Arc::new(ScriptedProvider::default().with_ticker("BTC/USDT", 65_000.0));
    let p = build(provider.clone(), Arc::new(MemoryStore::new()), None);

    let (t1, mut rx1) = ChannelTransport::pair(1);
    let (t2, rx2) = ChannelTransport::pair(2);
    p.registry.connect(1, t1).await.expect("connect 1");
    p.registry.connect(2, t2).await.expect("connect 2");
    p.registry.subscribe(1, "BTC/USDT");
    p.registry.subscribe(2, "btc/usdt");
    p.registry.subscribe(1, "DOGE/USDT");
    drop(rx2);

    let report = p.service.price_tick().await.expect("one symbol succeeded");
    assert_eq!(report.symbols, 1);
    assert_eq!(report.failed_symbols, 1, "DOGE has no ticker");
    assert_eq!(report.delivered, 1);
    assert_eq!(report.dropped_sessions, 1);

    assert!(matches!(parse(&rx1.recv().await.expect("ack")), ServerMessage::Connection { .. }));
    match parse(&rx1.recv().await.expect("price update")) {
        ServerMessage::PriceUpdate { symbol, data, .. } => {
            assert_eq!(symbol, "BTC/USDT");
            assert_eq!(data.last, 65_000.0);
        }
        other => panic!("expected price update, got {other:?}"),
    }

    assert!(!p.registry.is_connected(2), "failed session is removed");
    assert_eq!(p.registry.subscribers_of("BTC/USDT"), vec![1]);
    assert_eq!(provider.ticker_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_price_tick_fails_when_every_fetch_fails() {
    let provider = Arc::new(ScriptedProvider::default());
    let p = build(provider, Arc::new(MemoryStore::new()), None);
    let (transport, _rx) = ChannelTransport::pair(1);
    p.registry.connect(1, transport).await.expect("connect");
    p.registry.subscribe(1, "BTC/USDT");

    let result = p.service.price_tick().await;
    assert!(matches!(result, Err(Error::Upstream(_))), "{result:?}");
}

#[tokio::test]
async fn test_price_tick_without_subscribers_fetches_nothing() {
    let provider = Arc::new(ScriptedProvider::default().with_ticker("BTC/USDT", 1.0));
    let p = build(provider.clone(), Arc::new(MemoryStore::new()), None);

    let report = p.service.price_tick().await.expect("idle tick");
    assert_eq!(report.symbols, 0);
    assert_eq!(provider.ticker_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_session_does_not_block_fan_out() {
    let provider = Arc::new(
        ScriptedProvider::default()
            .with_ticker("BTC/USDT", 65_000.0)
            .with_ticker("ETH/USDT", 3_400.0),
    );
    let p = build(provider, Arc::new(MemoryStore::new()), None);

    let (healthy, mut rx) = ChannelTransport::pair(1);
    p.registry.connect(1, healthy).await.expect("connect 1");
    p.registry.connect(2, Arc::new(StalledTransport::default())).await.expect("connect 2");
    p.registry.subscribe(1, "ETH/USDT");
    p.registry.subscribe(2, "BTC/USDT");
    p.registry.subscribe(2, "ETH/USDT");

    let started = tokio::time::Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(3600), p.service.price_tick())
        .await
        .expect("price tick finishes despite a stalled subscriber")
        .expect("price tick");
    let send_timeout = p.config.service.push_send_timeout;
    assert!(started.elapsed() >= send_timeout && started.elapsed() < send_timeout * 2, "{:?}", started.elapsed());

    assert_eq!(report.symbols, 2);
    assert_eq!(report.dropped_sessions, 1);
    assert_eq!(report.delivered, 1);
    assert!(!p.registry.is_connected(2), "stalled session is dropped");
    assert_eq!(p.registry.subscribers_of("ETH/USDT"), vec![1]);

    assert!(matches!(parse(&rx.recv().await.expect("ack")), ServerMessage::Connection { .. }));
    match parse(&rx.recv().await.expect("price update")) {
        ServerMessage::PriceUpdate { symbol, .. } => assert_eq!(symbol, "ETH/USDT"),
        other => panic!("expected price update, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_session_fails_push_alert() {
    let provider = Arc::new(ScriptedProvider::default().with_spike("BTC/USDT"));
    let store = Arc::new(MemoryStore::new());
    store.upsert(AnomalySubscription::new(2, "BTC/USDT", 2.0));
    let p = build(provider, store, None);
    p.registry.connect(2, Arc::new(StalledTransport::default())).await.expect("connect");

    let report = tokio::time::timeout(Duration::from_secs(3600), p.service.anomaly_tick())
        .await
        .expect("anomaly tick finishes despite a stalled subscriber")
        .expect("anomaly tick");
    assert_eq!(report.dispatched, 1);

    let alerts = p.alerts.lock().recent(1);
    assert!(matches!(&alerts[0].push, Delivery::Failed(reason) if reason.contains("timed out")), "{:?}", alerts[0].push);
    assert!(!p.registry.is_connected(2));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_handshake_is_bounded() {
    struct NeverAcks;

    #[async_trait]
    impl Transport for NeverAcks {
        async fn send(&self, _payload: &str) -> Result<()> {
            std::future::pending().await
        }
    }

    let registry = ConnectionRegistry::new(Arc::new(NotificationThrottle::new()))
        .with_send_timeout(Duration::from_secs(2));
    let result = registry.connect(8, Arc::new(NeverAcks)).await;
    assert!(matches!(result, Err(Error::Transport { subscriber_id: 8, .. })), "{result:?}");
    assert!(!registry.is_connected(8));
}

// ── Test 4: Anomaly dispatch on both channels ──

#[tokio::test(start_paused = true)]
async fn test_anomaly_dispatch_isolates_channel_failures() {
    let provider = Arc::new(ScriptedProvider::default().with_spike("BTC/USDT"));
    let store = Arc::new(MemoryStore::new());
    store.upsert(AnomalySubscription::new(1, "btc/usdt", 2.0));
    store.upsert(AnomalySubscription::new(2, "BTC/USDT", 2.0));
    store.set_chat_id(1, "chat-1");
    store.set_chat_id(2, "chat-2");
    let messenger = Arc::new(RecordingMessenger { failing: vec!["chat-2".into()], ..Default::default() });

    let p = build(provider.clone(), store, Some(messenger.clone()));
    let (transport, mut rx) = ChannelTransport::pair(1);
    p.registry.connect(1, transport).await.expect("connect");
    rx.recv().await.expect("ack");

    let report = p.service.anomaly_tick().await.expect("anomaly tick");
    assert_eq!(report.evaluated, 2);
    assert_eq!(report.anomalies, 2);
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.errors, 0, "channel failures are not evaluation errors");
    assert_eq!(provider.ohlcv_calls.load(Ordering::SeqCst), 1, "one fetch serves both subscribers");

    let alerts = p.alerts.lock().recent(10);
    assert_eq!(alerts.len(), 2);
    let first = alerts.iter().find(|a| a.subscriber_id == 1).expect("subscriber 1 alert");
    let second = alerts.iter().find(|a| a.subscriber_id == 2).expect("subscriber 2 alert");
    assert_eq!(first.push, Delivery::Sent);
    assert_eq!(first.messaging, Delivery::Sent);
    assert_eq!(second.push, Delivery::Skipped, "no live session");
    assert!(matches!(second.messaging, Delivery::Failed(_)), "{:?}", second.messaging);

    match parse(&rx.recv().await.expect("volume alert")) {
        ServerMessage::VolumeAlert { symbol, threshold, analysis, .. } => {
            assert_eq!(symbol, "BTC/USDT");
            assert_eq!(threshold, 2.0);
            assert_eq!(analysis.multiplier, 5.0);
            assert_eq!(analysis.current_volume, 500.0);
            assert_eq!(analysis.analysis_timeframe, "5m");
            assert_eq!(analysis.notification_interval, 120);
        }
        other => panic!("expected volume alert, got {other:?}"),
    }

    let sent = messenger.sent.lock().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "chat-1");
    assert!(sent[0].1.contains("BTC/USDT"), "{}", sent[0].1);
}

#[tokio::test(start_paused = true)]
async fn test_repeat_anomaly_is_throttled_until_interval_elapses() {
    let provider = Arc::new(ScriptedProvider::default().with_spike("ETH/USDT"));
    let store = Arc::new(MemoryStore::new());
    store.upsert(AnomalySubscription::new(1, "ETH/USDT", 3.0).with_notification_interval(120));
    let p = build(provider.clone(), store, None);

    let first = p.service.anomaly_tick().await.expect("tick 1");
    assert_eq!(first.dispatched, 1);

    let second = p.service.anomaly_tick().await.expect("tick 2");
    assert_eq!(second.anomalies, 1);
    assert_eq!(second.throttled, 1);
    assert_eq!(second.dispatched, 0);
    assert_eq!(provider.ohlcv_calls.load(Ordering::SeqCst), 1, "verdict cached within the tick interval");

    tokio::time::advance(Duration::from_secs(120)).await;
    let third = p.service.anomaly_tick().await.expect("tick 3");
    assert_eq!(third.dispatched, 1);
    assert_eq!(provider.ohlcv_calls.load(Ordering::SeqCst), 2);
    assert_eq!(p.alerts.lock().total_alerts(), 2);
}

#[tokio::test]
async fn test_short_history_is_skipped() {
    let provider = Arc::new(ScriptedProvider::default());
    provider
        .candles
        .lock()
        .insert("XRP/USDT".into(), (0..5).map(|i| Candle::flat(i, 0.5, 1_000.0)).collect());
    let store = Arc::new(MemoryStore::new());
    store.upsert(AnomalySubscription::new(1, "XRP/USDT", 2.0));
    let p = build(provider, store, None);

    let report = p.service.anomaly_tick().await.expect("tick");
    assert_eq!(report.insufficient_data, 1);
    assert_eq!(report.dispatched, 0);
}

// ── Test 5: Lifecycle ──

#[tokio::test(start_paused = true)]
async fn test_start_is_idempotent_and_shutdown_joins_loops() {
    let p = build(Arc::new(ScriptedProvider::default()), Arc::new(MemoryStore::new()), None);

    assert!(p.service.start());
    assert!(!p.service.start(), "second start is a no-op");
    assert!(p.service.is_running());

    tokio::time::sleep(Duration::from_secs(5)).await;
    p.service.shutdown().await;
    assert!(!p.service.is_running());

    let status = p.service.status();
    assert!(status.timings.price_ticks >= 2, "{:?}", status.timings.price_ticks);
    assert!(status.timings.anomaly_ticks >= 1);
    assert_eq!(status.timings.failed_ticks, 0);

    assert!(p.service.start(), "restart after stop");
    p.service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_iterations_back_off() {
    let p = build(Arc::new(ScriptedProvider::default()), Arc::new(FailingStore), None);

    p.service.start();
    tokio::time::sleep(Duration::from_secs(120)).await;
    p.service.shutdown().await;

    // 10s interval with a 5x backoff: failing ticks at 0s, 50s and 100s.
    let timings = p.service.status().timings;
    assert!((2..=3).contains(&timings.anomaly_ticks), "{} anomaly ticks", timings.anomaly_ticks);
    assert_eq!(timings.failed_ticks, timings.anomaly_ticks, "price loop never failed");
}
