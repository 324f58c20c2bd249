//! Price-broadcast and anomaly-check loops.
//!
//! Each loop runs one iteration, then sleeps its interval. A failed iteration
//! is logged and stretches the next sleep by `failure_backoff_factor`; it
//! never ends the loop. `stop()` is observed at iteration boundaries only.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::alerts::{AlertLog, Delivery, VolumeAlertRecord};
use crate::cache::{CacheDomain, CacheKey, CacheManager};
use crate::config::ServiceConfig;
use crate::detection::{analyze, AnomalyVerdict};
use crate::error::{Error, Result};
use crate::latency::{TickTimings, TimingSnapshot};
use crate::notifier::{alert_headline, format_volume_alert, MessagingChannel};
use crate::provider::MarketData;
use crate::registry::{ConnectionRegistry, RegistryStats};
use crate::resilience::BreakerSnapshot;
use crate::store::SubscriptionStore;
use crate::throttle::NotificationThrottle;
use crate::types::{AlertAnalysis, AnomalySubscription, ServerMessage, SubscriberId};

/// Throttle pairs idle for longer than this are pruned after each anomaly tick.
pub const THROTTLE_MAX_IDLE: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    Price,
    Anomaly,
}

impl LoopKind {
    fn name(&self) -> &'static str {
        match self {
            LoopKind::Price => "price",
            LoopKind::Anomaly => "anomaly",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PriceTickReport {
    pub symbols: usize,
    pub failed_symbols: usize,
    pub delivered: usize,
    pub dropped_sessions: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnomalyTickReport {
    pub evaluated: usize,
    pub insufficient_data: usize,
    pub anomalies: usize,
    pub throttled: usize,
    pub dispatched: usize,
    pub errors: usize,
}

#[derive(Debug)]
enum Evaluation {
    InsufficientData,
    Normal,
    Throttled,
    Dispatched(VolumeAlertRecord),
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub provider: String,
    pub breaker: BreakerSnapshot,
    pub registry: RegistryStats,
    pub timings: TimingSnapshot,
    pub total_alerts: u64,
    pub throttle_entries: usize,
}

pub struct ServiceContext {
    pub config: ServiceConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub market: Arc<MarketData>,
    pub cache: Arc<CacheManager>,
    pub store: Arc<dyn SubscriptionStore>,
    pub messenger: Option<Arc<dyn MessagingChannel>>,
    pub throttle: Arc<NotificationThrottle>,
    pub alerts: Arc<Mutex<AlertLog>>,
    pub timings: Arc<Mutex<TickTimings>>,
}

struct Inner {
    ctx: ServiceContext,
    running: AtomicBool,
    generation: AtomicU64,
    wake: Notify,
}

pub struct PollingService {
    inner: Arc<Inner>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl PollingService {
    pub fn new(ctx: ServiceContext) -> Self {
        Self {
            inner: Arc::new(Inner {
                ctx,
                running: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                wake: Notify::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Spawn both loops. Returns false (and does nothing) if already running.
    pub fn start(&self) -> bool {
        let mut handles = self.handles.lock();
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return false;
        }
        // Loops of an earlier generation that are still draining exit on
        // their next boundary instead of resuming.
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        handles.retain(|h| !h.is_finished());
        for kind in [LoopKind::Price, LoopKind::Anomaly] {
            handles.push(tokio::spawn(run_loop(self.inner.clone(), kind, generation)));
        }
        info!(
            generation,
            price_interval = ?self.inner.ctx.config.price_interval,
            anomaly_interval = ?self.inner.ctx.config.anomaly_interval,
            "polling service started"
        );
        true
    }

    /// Ask both loops to exit at their next iteration boundary. In-flight
    /// iterations run to completion.
    pub fn stop(&self) {
        if self.inner.running.swap(false, Ordering::AcqRel) {
            info!("polling service stopping");
        }
        self.inner.wake.notify_waiters();
    }

    /// `stop()` and wait for the loops to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(err) = handle.await {
                error!(error = %err, "polling loop panicked");
            }
        }
        info!("polling service stopped");
    }

    pub async fn price_tick(&self) -> Result<PriceTickReport> {
        self.inner.price_tick().await
    }

    pub async fn anomaly_tick(&self) -> Result<AnomalyTickReport> {
        self.inner.anomaly_tick().await
    }

    pub fn status(&self) -> ServiceStatus {
        let ctx = &self.inner.ctx;
        ServiceStatus {
            running: self.is_running(),
            provider: ctx.market.provider_name().to_string(),
            breaker: ctx.market.breaker().snapshot(),
            registry: ctx.registry.stats(),
            timings: ctx.timings.lock().snapshot(),
            total_alerts: ctx.alerts.lock().total_alerts(),
            throttle_entries: ctx.throttle.len(),
        }
    }
}

async fn run_loop(inner: Arc<Inner>, kind: LoopKind, generation: u64) {
    let config = &inner.ctx.config;
    let interval = match kind {
        LoopKind::Price => config.price_interval,
        LoopKind::Anomaly => config.anomaly_interval,
    };
    let backoff = interval.saturating_mul(config.failure_backoff_factor.max(1));
    info!(task = kind.name(), ?interval, "polling loop started");

    loop {
        if !inner.is_current(generation) {
            break;
        }

        let started = Instant::now();
        let outcome = match kind {
            LoopKind::Price => inner.price_tick().await.map(|report| {
                debug!(symbols = report.symbols, delivered = report.delivered, "price tick");
            }),
            LoopKind::Anomaly => inner.anomaly_tick().await.map(|report| {
                debug!(
                    evaluated = report.evaluated,
                    anomalies = report.anomalies,
                    dispatched = report.dispatched,
                    "anomaly tick"
                );
            }),
        };
        let elapsed = started.elapsed();
        {
            let mut timings = inner.ctx.timings.lock();
            match kind {
                LoopKind::Price => timings.record_price_tick(elapsed, outcome.is_ok()),
                LoopKind::Anomaly => timings.record_anomaly_tick(elapsed, outcome.is_ok()),
            }
        }

        let sleep_for = match outcome {
            Ok(()) => interval,
            Err(err) => {
                warn!(task = kind.name(), error = %err, backoff = ?backoff, "polling iteration failed");
                backoff
            }
        };

        let notified = inner.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !inner.is_current(generation) {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = notified => {}
        }
    }
    info!(task = kind.name(), "polling loop exited");
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.running.load(Ordering::Acquire) && self.generation.load(Ordering::Acquire) == generation
    }

    /// Fetch a ticker for every symbol with at least one live subscriber and
    /// broadcast it. Fails only if every fetch failed.
    async fn price_tick(&self) -> Result<PriceTickReport> {
        let ctx = &self.ctx;
        let symbols = ctx.registry.active_symbols();
        let mut report = PriceTickReport::default();
        if symbols.is_empty() {
            return Ok(report);
        }

        let ttl = Some(ctx.config.price_interval);
        let fetches = join_all(symbols.iter().map(|symbol| ctx.market.ticker(symbol, ttl))).await;

        let mut last_error = None;
        for (symbol, fetched) in symbols.iter().zip(fetches) {
            match fetched {
                Ok(ticker) => {
                    let payload = ServerMessage::price_update(ticker).to_json()?;
                    let outcome = ctx.registry.broadcast(symbol, &payload).await;
                    report.symbols += 1;
                    report.delivered += outcome.delivered;
                    report.dropped_sessions += outcome.failed.len();
                }
                Err(err) => {
                    warn!(%symbol, error = %err, "ticker fetch failed");
                    report.failed_symbols += 1;
                    last_error = Some(err);
                }
            }
        }

        match last_error {
            Some(err) if report.symbols == 0 => Err(err),
            _ => Ok(report),
        }
    }

    /// Evaluate every anomaly subscription concurrently and dispatch alerts
    /// that pass the throttle. Fails if the subscription list cannot be read
    /// or if every evaluation failed.
    async fn anomaly_tick(&self) -> Result<AnomalyTickReport> {
        let subscriptions = self.ctx.store.anomaly_subscriptions().await?;
        let outcomes = join_all(subscriptions.iter().map(|sub| self.evaluate(sub))).await;

        let mut report = AnomalyTickReport { evaluated: subscriptions.len(), ..Default::default() };
        let mut last_error = None;
        for (sub, outcome) in subscriptions.iter().zip(outcomes) {
            match outcome {
                Ok(Evaluation::InsufficientData) => report.insufficient_data += 1,
                Ok(Evaluation::Normal) => {}
                Ok(Evaluation::Throttled) => {
                    report.anomalies += 1;
                    report.throttled += 1;
                }
                Ok(Evaluation::Dispatched(record)) => {
                    debug!(alert_id = record.id, subscriber_id = record.subscriber_id, "alert recorded");
                    report.anomalies += 1;
                    report.dispatched += 1;
                }
                Err(err) => {
                    warn!(subscriber_id = sub.subscriber_id, symbol = %sub.symbol, error = %err, "anomaly evaluation failed");
                    report.errors += 1;
                    last_error = Some(err);
                }
            }
        }

        let pruned = self.ctx.throttle.prune(THROTTLE_MAX_IDLE);
        if pruned > 0 {
            debug!(pruned, "pruned idle throttle entries");
        }

        match last_error {
            Some(err) if report.errors == report.evaluated => Err(err),
            _ => Ok(report),
        }
    }

    async fn evaluate(&self, sub: &AnomalySubscription) -> Result<Evaluation> {
        let Some(verdict) = self.verdict(sub).await? else {
            return Ok(Evaluation::InsufficientData);
        };
        if !verdict.is_anomaly {
            return Ok(Evaluation::Normal);
        }
        if !self
            .ctx
            .throttle
            .can_notify(sub.subscriber_id, &sub.symbol, sub.notification_interval())
        {
            debug!(subscriber_id = sub.subscriber_id, symbol = %sub.symbol, "alert throttled");
            return Ok(Evaluation::Throttled);
        }
        Ok(Evaluation::Dispatched(self.dispatch(sub, &verdict).await))
    }

    /// Verdicts are shared by every subscription with the same symbol,
    /// timeframe and threshold until the next anomaly tick.
    async fn verdict(&self, sub: &AnomalySubscription) -> Result<Option<AnomalyVerdict>> {
        let ctx = &self.ctx;
        let key = CacheKey::new("verdict")
            .arg(&sub.symbol)
            .named("tf", &sub.analysis_timeframe)
            .named("threshold", sub.threshold)
            .build();
        let ttl = Some(ctx.config.anomaly_interval);

        ctx.cache
            .get_or_fetch(CacheDomain::Analytics, &key, ttl, move || async move {
                let candles = ctx
                    .market
                    .ohlcv(&sub.symbol, &sub.analysis_timeframe, ctx.config.ohlcv_window, ttl)
                    .await?;
                Ok(analyze(&candles, sub.threshold))
            })
            .await
    }

    async fn chat_id(&self, subscriber_id: SubscriberId) -> Result<Option<String>> {
        let store = &self.ctx.store;
        let key = CacheKey::new("chat_id").arg(subscriber_id).build();
        self.ctx
            .cache
            .get_or_fetch(CacheDomain::Profile, &key, None, move || store.messaging_chat_id(subscriber_id))
            .await
    }

    /// Deliver on both channels concurrently. A failure on one channel is
    /// logged and recorded and has no effect on the other.
    async fn dispatch(&self, sub: &AnomalySubscription, verdict: &AnomalyVerdict) -> VolumeAlertRecord {
        let started = Instant::now();
        let headline = alert_headline(&sub.symbol, verdict);

        let push = async {
            let message = ServerMessage::VolumeAlert {
                symbol: sub.symbol.clone(),
                threshold: sub.threshold,
                message: headline.clone(),
                timestamp: chrono::Utc::now(),
                analysis: AlertAnalysis {
                    current_volume: verdict.current_volume,
                    avg_volume: verdict.avg_volume,
                    multiplier: verdict.multiplier,
                    price: verdict.price,
                    std_dev: verdict.std_dev,
                    analysis_timeframe: sub.analysis_timeframe.clone(),
                    notification_interval: sub.notification_interval_secs,
                },
            };
            match self.ctx.registry.send_message(sub.subscriber_id, &message).await {
                Ok(true) => Delivery::Sent,
                Ok(false) => Delivery::Skipped,
                Err(err) => {
                    warn!(subscriber_id = sub.subscriber_id, symbol = %sub.symbol, error = %err, "push alert failed");
                    Delivery::Failed(err.to_string())
                }
            }
        };

        let bot = async {
            let Some(messenger) = &self.ctx.messenger else {
                return Delivery::Skipped;
            };
            let result = match self.chat_id(sub.subscriber_id).await {
                Ok(Some(chat_id)) => {
                    let text = format_volume_alert(&sub.symbol, verdict, &sub.analysis_timeframe, chrono::Utc::now());
                    messenger.send_message(&chat_id, &text).await.and_then(|accepted| {
                        if accepted {
                            Ok(())
                        } else {
                            Err(Error::Dispatch("message rejected by channel".to_string()))
                        }
                    })
                }
                Ok(None) => return Delivery::Skipped,
                Err(err) => Err(err),
            };
            match result {
                Ok(()) => Delivery::Sent,
                Err(err) => {
                    warn!(subscriber_id = sub.subscriber_id, symbol = %sub.symbol, error = %err, "messaging alert failed");
                    Delivery::Failed(err.to_string())
                }
            }
        };

        let (push, messaging) = tokio::join!(push, bot);
        self.ctx.timings.lock().record_dispatch(started.elapsed());

        let record = self.ctx.alerts.lock().record(
            sub.subscriber_id,
            &sub.symbol,
            sub.threshold,
            *verdict,
            push,
            messaging,
        );
        info!(
            subscriber_id = sub.subscriber_id,
            symbol = %sub.symbol,
            multiplier = format!("{:.2}", verdict.multiplier),
            severity = record.severity.label(),
            push = record.push.label(),
            messaging = record.messaging.label(),
            "volume alert dispatched"
        );
        record
    }
}
