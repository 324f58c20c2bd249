use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::alerts::AlertLog;
use crate::cache::CacheManager;
use crate::config::AppConfig;
use crate::latency::TickTimings;
use crate::notifier::MessagingChannel;
use crate::provider::{DataProvider, MarketData};
use crate::registry::ConnectionRegistry;
use crate::resilience::CircuitBreaker;
use crate::service::{PollingService, ServiceContext};
use crate::store::SubscriptionStore;
use crate::throttle::NotificationThrottle;

/// Every long-lived component, wired together. Components are shared by
/// handle; nothing is global.
pub struct Pipeline {
    pub config: AppConfig,
    pub registry: Arc<ConnectionRegistry>,
    pub cache: Arc<CacheManager>,
    pub market: Arc<MarketData>,
    pub throttle: Arc<NotificationThrottle>,
    pub store: Arc<dyn SubscriptionStore>,
    pub alerts: Arc<Mutex<AlertLog>>,
    pub timings: Arc<Mutex<TickTimings>>,
    pub service: PollingService,
}

pub fn setup(
    config: AppConfig,
    provider: Arc<dyn DataProvider>,
    store: Arc<dyn SubscriptionStore>,
    messenger: Option<Arc<dyn MessagingChannel>>,
) -> Pipeline {
    let cache = Arc::new(CacheManager::new(&config.cache));
    let throttle = Arc::new(NotificationThrottle::new());
    let registry = Arc::new(ConnectionRegistry::new(throttle.clone()).with_send_timeout(config.service.push_send_timeout));
    let market = Arc::new(MarketData::new(
        provider,
        CircuitBreaker::new("market-data", &config.breaker),
        config.retry.clone(),
        config.service.upstream_timeout,
        cache.clone(),
    ));
    let alerts = Arc::new(Mutex::new(AlertLog::new(config.service.alert_history)));
    let timings = Arc::new(Mutex::new(TickTimings::new()));

    let service = PollingService::new(ServiceContext {
        config: config.service.clone(),
        registry: registry.clone(),
        market: market.clone(),
        cache: cache.clone(),
        store: store.clone(),
        messenger,
        throttle: throttle.clone(),
        alerts: alerts.clone(),
        timings: timings.clone(),
    });

    Pipeline { config, registry, cache, market, throttle, store, alerts, timings, service }
}

impl Pipeline {
    /// Start the polling loops and the periodic cache sweeper.
    pub fn start(&self) -> JoinHandle<()> {
        self.service.start();
        self.cache.spawn_sweeper(self.config.cache.sweep_interval)
    }
}

/// Resolves on ctrl-c, or once `duration_secs` have elapsed (0 = no limit).
pub async fn shutdown_signal(duration_secs: u64) {
    let deadline = async {
        if duration_secs == 0 {
            std::future::pending::<()>().await;
        } else {
            tokio::time::sleep(Duration::from_secs(duration_secs)).await;
        }
    };
    tokio::select! {
        res = tokio::signal::ctrl_c() => match res {
            Ok(()) => info!("ctrl-c received, shutting down"),
            Err(err) => warn!(error = %err, "failed to listen for ctrl-c, shutting down"),
        },
        _ = deadline => info!(duration_secs, "run duration elapsed, shutting down"),
    }
}
