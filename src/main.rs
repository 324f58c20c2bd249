use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use volume_watch::config::AppConfig;
use volume_watch::notifier::{MessagingChannel, TelegramBot};
use volume_watch::pipeline::{self, shutdown_signal};
use volume_watch::provider::{BinanceProvider, DataProvider, BINANCE_BASE_URL};
use volume_watch::simulator::{self, MarketSimulator};
use volume_watch::store::MemoryStore;
use volume_watch::types::AnomalySubscription;
use volume_watch::{tui, web};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Web,
    Headless,
    Tui,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    Binance,
    Simulated,
}

#[derive(Parser)]
#[command(name = "volume-watch", about = "Volume-anomaly alerts over live push and chat bot")]
struct Cli {
    /// Run mode
    #[arg(long, value_enum, default_value = "web")]
    mode: Mode,

    /// HTTP/websocket port (web mode only)
    #[arg(long, default_value = "8000")]
    port: u16,

    /// Market-data source
    #[arg(long, value_enum, default_value = "simulated")]
    provider: ProviderKind,

    /// JSON config file
    #[arg(long, env = "VOLUME_WATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Telegram bot token; the messaging channel is disabled without one
    #[arg(long, env = "TELEGRAM_BOT_TOKEN", hide_env_values = true)]
    telegram_token: Option<String>,

    /// Volume-spike probability per simulated candle (0.0-1.0)
    #[arg(long, default_value = "0.05")]
    spike_rate: f64,

    /// Run duration in seconds (0 = until ctrl-c)
    #[arg(long, default_value = "0")]
    duration: u64,

    /// Log filter directive
    #[arg(long, env = "RUST_LOG", default_value = "info")]
    log_filter: String,
}

fn init_logging(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // The dashboard owns the terminal; log lines would tear it.
    if cli.mode != Mode::Tui {
        init_logging(&cli.log_filter);
    }

    let mut config = AppConfig::load(cli.config.as_deref())?;
    if config.subscriptions.is_empty() && cli.provider == ProviderKind::Simulated {
        // Demo subscriber so the simulated market has something to alert on.
        config.subscriptions = simulator::SYMBOLS
            .iter()
            .map(|(symbol, _, _)| AnomalySubscription::new(tui::DASHBOARD_SUBSCRIBER, *symbol, 2.0).with_notification_interval(60))
            .collect();
    }

    let provider: Arc<dyn DataProvider> = match cli.provider {
        ProviderKind::Binance => Arc::new(BinanceProvider::new(BINANCE_BASE_URL, config.service.upstream_timeout)?),
        ProviderKind::Simulated => Arc::new(MarketSimulator::new(cli.spike_rate, 0.0)),
    };
    let messenger: Option<Arc<dyn MessagingChannel>> = match &cli.telegram_token {
        Some(token) => Some(Arc::new(TelegramBot::from_config(token.clone(), &config.service)?)),
        None => None,
    };
    let store = Arc::new(MemoryStore::from_config(&config));

    info!(
        mode = ?cli.mode,
        provider = ?cli.provider,
        subscriptions = store.len(),
        messaging = messenger.is_some(),
        "starting volume-watch"
    );

    let symbols: Vec<String> = config.subscriptions.iter().map(|s| s.symbol.clone()).collect();
    let pipeline = Arc::new(pipeline::setup(config, provider, store, messenger));

    match cli.mode {
        Mode::Web => web::run(pipeline, cli.port, cli.duration).await?,
        Mode::Tui => tui::run(pipeline, symbols, cli.duration).await?,
        Mode::Headless => run_headless(pipeline, cli.duration).await?,
    }

    Ok(())
}

async fn run_headless(pipeline: Arc<pipeline::Pipeline>, duration: u64) -> Result<(), Box<dyn std::error::Error>> {
    let sweeper = pipeline.start();
    shutdown_signal(duration).await;
    pipeline.service.shutdown().await;
    sweeper.abort();

    let status = pipeline.service.status();
    let t = &status.timings;
    println!();
    println!("=== Results ===");
    println!("  Price ticks:        {}", t.price_ticks);
    println!("  Anomaly ticks:      {}", t.anomaly_ticks);
    println!("  Failed ticks:       {}", t.failed_ticks);
    println!("  Alerts dispatched:  {}", status.total_alerts);
    println!("  Breaker:            {:?}", status.breaker.state);
    println!();
    println!("  Timings (microseconds):");
    println!("    Price:    p50={} p95={} p99={}", t.price_tick.p50_us, t.price_tick.p95_us, t.price_tick.p99_us);
    println!("    Anomaly:  p50={} p95={} p99={}", t.anomaly_tick.p50_us, t.anomaly_tick.p95_us, t.anomaly_tick.p99_us);
    println!("    Dispatch: p50={} p95={} p99={}", t.dispatch.p50_us, t.dispatch.p95_us, t.dispatch.p99_us);
    println!();

    for alert in pipeline.alerts.lock().recent(20) {
        println!("  ALERT | {:?} | {}", alert.severity, alert.description());
    }
    Ok(())
}
