use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;

use crate::detection::MIN_SAMPLES;
use crate::error::{Error, Result};
use crate::provider::{timeframe_millis, DataProvider};
use crate::types::{Candle, Ticker};

pub const SYMBOLS: &[(&str, f64, f64)] = &[
    ("BTC/USDT", 65_000.0, 40.0),
    ("ETH/USDT", 3_200.0, 600.0),
    ("SOL/USDT", 150.0, 9_000.0),
    ("BNB/USDT", 580.0, 1_500.0),
    ("XRP/USDT", 0.6, 2_000_000.0),
];

const HISTORY: usize = MIN_SAMPLES * 5;

struct Instrument {
    price: f64,
    open_24h: f64,
    base_volume: f64,
    candles: VecDeque<Candle>,
    spike_next: bool,
}

/// Synthetic market: random-walk prices and candle volumes, with occasional
/// injected volume spikes and upstream failures.
pub struct MarketSimulator {
    instruments: Mutex<HashMap<String, Instrument>>,
    /// Probability that a newly closed candle carries a volume spike.
    pub spike_rate: f64,
    /// Probability that any fetch fails with an upstream error.
    pub failure_rate: f64,
}

impl MarketSimulator {
    pub fn new(spike_rate: f64, failure_rate: f64) -> Self {
        Self {
            instruments: Mutex::new(HashMap::new()),
            spike_rate: spike_rate.clamp(0.0, 1.0),
            failure_rate: failure_rate.clamp(0.0, 1.0),
        }
    }

    pub fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Force the next candle of `symbol` to carry a spike.
    pub fn inject_spike(&self, symbol: &str) {
        let mut instruments = self.instruments.lock();
        let step = timeframe_millis("5m").unwrap_or(300_000);
        instruments
            .entry(symbol.to_string())
            .or_insert_with(|| seed(symbol, step))
            .spike_next = true;
    }

    fn maybe_fail(&self, what: &str) -> Result<()> {
        if self.failure_rate > 0.0 && rand::thread_rng().gen_bool(self.failure_rate.min(1.0)) {
            return Err(Error::Upstream(format!("simulated {what} failure")));
        }
        Ok(())
    }

    fn next_ticker(&self, symbol: &str) -> Ticker {
        let mut rng = rand::thread_rng();
        let mut instruments = self.instruments.lock();
        let inst = instruments
            .entry(symbol.to_string())
            .or_insert_with(|| seed(symbol, 300_000));

        inst.price = (inst.price * (1.0 + rng.gen_range(-0.002..0.002))).max(f64::EPSILON);
        let (high, low) = inst
            .candles
            .iter()
            .fold((inst.price, inst.price), |(h, l), c| (h.max(c.high), l.min(c.low)));

        Ticker {
            symbol: symbol.to_string(),
            last: inst.price,
            high,
            low,
            percentage_change: (inst.price - inst.open_24h) / inst.open_24h * 100.0,
            base_volume: inst.candles.iter().map(|c| c.volume).sum(),
            timestamp: Self::now_ms(),
        }
    }

    fn next_candles(&self, symbol: &str, step_ms: i64, limit: usize) -> Vec<Candle> {
        let mut rng = rand::thread_rng();
        let mut instruments = self.instruments.lock();
        let inst = instruments
            .entry(symbol.to_string())
            .or_insert_with(|| seed(symbol, step_ms));

        let open = inst.price;
        let close = (open * (1.0 + rng.gen_range(-0.004..0.004))).max(f64::EPSILON);
        let spike = inst.spike_next || rng.gen_bool(self.spike_rate.clamp(0.0, 1.0));
        inst.spike_next = false;
        let mut volume = inst.base_volume * rng.gen_range(0.8..1.2);
        if spike {
            volume *= rng.gen_range(4.0..12.0);
        }
        let timestamp = inst.candles.back().map_or_else(Self::now_ms, |c| c.timestamp + step_ms);
        inst.price = close;
        push_capped(
            &mut inst.candles,
            Candle {
                timestamp,
                open,
                high: open.max(close) * (1.0 + rng.gen_range(0.0..0.002)),
                low: open.min(close) * (1.0 - rng.gen_range(0.0..0.002)),
                close,
                volume,
            },
        );

        let skip = inst.candles.len().saturating_sub(limit);
        inst.candles.iter().skip(skip).copied().collect()
    }
}

impl Default for MarketSimulator {
    fn default() -> Self {
        Self::new(0.05, 0.0)
    }
}

fn seed(symbol: &str, step_ms: i64) -> Instrument {
    let mut rng = rand::thread_rng();
    let (price, base_volume) = SYMBOLS
        .iter()
        .find(|(s, _, _)| *s == symbol)
        .map_or((100.0, 1_000.0), |(_, p, v)| (*p, *v));

    let start = MarketSimulator::now_ms() - step_ms * HISTORY as i64;
    let mut candles = VecDeque::with_capacity(HISTORY);
    let mut px = price;
    for i in 0..HISTORY {
        let next = px * (1.0 + rng.gen_range(-0.003..0.003));
        candles.push_back(Candle {
            timestamp: start + step_ms * i as i64,
            open: px,
            high: px.max(next),
            low: px.min(next),
            close: next,
            volume: base_volume * rng.gen_range(0.8..1.2),
        });
        px = next;
    }

    Instrument { price: px, open_24h: price, base_volume, candles, spike_next: false }
}

fn push_capped(q: &mut VecDeque<Candle>, candle: Candle) {
    if q.len() >= HISTORY {
        q.pop_front();
    }
    q.push_back(candle);
}

#[async_trait]
impl DataProvider for MarketSimulator {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn fetch_ticker(&self, symbol: &str) -> Result<Ticker> {
        self.maybe_fail("ticker")?;
        Ok(self.next_ticker(symbol))
    }

    async fn fetch_ohlcv(&self, symbol: &str, timeframe: &str, limit: usize) -> Result<Vec<Candle>> {
        self.maybe_fail("ohlcv")?;
        let step = timeframe_millis(timeframe)
            .ok_or_else(|| Error::Upstream(format!("unsupported timeframe {timeframe:?}")))?;
        Ok(self.next_candles(symbol, step, limit))
    }
}
