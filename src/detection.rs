use serde::{Deserialize, Serialize};

use crate::types::Candle;

/// Samples required for one detection pass: the latest candle plus the
/// trailing 19 it is compared against.
pub const MIN_SAMPLES: usize = 20;

/// Outlier band: the latest volume must exceed `avg + OUTLIER_SIGMAS * stddev`.
pub const OUTLIER_SIGMAS: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn from_multiplier(multiplier: f64) -> Self {
        if multiplier >= 10.0 {
            AlertSeverity::Critical
        } else if multiplier >= 5.0 {
            AlertSeverity::High
        } else {
            AlertSeverity::Medium
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AlertSeverity::Medium => "Medium",
            AlertSeverity::High => "High",
            AlertSeverity::Critical => "Critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnomalyVerdict {
    pub current_volume: f64,
    /// Mean volume of the trailing samples, latest excluded.
    pub avg_volume: f64,
    /// Population standard deviation of the trailing samples.
    pub std_dev: f64,
    pub multiplier: f64,
    pub is_anomaly: bool,
    /// Close of the latest candle.
    pub price: f64,
    pub timestamp: i64,
}

impl AnomalyVerdict {
    pub fn severity(&self) -> AlertSeverity {
        AlertSeverity::from_multiplier(self.multiplier)
    }
}

/// Two-part volume test over the most recent [`MIN_SAMPLES`] candles.
///
/// The latest volume is anomalous only if it is at least `threshold` times
/// the trailing mean AND lies above `mean + 2 * stddev` of the trailing
/// distribution. Returns `None` when fewer than [`MIN_SAMPLES`] are given.
pub fn analyze(window: &[Candle], threshold: f64) -> Option<AnomalyVerdict> {
    if window.len() < MIN_SAMPLES {
        return None;
    }
    let recent = &window[window.len() - MIN_SAMPLES..];
    let (trailing, latest) = recent.split_at(MIN_SAMPLES - 1);
    let latest = latest[0];

    let n = trailing.len() as f64;
    let avg = trailing.iter().map(|c| c.volume).sum::<f64>() / n;
    let variance = trailing.iter().map(|c| (c.volume - avg).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();

    let multiplier = if avg > 0.0 { latest.volume / avg } else { 0.0 };
    let is_anomaly = multiplier >= threshold && latest.volume > avg + OUTLIER_SIGMAS * std_dev;

    Some(AnomalyVerdict {
        current_volume: latest.volume,
        avg_volume: avg,
        std_dev,
        multiplier,
        is_anomaly,
        price: latest.close,
        timestamp: latest.timestamp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(trailing: &[f64], latest: f64) -> Vec<Candle> {
        trailing
            .iter()
            .chain(std::iter::once(&latest))
            .enumerate()
            .map(|(i, v)| Candle::flat(i as i64 * 60_000, 100.0 + i as f64, *v))
            .collect()
    }

    #[test]
    fn test_severity_bands() {
        assert_eq!(AlertSeverity::from_multiplier(2.5), AlertSeverity::Medium);
        assert_eq!(AlertSeverity::from_multiplier(5.0), AlertSeverity::High);
        assert_eq!(AlertSeverity::from_multiplier(12.0), AlertSeverity::Critical);
    }

    #[test]
    fn test_only_last_twenty_samples_count() {
        // 5 huge leading candles fall outside the analysed window
        let mut candles = window(&[1_000_000.0; 5], 1_000_000.0);
        candles.extend(window(&[100.0; 19], 500.0));
        let verdict = analyze(&candles, 2.0).unwrap();
        assert_eq!(verdict.avg_volume, 100.0);
        assert!(verdict.is_anomaly);
    }
}
