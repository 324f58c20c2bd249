use std::collections::{HashMap, VecDeque};

use serde::Serialize;

use crate::detection::{AlertSeverity, AnomalyVerdict};
use crate::types::SubscriberId;

/// Outcome of one delivery attempt on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum Delivery {
    Sent,
    /// No session, or no linked chat.
    Skipped,
    Failed(String),
}

impl Delivery {
    pub fn label(&self) -> &'static str {
        match self {
            Delivery::Sent => "sent",
            Delivery::Skipped => "skipped",
            Delivery::Failed(_) => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VolumeAlertRecord {
    pub id: u64,
    pub subscriber_id: SubscriberId,
    pub symbol: String,
    pub severity: AlertSeverity,
    pub threshold: f64,
    pub verdict: AnomalyVerdict,
    pub push: Delivery,
    pub messaging: Delivery,
    pub timestamp_ms: i64,
}

impl VolumeAlertRecord {
    pub fn description(&self) -> String {
        format!(
            "#{} {} vol={:.0} avg={:.0} ({:.1}x) push={} bot={}",
            self.subscriber_id,
            self.symbol,
            self.verdict.current_volume,
            self.verdict.avg_volume,
            self.verdict.multiplier,
            self.push.label(),
            self.messaging.label(),
        )
    }
}

/// Bounded history of dispatched volume alerts.
pub struct AlertLog {
    capacity: usize,
    next_id: u64,
    alerts: VecDeque<VolumeAlertRecord>,
    counts: HashMap<&'static str, u64>,
}

impl AlertLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            next_id: 0,
            alerts: VecDeque::with_capacity(capacity),
            counts: HashMap::new(),
        }
    }

    pub fn record(
        &mut self,
        subscriber_id: SubscriberId,
        symbol: &str,
        threshold: f64,
        verdict: AnomalyVerdict,
        push: Delivery,
        messaging: Delivery,
    ) -> VolumeAlertRecord {
        self.next_id += 1;
        let severity = verdict.severity();
        let alert = VolumeAlertRecord {
            id: self.next_id,
            subscriber_id,
            symbol: symbol.to_string(),
            severity,
            threshold,
            verdict,
            push,
            messaging,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        };
        *self.counts.entry(severity.label()).or_insert(0) += 1;
        if self.alerts.len() >= self.capacity {
            self.alerts.pop_front();
        }
        self.alerts.push_back(alert.clone());
        alert
    }

    pub fn recent_alerts(&self) -> &VecDeque<VolumeAlertRecord> {
        &self.alerts
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<VolumeAlertRecord> {
        self.alerts.iter().rev().take(limit).cloned().collect()
    }

    pub fn severity_counts(&self) -> &HashMap<&'static str, u64> {
        &self.counts
    }

    pub fn total_alerts(&self) -> u64 {
        self.counts.values().sum()
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new(200)
    }
}
