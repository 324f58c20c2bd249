use std::collections::HashMap;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use crate::types::SubscriberId;

/// Per-(subscriber, symbol) alert suppression.
///
/// The check and the timestamp update happen under the same shard lock, so
/// two concurrent evaluations for one pair cannot both pass.
#[derive(Debug, Default)]
pub struct NotificationThrottle {
    last_sent: DashMap<SubscriberId, HashMap<String, Sent>>,
}

/// Last pass for one pair and the interval it was gated with.
#[derive(Debug, Clone, Copy)]
struct Sent {
    at: Instant,
    interval: Duration,
}

impl NotificationThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_notify(&self, subscriber_id: SubscriberId, symbol: &str, interval: Duration) -> bool {
        self.can_notify_at(subscriber_id, symbol, interval, Instant::now())
    }

    /// Passes when nothing was sent for the pair yet, or at least `interval`
    /// has elapsed since the last pass. A pass records `now`.
    pub fn can_notify_at(
        &self,
        subscriber_id: SubscriberId,
        symbol: &str,
        interval: Duration,
        now: Instant,
    ) -> bool {
        let mut symbols = self.last_sent.entry(subscriber_id).or_default();
        match symbols.get_mut(symbol) {
            Some(last) if now.saturating_duration_since(last.at) < interval => false,
            Some(last) => {
                *last = Sent { at: now, interval };
                true
            }
            None => {
                symbols.insert(symbol.to_string(), Sent { at: now, interval });
                true
            }
        }
    }

    /// Drop all state for a subscriber.
    pub fn forget(&self, subscriber_id: SubscriberId) {
        self.last_sent.remove(&subscriber_id);
    }

    /// Drop pairs idle for at least `max_idle` and for at least their own
    /// notification interval, so a pruned pair could have passed anyway.
    /// Returns how many pairs were removed.
    pub fn prune(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.last_sent.retain(|_, symbols| {
            let before = symbols.len();
            symbols.retain(|_, last| now.saturating_duration_since(last.at) < last.interval.max(max_idle));
            removed += before - symbols.len();
            !symbols.is_empty()
        });
        removed
    }

    /// Tracked (subscriber, symbol) pairs.
    pub fn len(&self) -> usize {
        self.last_sent.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
