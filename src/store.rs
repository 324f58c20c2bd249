use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::config::AppConfig;
use crate::error::Result;
use crate::types::{normalize_symbol, AnomalySubscription, SubscriberId};

/// Read side of the subscription database.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Every active anomaly subscription.
    async fn anomaly_subscriptions(&self) -> Result<Vec<AnomalySubscription>>;

    /// The subscriber's messaging chat id, if one is linked.
    async fn messaging_chat_id(&self, subscriber_id: SubscriberId) -> Result<Option<String>>;
}

/// In-memory store, seeded from configuration.
#[derive(Debug, Default)]
pub struct MemoryStore {
    subscriptions: RwLock<HashMap<(SubscriberId, String), AnomalySubscription>>,
    chat_ids: RwLock<HashMap<SubscriberId, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let store = Self::new();
        for sub in &config.subscriptions {
            store.upsert(sub.clone());
        }
        for (id, chat_id) in &config.messaging_targets {
            store.set_chat_id(*id, chat_id.clone());
        }
        store
    }

    /// Insert or replace the subscription for its (subscriber, symbol).
    pub fn upsert(&self, mut subscription: AnomalySubscription) {
        subscription.symbol = normalize_symbol(&subscription.symbol);
        let key = (subscription.subscriber_id, subscription.symbol.clone());
        self.subscriptions.write().insert(key, subscription);
    }

    pub fn remove(&self, subscriber_id: SubscriberId, symbol: &str) -> bool {
        self.subscriptions
            .write()
            .remove(&(subscriber_id, normalize_symbol(symbol)))
            .is_some()
    }

    pub fn set_chat_id(&self, subscriber_id: SubscriberId, chat_id: impl Into<String>) {
        self.chat_ids.write().insert(subscriber_id, chat_id.into());
    }

    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn anomaly_subscriptions(&self) -> Result<Vec<AnomalySubscription>> {
        let mut subs: Vec<AnomalySubscription> = self.subscriptions.read().values().cloned().collect();
        subs.sort_by(|a, b| (a.subscriber_id, &a.symbol).cmp(&(b.subscriber_id, &b.symbol)));
        Ok(subs)
    }

    async fn messaging_chat_id(&self, subscriber_id: SubscriberId) -> Result<Option<String>> {
        Ok(self.chat_ids.read().get(&subscriber_id).cloned())
    }
}
