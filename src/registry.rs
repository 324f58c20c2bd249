//! Live-push connection registry.
//!
//! Holds at most one session per subscriber plus a reverse index from symbol
//! to subscribers. Both maps sit behind one lock so every mutation leaves
//! them consistent: a subscriber appears under a symbol iff its session's
//! subscription set contains that symbol. The lock is never held across a
//! transport write.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::throttle::NotificationThrottle;
use crate::types::{normalize_symbol, ServerMessage, SubscriberId};

/// Outbound half of a live connection.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: &str) -> Result<()>;
}

/// Transport backed by an in-process channel. The write fails once the
/// receiving half has been dropped.
pub struct ChannelTransport {
    subscriber_id: SubscriberId,
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelTransport {
    pub fn pair(subscriber_id: SubscriberId) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { subscriber_id, tx }), rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, payload: &str) -> Result<()> {
        self.tx.send(payload.to_string()).map_err(|_| Error::Transport {
            subscriber_id: self.subscriber_id,
            reason: "receiver closed".to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Active,
    Closed,
}

struct Session {
    session_id: u64,
    transport: Arc<dyn Transport>,
    subscriptions: HashSet<String>,
    connected_at: DateTime<Utc>,
    state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub subscriber_id: SubscriberId,
    pub session_id: u64,
    pub subscriptions: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub state: SessionState,
}

impl SessionInfo {
    fn of(subscriber_id: SubscriberId, session: &Session) -> Self {
        let mut subscriptions: Vec<String> = session.subscriptions.iter().cloned().collect();
        subscriptions.sort();
        Self {
            subscriber_id,
            session_id: session.session_id,
            subscriptions,
            connected_at: session.connected_at,
            state: session.state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub total_connections: usize,
    pub total_subscriptions: usize,
    pub active_symbols: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Subscribers whose write failed and who were disconnected.
    pub failed: Vec<SubscriberId>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SubscriberId, Session>,
    index: HashMap<String, HashSet<SubscriberId>>,
}

impl RegistryState {
    fn unindex(&mut self, subscriber_id: SubscriberId, symbol: &str) {
        if let Some(subscribers) = self.index.get_mut(symbol) {
            subscribers.remove(&subscriber_id);
            if subscribers.is_empty() {
                self.index.remove(symbol);
            }
        }
    }

    fn remove_session(&mut self, subscriber_id: SubscriberId) -> Option<Session> {
        let mut session = self.sessions.remove(&subscriber_id)?;
        for symbol in &session.subscriptions {
            self.unindex(subscriber_id, symbol);
        }
        session.state = SessionState::Closed;
        Some(session)
    }
}

/// Upper bound on a single transport write unless configured otherwise.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    throttle: Arc<NotificationThrottle>,
    next_session: AtomicU64,
    send_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(throttle: Arc<NotificationThrottle>) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            throttle,
            next_session: AtomicU64::new(1),
            send_timeout: DEFAULT_SEND_TIMEOUT,
        }
    }

    /// A write that has not completed within `timeout` counts as a failed
    /// write and drops the session.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    async fn deliver(&self, subscriber_id: SubscriberId, transport: &dyn Transport, payload: &str) -> Result<()> {
        match tokio::time::timeout(self.send_timeout, transport.send(payload)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Transport {
                subscriber_id,
                reason: format!("send timed out after {:?}", self.send_timeout),
            }),
        }
    }

    /// Register a session and send the connection acknowledgement. Any
    /// previous session of the subscriber is replaced and its subscriptions
    /// are dropped.
    pub async fn connect(&self, subscriber_id: SubscriberId, transport: Arc<dyn Transport>) -> Result<SessionInfo> {
        let session_id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let replaced = {
            let mut state = self.state.lock();
            let replaced = state.remove_session(subscriber_id);
            state.sessions.insert(
                subscriber_id,
                Session {
                    session_id,
                    transport: transport.clone(),
                    subscriptions: HashSet::new(),
                    connected_at: Utc::now(),
                    state: SessionState::Connecting,
                },
            );
            replaced
        };
        if let Some(old) = replaced {
            info!(subscriber_id, old_session = old.session_id, session_id, "replacing existing session");
        }

        let ack = ServerMessage::connected().to_json()?;
        if let Err(err) = self.deliver(subscriber_id, transport.as_ref(), &ack).await {
            self.disconnect_session(subscriber_id, session_id);
            return Err(err);
        }

        let mut state = self.state.lock();
        let total = state.sessions.len();
        match state.sessions.get_mut(&subscriber_id) {
            Some(session) if session.session_id == session_id => {
                session.state = SessionState::Active;
                info!(subscriber_id, session_id, total, "subscriber connected");
                Ok(SessionInfo::of(subscriber_id, session))
            }
            _ => Err(Error::Transport {
                subscriber_id,
                reason: "session replaced during handshake".to_string(),
            }),
        }
    }

    /// Remove the subscriber's session and all of its index entries.
    pub fn disconnect(&self, subscriber_id: SubscriberId) -> Option<SessionInfo> {
        let removed = self.state.lock().remove_session(subscriber_id);
        let session = removed?;
        self.throttle.forget(subscriber_id);
        info!(subscriber_id, session_id = session.session_id, "subscriber disconnected");
        Some(SessionInfo::of(subscriber_id, &session))
    }

    /// Disconnect only if `session_id` is still the subscriber's current
    /// session. A closing socket must not tear down its replacement.
    pub fn disconnect_session(&self, subscriber_id: SubscriberId, session_id: u64) -> Option<SessionInfo> {
        let removed = {
            let mut state = self.state.lock();
            let current = state.sessions.get(&subscriber_id).map(|s| s.session_id) == Some(session_id);
            if current {
                state.remove_session(subscriber_id)
            } else {
                None
            }
        };
        let session = removed?;
        self.throttle.forget(subscriber_id);
        info!(subscriber_id, session_id, "subscriber disconnected");
        Some(SessionInfo::of(subscriber_id, &session))
    }

    /// Returns false if the subscriber has no session.
    pub fn subscribe(&self, subscriber_id: SubscriberId, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(session) = state.sessions.get_mut(&subscriber_id) else {
            return false;
        };
        session.subscriptions.insert(symbol.clone());
        state.index.entry(symbol.clone()).or_default().insert(subscriber_id);
        debug!(subscriber_id, %symbol, "subscribed");
        true
    }

    pub fn unsubscribe(&self, subscriber_id: SubscriberId, symbol: &str) -> bool {
        let symbol = normalize_symbol(symbol);
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let removed = match state.sessions.get_mut(&subscriber_id) {
            Some(session) => session.subscriptions.remove(&symbol),
            None => return false,
        };
        if removed {
            state.unindex(subscriber_id, &symbol);
            debug!(subscriber_id, %symbol, "unsubscribed");
        }
        true
    }

    fn transport_of(&self, subscriber_id: SubscriberId) -> Option<(u64, Arc<dyn Transport>)> {
        let state = self.state.lock();
        state
            .sessions
            .get(&subscriber_id)
            .filter(|session| session.state == SessionState::Active)
            .map(|session| (session.session_id, session.transport.clone()))
    }

    /// Deliver to one subscriber. `Ok(false)` if no active session exists; a
    /// failed write disconnects that session and returns the error.
    pub async fn send_to_one(&self, subscriber_id: SubscriberId, payload: &str) -> Result<bool> {
        let Some((session_id, transport)) = self.transport_of(subscriber_id) else {
            return Ok(false);
        };
        match self.deliver(subscriber_id, transport.as_ref(), payload).await {
            Ok(()) => Ok(true),
            Err(err) => {
                warn!(subscriber_id, error = %err, "push delivery failed, dropping session");
                self.disconnect_session(subscriber_id, session_id);
                Err(err)
            }
        }
    }

    pub async fn send_message(&self, subscriber_id: SubscriberId, message: &ServerMessage) -> Result<bool> {
        let payload = message.to_json()?;
        self.send_to_one(subscriber_id, &payload).await
    }

    /// Deliver to every subscriber of `symbol` concurrently. Failed sessions
    /// are disconnected after the fan-out.
    pub async fn broadcast(&self, symbol: &str, payload: &str) -> BroadcastReport {
        let symbol = normalize_symbol(symbol);
        let targets: Vec<(SubscriberId, u64, Arc<dyn Transport>)> = {
            let state = self.state.lock();
            match state.index.get(&symbol) {
                Some(subscribers) => subscribers
                    .iter()
                    .filter_map(|id| {
                        state
                            .sessions
                            .get(id)
                            .filter(|session| session.state == SessionState::Active)
                            .map(|session| (*id, session.session_id, session.transport.clone()))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        let results = join_all(targets.iter().map(|(id, session_id, transport)| async move {
            (*id, *session_id, self.deliver(*id, transport.as_ref(), payload).await)
        }))
        .await;

        let mut report = BroadcastReport::default();
        for (subscriber_id, session_id, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    warn!(subscriber_id, %symbol, error = %err, "broadcast delivery failed, dropping session");
                    self.disconnect_session(subscriber_id, session_id);
                    report.failed.push(subscriber_id);
                }
            }
        }
        report
    }

    pub fn is_connected(&self, subscriber_id: SubscriberId) -> bool {
        self.state.lock().sessions.contains_key(&subscriber_id)
    }

    pub fn session(&self, subscriber_id: SubscriberId) -> Option<SessionInfo> {
        let state = self.state.lock();
        state.sessions.get(&subscriber_id).map(|s| SessionInfo::of(subscriber_id, s))
    }

    /// Symbols with at least one subscriber, sorted.
    pub fn active_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.state.lock().index.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    pub fn subscribers_of(&self, symbol: &str) -> Vec<SubscriberId> {
        let state = self.state.lock();
        let mut ids: Vec<SubscriberId> = state
            .index
            .get(&normalize_symbol(symbol))
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            total_connections: state.sessions.len(),
            total_subscriptions: state.sessions.values().map(|s| s.subscriptions.len()).sum(),
            active_symbols: state.index.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reconnect_replaces_session() {
        let registry = ConnectionRegistry::new(Arc::new(NotificationThrottle::new()));
        let (first, _rx1) = ChannelTransport::pair(1);
        let (second, _rx2) = ChannelTransport::pair(1);

        let old = registry.connect(1, first).await.unwrap();
        assert!(registry.subscribe(1, "btc"));

        let new = registry.connect(1, second).await.unwrap();
        assert_ne!(old.session_id, new.session_id);
        assert!(new.subscriptions.is_empty());
        assert!(registry.active_symbols().is_empty());

        // Late close of the old socket must leave the new session alone.
        assert!(registry.disconnect_session(1, old.session_id).is_none());
        assert!(registry.is_connected(1));
    }
}
