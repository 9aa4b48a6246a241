//! Typed publish/subscribe fan-out.
//!
//! The bus decouples the realtime channel and the request executor from
//! their consumers: publishers never know who is listening. The event set
//! is closed; payload shapes are fixed per event.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::session::UserProfile;

/// Names consumers can subscribe to.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum EventKind {
    AuthChange,
    SocketChange,
    BotDetection,
    DashboardUpdate,
    SystemAlert,
    LogEntry,
    HeartbeatAck,
    ConnectionCount,
}

/// Authentication state changed (login, logout, session expiry).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthChange {
    pub authenticated: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<UserProfile>,
}

/// Realtime channel connectivity changed.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SocketChange {
    pub connected: bool,
}

/// A bot was detected by the honeypot.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct BotDetection {
    pub data: Value,
}

/// Aggregate dashboard data changed server-side.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct DashboardUpdate {
    pub data: Value,
}

/// Operator-facing system alert.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SystemAlert {
    pub data: Value,
}

/// New entry appended to the system log stream.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub data: Value,
}

/// Server acknowledged a heartbeat ping.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub timestamp: String,
}

/// Connected-client census broadcast by the server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionCount {
    pub connected_clients: u64,
    pub timestamp: String,
}

/// One published event with its payload.
#[derive(Clone, Debug, PartialEq)]
pub enum BusEvent {
    AuthChange(AuthChange),
    SocketChange(SocketChange),
    BotDetection(BotDetection),
    DashboardUpdate(DashboardUpdate),
    SystemAlert(SystemAlert),
    LogEntry(LogEntry),
    HeartbeatAck(HeartbeatAck),
    ConnectionCount(ConnectionCount),
}

impl BusEvent {
    /// The name this event is delivered under.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::AuthChange(_) => EventKind::AuthChange,
            Self::SocketChange(_) => EventKind::SocketChange,
            Self::BotDetection(_) => EventKind::BotDetection,
            Self::DashboardUpdate(_) => EventKind::DashboardUpdate,
            Self::SystemAlert(_) => EventKind::SystemAlert,
            Self::LogEntry(_) => EventKind::LogEntry,
            Self::HeartbeatAck(_) => EventKind::HeartbeatAck,
            Self::ConnectionCount(_) => EventKind::ConnectionCount,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`], used to unsubscribe.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&BusEvent) + Send + Sync>;

/// Process-lifetime subscription registry.
///
/// Delivery is synchronous and in registration order. A handler that panics
/// is isolated and logged; later handlers still run. Registering the same
/// closure twice delivers twice, once per registration.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for `kind` and returns its subscription handle.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&BusEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers
                .entry(kind)
                .or_default()
                .push((id, Arc::new(handler)));
        }
        id
    }

    /// Removes a registration. Unknown ids are a silent no-op.
    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            if let Some(entries) = subscribers.get_mut(&kind) {
                entries.retain(|(entry_id, _)| *entry_id != id);
            }
        }
    }

    /// Delivers `event` to every handler registered for its kind.
    pub fn publish(&self, event: BusEvent) {
        let handlers: Vec<Handler> = match self.subscribers.lock() {
            Ok(subscribers) => subscribers
                .get(&event.kind())
                .map(|entries| entries.iter().map(|(_, handler)| Arc::clone(handler)).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        for handler in handlers {
            // One failing subscriber must not starve the rest.
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                warn!(event = "subscriber_panicked", kind = ?event.kind());
            }
        }
    }

    /// Drops every registration. Used at facade teardown.
    pub fn clear(&self) {
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.clear();
        }
    }
}
