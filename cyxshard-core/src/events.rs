//! Shard event bus
//!
//! Load and health changes are propagated as explicit messages so caches in
//! other processes (or other components of this one) converge. Delivery is
//! at-least-once per subscriber with no ordering guarantee across topics.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// Event topics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    ShardLoad,
    ShardHealth,
    MigrationFailed,
}

impl Topic {
    /// Wire name of the topic
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ShardLoad => "shard:load",
            Topic::ShardHealth => "shard:health",
            Topic::MigrationFailed => "migration:failed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ShardEvent {
    Load {
        shard_id: String,
        load_units: u64,
        item_count: u64,
        at: DateTime<Utc>,
    },
    Health {
        shard_id: String,
        healthy: bool,
        latency_ms: u64,
        error_rate: f64,
        at: DateTime<Utc>,
    },
    MigrationFailed {
        migration_id: String,
        source_shard_id: String,
        target_shard_id: String,
        attempts: u32,
        error: String,
    },
}

impl ShardEvent {
    /// Topic this event is published on
    pub fn topic(&self) -> Topic {
        match self {
            ShardEvent::Load { .. } => Topic::ShardLoad,
            ShardEvent::Health { .. } => Topic::ShardHealth,
            ShardEvent::MigrationFailed { .. } => Topic::MigrationFailed,
        }
    }

    /// Encode for a networked transport
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from a networked transport
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Publish/subscribe transport
pub trait EventBus: Send + Sync {
    /// Publish an event to every subscriber of its topic
    fn publish(&self, event: ShardEvent);

    /// Subscribe to a topic; subscribing again with the same handler id
    /// replaces the previous subscription
    fn subscribe(&self, topic: Topic, handler_id: &str) -> mpsc::UnboundedReceiver<ShardEvent>;

    /// Drop a subscription
    fn unsubscribe(&self, topic: Topic, handler_id: &str);
}

/// In-process event bus
#[derive(Default)]
pub struct LocalEventBus {
    subscribers: RwLock<HashMap<Topic, HashMap<String, mpsc::UnboundedSender<ShardEvent>>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscribers on a topic
    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.subscribers
            .read()
            .get(&topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}

impl EventBus for LocalEventBus {
    fn publish(&self, event: ShardEvent) {
        let topic = event.topic();
        let mut closed = Vec::new();

        {
            let subscribers = self.subscribers.read();
            let Some(subs) = subscribers.get(&topic) else {
                return;
            };
            for (handler_id, tx) in subs {
                if tx.send(event.clone()).is_err() {
                    closed.push(handler_id.clone());
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self.subscribers.write();
            if let Some(subs) = subscribers.get_mut(&topic) {
                for handler_id in &closed {
                    subs.remove(handler_id);
                }
            }
            debug!(topic = %topic, dropped = closed.len(), "Removed closed subscribers");
        }
    }

    fn subscribe(&self, topic: Topic, handler_id: &str) -> mpsc::UnboundedReceiver<ShardEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .write()
            .entry(topic)
            .or_default()
            .insert(handler_id.to_string(), tx);
        debug!(topic = %topic, handler_id = %handler_id, "Subscribed");
        rx
    }

    fn unsubscribe(&self, topic: Topic, handler_id: &str) {
        if let Some(subs) = self.subscribers.write().get_mut(&topic) {
            subs.remove(handler_id);
        }
    }
}
