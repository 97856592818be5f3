//! Events derived by the reconciliation engine and their translation into
//! deliverable notifications.
//!
//! The notifier is pure: it turns one event into one formatted message for
//! one audience. Delivery (chat, logs, whatever the operator wires up) is
//! the sink's concern; nothing here retries or buffers for redelivery.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A derived change observed during one reconciliation cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    NewNode {
        summary: String,
    },
    NewGateway {
        summary: String,
    },
    /// Online flag flipped.
    Presence {
        name: String,
        online: bool,
    },
    /// Both old and new coordinates were fully known.
    Moved {
        name: String,
        node_id: Option<String>,
        meters: f64,
    },
    /// Only the new coordinate pair is fully known.
    PositionAcquired {
        name: String,
        node_id: Option<String>,
    },
    /// Only the old coordinate pair was fully known.
    PositionLost {
        name: String,
    },
    FieldChanged {
        name: String,
        field: &'static str,
        old: String,
        new: String,
    },
    NewHighscore {
        metric: String,
        value: i64,
    },
    FeedFailure {
        feed: String,
        message: String,
    },
    FeedRecovered {
        feed: String,
    },
}

/// Where a notification goes: the general channel gets arrivals and
/// records, the change-announcement target gets the noisy per-field churn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Channel,
    ChangeTarget,
}

/// One formatted, deliverable message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub audience: Audience,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Translates events into user-facing notifications.
pub struct Notifier {
    /// Optional map link template with an `{id}` placeholder.
    map_uri: Option<String>,
}

impl Notifier {
    pub fn new(map_uri: Option<String>) -> Self {
        Self { map_uri }
    }

    fn map_link(&self, node_id: &Option<String>) -> Option<String> {
        match (&self.map_uri, node_id) {
            (Some(uri), Some(id)) => Some(uri.replace("{id}", id)),
            _ => None,
        }
    }

    pub fn render(&self, event: &Event) -> Notification {
        let (audience, text) = match event {
            Event::NewNode { summary } => {
                (Audience::Channel, format!("New node: {}", summary))
            }
            Event::NewGateway { summary } => {
                (Audience::Channel, format!("New gateway: {}", summary))
            }
            Event::Presence { name, online } => (
                Audience::ChangeTarget,
                format!(
                    "Node {} is now {}",
                    name,
                    if *online { "online" } else { "offline" }
                ),
            ),
            Event::Moved {
                name,
                node_id,
                meters,
            } => {
                let mut text = format!("Node {} moved {:.0} meters", name, meters);
                if let Some(link) = self.map_link(node_id) {
                    text.push_str(&format!(": {}", link));
                }
                (Audience::ChangeTarget, text)
            }
            Event::PositionAcquired { name, node_id } => {
                let mut text = format!("Node {} now has a position", name);
                if let Some(link) = self.map_link(node_id) {
                    text.push_str(&format!(": {}", link));
                }
                (Audience::ChangeTarget, text)
            }
            Event::PositionLost { name } => (
                Audience::ChangeTarget,
                format!("Node {} no longer has a position", name),
            ),
            Event::FieldChanged {
                name,
                field,
                old,
                new,
            } => (
                Audience::ChangeTarget,
                format!("Node {} changed {} from {} to {}", name, field, old, new),
            ),
            Event::NewHighscore { metric, value } => (
                Audience::Channel,
                format!("New highscore: {} {}", value, capitalize(metric)),
            ),
            Event::FeedFailure { feed, message } => (
                Audience::ChangeTarget,
                format!("[ERROR] {}: {}", feed, message),
            ),
            Event::FeedRecovered { feed } => (
                Audience::ChangeTarget,
                format!("{}: everything back to normal", feed),
            ),
        };
        Notification {
            audience,
            text,
            at: Utc::now(),
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Consumes notifications in emission order.
pub trait EventSink: Send + Sync {
    fn deliver(&self, notification: &Notification);
}

/// Daemon sink: logs every notification and keeps the most recent ones in
/// a bounded buffer for the read-only events endpoint.
pub struct EventBuffer {
    capacity: usize,
    inner: Mutex<VecDeque<Notification>>,
}

impl EventBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Most recent notifications, oldest first.
    pub fn recent(&self) -> Vec<Notification> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.iter().cloned().collect()
    }
}

impl EventSink for EventBuffer {
    fn deliver(&self, notification: &Notification) {
        tracing::info!(
            audience = ?notification.audience,
            text = %notification.text,
            "notification"
        );
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.len() == self.capacity {
            inner.pop_front();
        }
        inner.push_back(notification.clone());
    }
}
