//! RealtimeHub - WebSocket Distribution
//!
//! ## Responsibilities
//!
//! - Broadcast crossing events, periodic stats and analytics snapshots to
//!   every subscribed dashboard
//! - Per-subscriber bounded buffering: a slow subscriber loses its oldest
//!   pending messages (head-drop) and is told so; producers never block
//! - Connection accounting
//!
//! Built on `tokio::sync::broadcast`: each receiver owns a cursor into a
//! bounded ring, so one lagging WebSocket cannot back-pressure the CV
//! worker or other subscribers. Messages arrive in publication order.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::analytics::AnalyticsSnapshot;
use crate::counting::CounterStats;
use crate::event_store::CrossingEvent;

/// Per-subscriber buffer depth before head-drop kicks in.
const SUBSCRIBER_BUFFER: usize = 256;

/// Wire format: `{"type": ..., "data": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "lowercase")]
pub enum HubMessage {
    /// A newly stored crossing event.
    Event(CrossingEvent),
    /// Live counter snapshot, published every couple of seconds.
    Stats(StatsMessage),
    /// Precomputed analytics, published on a slower cadence.
    Analytics(AnalyticsSnapshot),
    /// Human-readable notices (resets, reconfigurations, overflow).
    Status(StatusMessage),
}

/// Live counters plus worker health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsMessage {
    pub in_count: u64,
    pub out_count: u64,
    pub active_tracks: usize,
    pub camera_status: String,
    pub fps: f64,
}

impl StatsMessage {
    pub fn new(stats: CounterStats, camera_status: &str, fps: f64) -> Self {
        Self {
            in_count: stats.in_count,
            out_count: stats.out_count,
            active_tracks: stats.active_tracks,
            camera_status: camera_status.to_string(),
            fps,
        }
    }
}

/// Short status notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overflowed: Option<bool>,
}

impl StatusMessage {
    pub fn notice(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            overflowed: None,
        }
    }

    pub fn overflow(dropped: u64) -> Self {
        Self {
            message: format!("subscriber lagged, {dropped} messages dropped"),
            overflowed: Some(true),
        }
    }
}

/// A subscription handle for one WebSocket client.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: broadcast::Receiver<HubMessage>,
}

/// RealtimeHub instance.
pub struct RealtimeHub {
    sender: broadcast::Sender<HubMessage>,
    connection_count: AtomicU64,
}

impl RealtimeHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(SUBSCRIBER_BUFFER);
        Self {
            sender,
            connection_count: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let id = Uuid::new_v4();
        self.connection_count.fetch_add(1, Ordering::Relaxed);
        tracing::info!(connection_id = %id, "Subscriber connected");
        Subscription {
            id,
            receiver: self.sender.subscribe(),
        }
    }

    /// Note a subscriber going away.
    pub fn unsubscribe(&self, id: &Uuid) {
        self.connection_count.fetch_sub(1, Ordering::Relaxed);
        tracing::info!(connection_id = %id, "Subscriber disconnected");
    }

    /// Publish to all subscribers. Never blocks; with no subscribers the
    /// message is dropped.
    pub fn publish(&self, message: HubMessage) {
        match self.sender.send(message) {
            Ok(receivers) => {
                tracing::trace!(receivers = receivers, "Hub message published");
            }
            Err(_) => {
                tracing::trace!("Hub message dropped, no subscribers");
            }
        }
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count.load(Ordering::Relaxed)
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counting::Direction;
    use chrono::Utc;

    fn event(id: i64) -> HubMessage {
        HubMessage::Event(CrossingEvent {
            id,
            timestamp: Utc::now(),
            track_id: 1,
            person_id: None,
            direction: Direction::In,
        })
    }

    #[tokio::test]
    async fn subscribers_receive_in_publication_order() {
        let hub = RealtimeHub::new();
        let mut sub = hub.subscribe();

        hub.publish(event(1));
        hub.publish(event(2));

        for expected in [1, 2] {
            match sub.receiver.recv().await.unwrap() {
                HubMessage::Event(e) => assert_eq!(e.id, expected),
                other => panic!("unexpected message {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_only() {
        let hub = RealtimeHub::new();
        let mut slow = hub.subscribe();

        for i in 0..(SUBSCRIBER_BUFFER as i64 + 10) {
            hub.publish(event(i));
        }

        // The ring overflowed: the receiver reports the lag once, then
        // resumes at the oldest retained message.
        match slow.receiver.recv().await {
            Err(broadcast::error::RecvError::Lagged(n)) => assert_eq!(n, 10),
            other => panic!("expected lag, got {other:?}"),
        }
        match slow.receiver.recv().await.unwrap() {
            HubMessage::Event(e) => assert_eq!(e.id, 10),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_block() {
        let hub = RealtimeHub::new();
        hub.publish(event(1));
        assert_eq!(hub.connection_count(), 0);
    }

    #[test]
    fn wire_format_uses_type_and_data_fields() {
        let msg = HubMessage::Status(StatusMessage::notice("Counters reset"));
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["data"]["message"], "Counters reset");
        assert!(json["data"].get("overflowed").is_none());
    }
}
