//! User-keyed event bus.
//!
//! Breaks the Dot ↔ pipeline cycle: the pipeline publishes completion events
//! here; Dot subscribes when it dispatches and unsubscribes after delivery or
//! timeout. Nothing holds a reference across the seam.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity per user channel. Old events drop when a subscriber lags.
const CHANNEL_CAP: usize = 64;

/// Events published across component seams.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A dispatched pipeline finished (or crashed).
    PipelineComplete {
        agent_id: String,
        user_id: String,
        success: bool,
        summary: String,
        workspace_path: String,
    },
    /// A follow-up message is ready for transport delivery.
    DispatchFollowup {
        user_id: String,
        message_id: String,
        agent_id: String,
        success: bool,
        response: String,
        workspace_path: String,
    },
    /// Free-form notification (scheduler missed-task prompts, update notices).
    Notification { user_id: String, kind: String, payload: Value },
}

impl BusEvent {
    pub fn user_id(&self) -> &str {
        match self {
            BusEvent::PipelineComplete { user_id, .. } => user_id,
            BusEvent::DispatchFollowup { user_id, .. } => user_id,
            BusEvent::Notification { user_id, .. } => user_id,
        }
    }
}

/// Broadcast channels keyed by user id, created lazily.
pub struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<BusEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish to the event's user channel. Events for users with no
    /// subscriber are dropped silently — that is broadcast semantics, not an
    /// error.
    pub fn publish(&self, event: BusEvent) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let sender = channels
            .entry(event.user_id().to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAP).0);
        let receivers = sender.receiver_count();
        if sender.send(event).is_err() {
            debug!(receivers, "bus event dropped (no subscribers)");
        }
    }

    pub fn subscribe(&self, user_id: &str) -> broadcast::Receiver<BusEvent> {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(user_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAP).0)
            .subscribe()
    }

    /// Drop channels that have no live subscribers.
    pub fn sweep(&self) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|_, sender| sender.receiver_count() > 0);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn events_reach_only_their_users_subscribers() {
        let bus = EventBus::new();
        let mut alice = bus.subscribe("alice");
        let mut bob = bus.subscribe("bob");

        bus.publish(BusEvent::Notification {
            user_id: "alice".to_string(),
            kind: "test".to_string(),
            payload: json!({}),
        });

        let event = alice.recv().await.unwrap();
        assert_eq!(event.user_id(), "alice");
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish(BusEvent::Notification {
            user_id: "ghost".to_string(),
            kind: "test".to_string(),
            payload: json!({}),
        });
        // A later subscriber does not see the earlier event.
        let mut rx = bus.subscribe("ghost");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_drops_dead_channels() {
        let bus = EventBus::new();
        {
            let _rx = bus.subscribe("temp");
        }
        bus.sweep();
        assert!(bus.channels.lock().unwrap().is_empty());
    }
}
