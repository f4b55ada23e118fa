//! Push channel for task status and progress events.
//!
//! One broadcast channel per task id; publishers never block on
//! subscribers. A subscriber that falls behind by more than the queue
//! capacity loses the oldest events and receives a `backpressure` marker in
//! their place. Late subscribers get the current status as their first
//! event (snapshot-on-subscribe, done by the boundary handler).

use crate::store::status::TaskStatus;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Event types delivered to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Status,
    Progress,
    ResynthesizeComplete,
    RegenerateComplete,
    Error,
    Backpressure,
}

/// One event on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub task_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(task_id: &str, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            task_id: task_id.to_string(),
            kind,
            timestamp: chrono::Local::now().to_rfc3339(),
            payload,
        }
    }

    pub fn status(status: &TaskStatus) -> Self {
        Self::new(
            &status.id,
            EventKind::Status,
            serde_json::to_value(status).unwrap_or(serde_json::Value::Null),
        )
    }

    pub fn progress(status: &TaskStatus) -> Self {
        Self::new(
            &status.id,
            EventKind::Progress,
            json!({
                "current_step": status.current_step,
                "step_name": status.step_name,
                "progress": status.progress,
                "message": status.message,
                "current_segment": status.current_segment,
                "total_segments": status.total_segments,
            }),
        )
    }

    pub fn error(task_id: &str, kind: &str, message: &str) -> Self {
        Self::new(
            task_id,
            EventKind::Error,
            json!({ "kind": kind, "message": message }),
        )
    }

    fn backpressure(task_id: &str, dropped: u64) -> Self {
        Self::new(
            task_id,
            EventKind::Backpressure,
            json!({ "dropped": dropped }),
        )
    }
}

/// Fan-out bus keyed by task id.
pub struct EventBus {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<EventEnvelope>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Publish without blocking; events for tasks nobody watches are
    /// dropped.
    pub fn publish(&self, event: EventEnvelope) {
        let sender = self.sender(&event.task_id);
        // Ignore send errors (no subscribers = ok)
        let _ = sender.send(event);
    }

    /// Subscribe to one task's events.
    pub fn subscribe(&self, task_id: &str) -> EventStream {
        EventStream {
            task_id: task_id.to_string(),
            rx: self.sender(task_id).subscribe(),
        }
    }

    fn sender(&self, task_id: &str) -> broadcast::Sender<EventEnvelope> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(task_id.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

/// A single subscriber's view of one task's events, in publish order.
pub struct EventStream {
    task_id: String,
    rx: broadcast::Receiver<EventEnvelope>,
}

impl EventStream {
    /// Next event; a lagged queue yields a `backpressure` marker, a closed
    /// channel yields `None`.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        match self.rx.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                Some(EventEnvelope::backpressure(&self.task_id, n))
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Non-async variant used by synchronous tests and drains.
    pub fn try_next(&mut self) -> Option<EventEnvelope> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(n)) => {
                Some(EventEnvelope::backpressure(&self.task_id, n))
            }
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(task: &str, n: u64) -> EventEnvelope {
        EventEnvelope::new(task, EventKind::Progress, json!({ "n": n }))
    }

    #[test]
    fn test_publish_without_subscribers_does_not_block() {
        let bus = EventBus::new(4);
        for i in 0..100 {
            bus.publish(envelope("t1", i));
        }
    }

    #[test]
    fn test_subscriber_receives_in_order() {
        let bus = EventBus::new(16);
        let mut stream = bus.subscribe("t1");
        for i in 0..5 {
            bus.publish(envelope("t1", i));
        }
        for i in 0..5 {
            let event = stream.try_next().unwrap();
            assert_eq!(event.payload["n"], i);
        }
        assert!(stream.try_next().is_none());
    }

    #[test]
    fn test_tasks_are_isolated() {
        let bus = EventBus::new(16);
        let mut stream_a = bus.subscribe("a");
        let mut stream_b = bus.subscribe("b");
        bus.publish(envelope("a", 1));

        assert!(stream_a.try_next().is_some());
        assert!(stream_b.try_next().is_none());
    }

    #[test]
    fn test_multiple_subscribers_fan_out() {
        let bus = EventBus::new(16);
        let mut s1 = bus.subscribe("t");
        let mut s2 = bus.subscribe("t");
        bus.publish(envelope("t", 7));

        assert_eq!(s1.try_next().unwrap().payload["n"], 7);
        assert_eq!(s2.try_next().unwrap().payload["n"], 7);
    }

    #[test]
    fn test_lagged_subscriber_gets_backpressure_marker() {
        let bus = EventBus::new(4);
        let mut stream = bus.subscribe("t");
        for i in 0..10 {
            bus.publish(envelope("t", i));
        }
        let first = stream.try_next().unwrap();
        assert_eq!(first.kind, EventKind::Backpressure);
        assert!(first.payload["dropped"].as_u64().unwrap() > 0);
        // The newest events survive the drop-oldest policy.
        let mut seen = Vec::new();
        while let Some(e) = stream.try_next() {
            seen.push(e.payload["n"].as_u64().unwrap());
        }
        assert_eq!(seen.last(), Some(&9));
    }

    #[tokio::test]
    async fn test_async_next() {
        let bus = EventBus::new(8);
        let mut stream = bus.subscribe("t");
        bus.publish(envelope("t", 42));
        let event = stream.next().await.unwrap();
        assert_eq!(event.payload["n"], 42);
    }

    #[test]
    fn test_envelope_json_uses_type_field() {
        let event = EventEnvelope::new("t", EventKind::ResynthesizeComplete, json!({}));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"resynthesize_complete\""));
    }
}
