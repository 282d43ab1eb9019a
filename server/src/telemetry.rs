//! Telemetry Bus (spec.md §4.8): fan-out channel delivering status/events
//! to all connected operator UIs over `/ws/observation`.
//!
//! Grounded in the teacher's WebSocket fan-out (`cedar_server.rs`'s
//! `ws_manager`-equivalent) but re-expressed per §9's redesign note as a
//! typed channel with a single hand-off point rather than a dynamically
//! injected callback: `tokio::sync::broadcast` is the channel, and
//! `broadcast_sync` is the one thread-safe entry point worker threads use
//! to post onto it without needing a handle to the async runtime's
//! reactor.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

pub const KEEPALIVE_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub sender: Sender,
    pub message: String,
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sender {
    Scheduler,
    DarkManager,
    Focuser,
    System,
}

/// A broadcaster: every subscriber gets every message sent after it
/// subscribed. Backed by `tokio::sync::broadcast`, which already drops a
/// subscriber's queue (and hence the subscriber, from the sender's point
/// of view, on next send) once it falls too far behind — the behavior
/// §4.8 describes as "failed send removes the subscriber".
pub struct TelemetryBus {
    sender: broadcast::Sender<Event>,
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        TelemetryBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Callable from any thread, sync or async: posts onto the broadcast
    /// channel, which is itself lock-free and thread-safe, so no explicit
    /// hop onto the HTTP server's event loop is needed the way the
    /// teacher's gRPC-streaming design required.
    pub fn broadcast_sync(&self, sender: Sender, message: &str, data: Option<Value>) {
        let event = Event { sender, message: message.to_string(), data, timestamp: Utc::now() };
        // No subscribers is not an error: the bus is useful even with the
        // UI disconnected (history/telemetry still accrue elsewhere).
        let _ = self.sender.send(event);
    }

    pub fn status(&self, sender: Sender, status: &str) {
        self.broadcast_sync(sender, "STATUS", Some(serde_json::json!({ "status": status })));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_reaches_all_subscribers() {
        let bus = TelemetryBus::new();
        let mut r1 = bus.subscribe();
        let mut r2 = bus.subscribe();
        bus.status(Sender::Scheduler, "slewing");
        let e1 = r1.try_recv().unwrap();
        let e2 = r2.try_recv().unwrap();
        assert_eq!(e1.message, "STATUS");
        assert_eq!(e2.sender, Sender::Scheduler);
    }

    #[test]
    fn test_broadcast_with_no_subscribers_does_not_panic() {
        let bus = TelemetryBus::new();
        bus.broadcast_sync(Sender::System, "ping", None);
    }
}
