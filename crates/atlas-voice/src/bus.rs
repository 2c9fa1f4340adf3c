//! In-process publish/subscribe bus.
//!
//! Handlers run synchronously on the publisher's thread, in registration
//! order. A failing or panicking handler is logged and skipped; the rest of the
//! list still runs.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::worker::panic_message;

/// Well-known topic names.
pub mod topics {
    pub const HEARTBEAT: &str = "heartbeat";
    pub const SPEECH_STARTED: &str = "speech_started";
    pub const TURN_INTERRUPTED: &str = "turn_interrupted";
    pub const HIGH_SALIENCE_EVENT: &str = "high_salience_event";
    pub const USER_STATE_UPDATED: &str = "user_state_updated";
    pub const HABIT_TRIGGERED: &str = "habit_triggered";
    pub const LEARN_NEW_HABIT: &str = "learn_new_habit";
    pub const HIGH_RESOURCE_WARNING: &str = "high_resource_warning";
    pub const REWARD_APPLIED: &str = "reward_applied";

    /// Intents that count as the user actively engaging.
    pub const REACTIVE_INTENTS: [&str; 5] = ["CHAT", "COMMAND", "QUERY", "MEMORY", "IMAGINE"];

    /// `intent_<NAME>` topic for a routed intent.
    pub fn intent_topic(name: &str) -> String {
        format!("intent_{}", name)
    }
}

/// A published message.
#[derive(Debug, Clone)]
pub struct Event {
    pub topic: String,
    pub payload: Value,
}

/// Subscriber callback.
pub type Handler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. Handlers are never removed.
    pub fn subscribe<F>(&self, topic: &str, handler: F)
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribers
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(Arc::new(handler));
        debug!(topic, "subscriber registered");
    }

    /// Deliver `payload` to every handler of `topic`.
    ///
    /// The handler list is snapshotted first, so a handler may subscribe or
    /// publish re-entrantly.
    pub fn publish(&self, topic: &str, payload: Value) {
        let handlers: Vec<Handler> = match self.subscribers.read().get(topic) {
            Some(list) if !list.is_empty() => list.clone(),
            _ => return,
        };

        let event = Event {
            topic: topic.to_string(),
            payload,
        };

        for handler in handlers {
            match panic::catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(topic, error = %e, "event handler failed"),
                Err(payload) => error!(topic, panic = %panic_message(&payload), "event handler panicked"),
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.subscribers.read().get(topic).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let topics: Vec<String> = self.subscribers.read().keys().cloned().collect();
        f.debug_struct("EventBus").field("topics", &topics).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn publish_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("nobody_listens", json!({"x": 1}));
        assert_eq!(bus.subscriber_count("nobody_listens"), 0);
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let seen = seen.clone();
            bus.subscribe("t", move |_| {
                seen.lock().push(i);
                Ok(())
            });
        }
        bus.publish("t", Value::Null);
        assert_eq!(*seen.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn failing_and_panicking_handlers_are_isolated() {
        let bus = EventBus::new();
        let hits = Arc::new(Mutex::new(0));
        bus.subscribe("t", |_| Err(anyhow::anyhow!("nope")));
        bus.subscribe("t", |_| panic!("handler blew up"));
        let h = hits.clone();
        bus.subscribe("t", move |e| {
            assert_eq!(e.payload, json!("hello"));
            *h.lock() += 1;
            Ok(())
        });
        bus.publish("t", json!("hello"));
        bus.publish("t", json!("hello"));
        assert_eq!(*hits.lock(), 2);
    }

    #[test]
    fn handler_may_subscribe_reentrantly() {
        let bus = Arc::new(EventBus::new());
        let inner = bus.clone();
        bus.subscribe("outer", move |_| {
            inner.subscribe("late", |_| Ok(()));
            Ok(())
        });
        bus.publish("outer", Value::Null);
        assert_eq!(bus.subscriber_count("late"), 1);
    }

    #[test]
    fn intent_topic_format() {
        assert_eq!(topics::intent_topic("CHAT"), "intent_CHAT");
    }
}
