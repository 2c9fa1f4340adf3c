//! Periodic liveness pulse.

use crate::bus::{topics, EventBus};
use crate::error::VoiceResult;
use crate::signal::ShutdownSignal;
use crate::worker::{self, LoopControl};
use serde_json::json;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info};

/// Publishes `heartbeat` with the current unix time every `interval`.
pub struct HeartbeatEmitter {
    bus: Arc<EventBus>,
    interval: Duration,
}

impl HeartbeatEmitter {
    pub fn new(bus: Arc<EventBus>, interval: Duration) -> Self {
        Self { bus, interval }
    }

    /// Publish a single pulse.
    pub fn beat(&self) {
        let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
        debug!(timestamp = now, "heartbeat");
        self.bus.publish(topics::HEARTBEAT, json!(now));
    }

    /// Run on a dedicated thread until shutdown.
    pub fn spawn(self, shutdown: ShutdownSignal) -> VoiceResult<JoinHandle<()>> {
        info!(interval_secs = self.interval.as_secs(), "heartbeat started");
        worker::spawn_named("atlas-heartbeat", move || {
            let guard = shutdown.clone();
            worker::run_guarded("heartbeat", &guard, worker::DEFAULT_BACKOFF, || {
                if shutdown.wait_for(self.interval) {
                    return Ok(LoopControl::Stop);
                }
                self.beat();
                Ok(LoopControl::Continue)
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;
    use parking_lot::Mutex;

    #[test]
    fn emits_until_shutdown() {
        let bus = Arc::new(EventBus::new());
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let s = stamps.clone();
        bus.subscribe(topics::HEARTBEAT, move |e| {
            s.lock().push(e.payload.as_f64().unwrap_or_default());
            Ok(())
        });

        let shutdown = Signal::new();
        let handle = HeartbeatEmitter::new(bus, Duration::from_millis(10))
            .spawn(shutdown.clone())
            .unwrap();
        std::thread::sleep(Duration::from_millis(80));
        shutdown.raise();
        handle.join().unwrap();

        let stamps = stamps.lock();
        assert!(stamps.len() >= 2, "got {} beats", stamps.len());
        assert!(stamps.iter().all(|t| *t > 1_600_000_000.0));
    }
}
