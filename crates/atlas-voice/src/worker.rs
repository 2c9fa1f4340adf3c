//! Supervision for long-lived background loops.
//!
//! Capture, transcription, heartbeat and idle loops must never take the process
//! down. Each iteration runs under `catch_unwind`; an `Err` or a panic is logged
//! and followed by a short backoff so a persistent fault cannot hot-loop.

use crate::error::{VoiceError, VoiceResult};
use crate::signal::ShutdownSignal;
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Default pause after a failed iteration.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(250);

/// What the loop body wants to happen next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    Stop,
}

/// Run `body` until it returns `Stop` or `shutdown` is raised.
pub fn run_guarded<F>(name: &str, shutdown: &ShutdownSignal, backoff: Duration, mut body: F)
where
    F: FnMut() -> VoiceResult<LoopControl>,
{
    debug!(worker = name, "loop started");
    while !shutdown.is_raised() {
        match panic::catch_unwind(AssertUnwindSafe(&mut body)) {
            Ok(Ok(LoopControl::Continue)) => {}
            Ok(Ok(LoopControl::Stop)) => break,
            Ok(Err(e)) => {
                warn!(worker = name, error = %e, "iteration failed; backing off");
                if shutdown.wait_for(backoff) {
                    break;
                }
            }
            Err(payload) => {
                error!(worker = name, panic = %panic_message(&payload), "iteration panicked; backing off");
                if shutdown.wait_for(backoff) {
                    break;
                }
            }
        }
    }
    debug!(worker = name, "loop exited");
}

/// Spawn a named OS thread.
pub fn spawn_named<F>(name: &str, f: F) -> VoiceResult<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| VoiceError::Worker(format!("failed to spawn {}: {}", name, e)))
}

pub(crate) fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Signal;

    #[test]
    fn survives_errors_and_panics() {
        let shutdown = Signal::new();
        let mut calls = 0;
        run_guarded("test", &shutdown, Duration::from_millis(1), || {
            calls += 1;
            match calls {
                1 => Err(VoiceError::Worker("boom".into())),
                2 => panic!("kaboom"),
                3 => Ok(LoopControl::Continue),
                _ => Ok(LoopControl::Stop),
            }
        });
        assert_eq!(calls, 4);
    }

    #[test]
    fn exits_when_shutdown_raised() {
        let shutdown = Signal::new();
        shutdown.raise();
        let mut calls = 0;
        run_guarded("test", &shutdown, DEFAULT_BACKOFF, || {
            calls += 1;
            Ok(LoopControl::Continue)
        });
        assert_eq!(calls, 0);
    }
}
