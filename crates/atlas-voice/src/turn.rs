//! Turn arbitration: who may drive the speaker right now.
//!
//! A single [`TurnArbiter`] hands out at most one [`TurnToken`] at a time.
//! Reactive turns (answers to the user) block until the speaker is free and
//! pre-empt a proactive turn in flight. Proactive turns (idle remarks) never
//! wait: if anything holds the speaker they fail with [`TurnBusy`].
//!
//! ```text
//!            acquire(Reactive)              barge_in / explicit_interrupt
//!   Idle ───────────────────────▶ SpeakingReactive ───────────────┐
//!    ▲  ╲   try_acquire(Proactive)                                ▼
//!    │   ╲──────────────────────▶ SpeakingProactive ─────────▶ Interrupted
//!    │                                                            │
//!    └──────────────────────── release ◀──────────────────────────┘
//! ```

use crate::signal::Signal;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Why a turn was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnKind {
    /// Answering the user.
    Reactive,
    /// Speaking unprompted.
    Proactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    SpeakingReactive,
    SpeakingProactive,
    Interrupted,
}

/// Returned when a non-blocking acquire finds the speaker taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("another turn currently holds the speaker")]
pub struct TurnBusy;

/// Per-turn stop request. Set at most once, never reused.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Signal);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this call was the one that set the flag.
    pub fn set(&self) -> bool {
        self.0.raise()
    }

    pub fn is_set(&self) -> bool {
        self.0.is_raised()
    }

    /// Wait up to `timeout`; returns whether the flag is set.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.0.wait_for(timeout)
    }
}

#[derive(Debug)]
struct ActiveTurn {
    id: u64,
    kind: TurnKind,
    flag: CancellationFlag,
}

#[derive(Debug)]
struct Slot {
    state: TurnState,
    active: Option<ActiveTurn>,
}

impl Slot {
    /// Move a speaking turn to `Interrupted` and set its flag.
    fn interrupt(&mut self) -> bool {
        match self.state {
            TurnState::SpeakingReactive | TurnState::SpeakingProactive => {
                if let Some(active) = &self.active {
                    active.flag.set();
                }
                self.state = TurnState::Interrupted;
                true
            }
            TurnState::Idle | TurnState::Interrupted => false,
        }
    }
}

#[derive(Debug)]
pub struct TurnArbiter {
    slot: Mutex<Slot>,
    released: Condvar,
    next_id: AtomicU64,
}

impl Default for TurnArbiter {
    fn default() -> Self {
        Self::new()
    }
}

impl TurnArbiter {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(Slot {
                state: TurnState::Idle,
                active: None,
            }),
            released: Condvar::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Acquire the speaker.
    ///
    /// `Reactive` blocks until the speaker is free, interrupting a proactive
    /// holder first. `Proactive` behaves like [`try_acquire`](Self::try_acquire).
    pub fn acquire(&self, kind: TurnKind) -> Result<TurnToken<'_>, TurnBusy> {
        if kind == TurnKind::Proactive {
            return self.try_acquire(kind);
        }

        let mut slot = self.slot.lock();
        loop {
            let current = &mut *slot;
            match current.active.as_ref().map(|a| a.kind) {
                None => break,
                Some(TurnKind::Proactive) => {
                    if current.interrupt() {
                        info!("reactive turn pre-empting proactive speech");
                    }
                }
                Some(TurnKind::Reactive) => {}
            }
            self.released.wait(&mut slot);
        }
        Ok(self.grant(&mut slot, kind))
    }

    /// Acquire only if the speaker is free right now.
    pub fn try_acquire(&self, kind: TurnKind) -> Result<TurnToken<'_>, TurnBusy> {
        let mut slot = self.slot.lock();
        if slot.active.is_some() {
            debug!(?kind, state = ?slot.state, "turn busy");
            return Err(TurnBusy);
        }
        Ok(self.grant(&mut slot, kind))
    }

    fn grant(&self, slot: &mut Slot, kind: TurnKind) -> TurnToken<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let flag = CancellationFlag::new();
        slot.state = match kind {
            TurnKind::Reactive => TurnState::SpeakingReactive,
            TurnKind::Proactive => TurnState::SpeakingProactive,
        };
        slot.active = Some(ActiveTurn {
            id,
            kind,
            flag: flag.clone(),
        });
        debug!(turn_id = id, ?kind, "turn acquired");
        TurnToken {
            id,
            kind,
            flag,
            arbiter: self,
        }
    }

    /// The user started talking over the agent. Returns `true` if a speaking
    /// turn was actually interrupted; repeated calls are no-ops.
    pub fn barge_in(&self) -> bool {
        let interrupted = self.slot.lock().interrupt();
        if interrupted {
            info!("barge-in: current turn interrupted");
        }
        interrupted
    }

    /// Same effect as [`barge_in`](Self::barge_in), triggered by the user
    /// through a non-audio channel.
    pub fn explicit_interrupt(&self) -> bool {
        let interrupted = self.slot.lock().interrupt();
        if interrupted {
            info!("explicit interrupt: current turn interrupted");
        }
        interrupted
    }

    pub fn state(&self) -> TurnState {
        self.slot.lock().state
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().active.is_some()
    }

    fn release_turn(&self, id: u64) {
        let mut slot = self.slot.lock();
        let holder = slot.active.as_ref().map(|a| a.id);
        if holder != Some(id) {
            drop(slot);
            warn!(turn_id = id, ?holder, "release by a token that does not hold the turn");
            debug_assert!(false, "release of turn {} while {:?} holds it", id, holder);
            return;
        }
        let was = slot.state;
        slot.active = None;
        slot.state = TurnState::Idle;
        drop(slot);
        self.released.notify_one();
        debug!(turn_id = id, from = ?was, "turn released");
    }
}

/// Exclusive right to drive the speaker. Released on drop.
#[derive(Debug)]
pub struct TurnToken<'a> {
    id: u64,
    kind: TurnKind,
    flag: CancellationFlag,
    arbiter: &'a TurnArbiter,
}

impl TurnToken<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> TurnKind {
        self.kind
    }

    pub fn flag(&self) -> &CancellationFlag {
        &self.flag
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.is_set()
    }

    /// Give the speaker back. Equivalent to dropping the token.
    pub fn release(self) {}
}

impl Drop for TurnToken<'_> {
    fn drop(&mut self) {
        self.arbiter.release_turn(self.id);
    }
}
