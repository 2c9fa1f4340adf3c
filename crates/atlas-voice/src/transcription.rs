//! Bounded transcription pool.
//!
//! The capture loop hands finished utterances here and goes straight back to
//! the microphone. A fixed set of workers runs STT and the hallucination
//! filters; accepted text is forwarded to the dialogue loop. When more than
//! `max_in_flight` utterances are pending the newest one is dropped.

use crate::error::VoiceResult;
use crate::filter::{TranscriptFilter, Verdict};
use crate::segmenter::Utterance;
use crate::signal::ShutdownSignal;
use crate::stt::SttBackend;
use crate::worker::{self, LoopControl};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const RECV_POLL: Duration = Duration::from_millis(200);

/// Decrements the in-flight count when an utterance is done, even on panic.
struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct TranscriptionPool {
    tx: SyncSender<Utterance>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TranscriptionPool {
    pub fn spawn(
        stt: Arc<dyn SttBackend>,
        filter: TranscriptFilter,
        workers: usize,
        max_in_flight: usize,
        out: Sender<String>,
        shutdown: ShutdownSignal,
    ) -> VoiceResult<Self> {
        let max_in_flight = max_in_flight.max(1);
        let (tx, rx) = mpsc::sync_channel::<Utterance>(max_in_flight);
        let rx = Arc::new(Mutex::new(rx));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let filter = Arc::new(filter);

        let mut handles = Vec::with_capacity(workers);
        for i in 0..workers.max(1) {
            let name = format!("atlas-stt-{}", i);
            let rx = rx.clone();
            let stt = stt.clone();
            let filter = filter.clone();
            let out = out.clone();
            let in_flight = in_flight.clone();
            let shutdown = shutdown.clone();
            let label = name.clone();
            handles.push(worker::spawn_named(&name, move || {
                worker::run_guarded(&label, &shutdown, worker::DEFAULT_BACKOFF, || {
                    next_utterance(&rx, &*stt, &filter, &out, &in_flight)
                });
            })?);
        }
        info!(workers = handles.len(), max_in_flight, "transcription pool started");

        Ok(Self {
            tx,
            in_flight,
            max_in_flight,
            workers: Mutex::new(handles),
        })
    }

    /// Queue an utterance without blocking. Returns `false` if it was dropped.
    pub fn submit(&self, utterance: Utterance) -> bool {
        let admitted = self
            .in_flight
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .is_ok();
        if !admitted {
            warn!(
                max_in_flight = self.max_in_flight,
                secs = utterance.duration().as_secs_f32(),
                "transcription backlog full; dropping utterance"
            );
            return false;
        }
        if self.tx.try_send(utterance).is_err() {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            warn!("transcription queue unavailable; dropping utterance");
            return false;
        }
        true
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait for the workers after shutdown has been raised. Each finishes the
    /// utterance it holds first.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn next_utterance(
    rx: &Mutex<Receiver<Utterance>>,
    stt: &dyn SttBackend,
    filter: &TranscriptFilter,
    out: &Sender<String>,
    in_flight: &Arc<AtomicUsize>,
) -> VoiceResult<LoopControl> {
    let received = rx.lock().recv_timeout(RECV_POLL);
    let utterance = match received {
        Ok(u) => u,
        Err(RecvTimeoutError::Timeout) => return Ok(LoopControl::Continue),
        Err(RecvTimeoutError::Disconnected) => return Ok(LoopControl::Stop),
    };
    let _guard = InFlightGuard(in_flight.clone());

    if let Some(text) = transcribe_filtered(stt, filter, &utterance) {
        if out.send(text).is_err() {
            debug!("transcript consumer gone");
            return Ok(LoopControl::Stop);
        }
    }
    Ok(LoopControl::Continue)
}

/// Amplitude gate, STT, then text filters. `None` means nothing usable was said.
pub fn transcribe_filtered(stt: &dyn SttBackend, filter: &TranscriptFilter, utterance: &Utterance) -> Option<String> {
    let amplitude = utterance.mean_amplitude();
    if filter.below_amplitude_floor(amplitude) {
        debug!(amplitude, "utterance below amplitude floor");
        return None;
    }

    let raw = match stt.transcribe(&utterance.samples, utterance.sample_rate) {
        Ok(t) => t,
        Err(e) => {
            warn!(error = %e, "transcription failed");
            String::new()
        }
    };

    match filter.check(&raw) {
        Verdict::Accept(text) => {
            info!(text = %text, "heard");
            Some(text)
        }
        Verdict::Reject(reason) => {
            debug!(reason, raw = %raw, "transcript rejected");
            None
        }
    }
}
