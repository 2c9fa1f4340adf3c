//! **The Ear**: continuous voice activity capture with barge-in.
//!
//! Reads fixed frames from the microphone, scores each one, and segments
//! speech with a pre-roll ring so the first syllable is not lost. The moment
//! speech starts the arbiter is told, which cancels whatever the agent is
//! saying. Finished utterances go to the transcription pool; this loop never
//! waits on STT.

use crate::audio::{FrameRead, FrameSource};
use crate::bus::{topics, EventBus};
use crate::error::VoiceResult;
use crate::segmenter::{SegmentEvent, SegmenterConfig, SpeechSegmenter};
use crate::signal::ShutdownSignal;
use crate::transcription::TranscriptionPool;
use crate::turn::TurnArbiter;
use crate::vad::SpeechModel;
use crate::worker::{self, LoopControl};
use serde_json::json;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// How long one read waits before re-checking shutdown.
const READ_TIMEOUT: Duration = Duration::from_millis(200);

pub struct VoiceActivityCapture {
    segmenter: SpeechSegmenter,
    arbiter: Arc<TurnArbiter>,
    bus: Arc<EventBus>,
    pool: Arc<TranscriptionPool>,
}

impl VoiceActivityCapture {
    pub fn new(
        config: SegmenterConfig,
        arbiter: Arc<TurnArbiter>,
        bus: Arc<EventBus>,
        pool: Arc<TranscriptionPool>,
    ) -> Self {
        Self {
            segmenter: SpeechSegmenter::new(config),
            arbiter,
            bus,
            pool,
        }
    }

    /// Run on a dedicated thread. Source and model are built there because
    /// the cpal stream and the WebRTC detector are `!Send`.
    pub fn spawn<S, M, FS, FM>(mut self, make_source: FS, make_model: FM, shutdown: ShutdownSignal) -> VoiceResult<JoinHandle<()>>
    where
        S: FrameSource,
        M: SpeechModel,
        FS: FnOnce() -> VoiceResult<S> + Send + 'static,
        FM: FnOnce() -> VoiceResult<M> + Send + 'static,
    {
        worker::spawn_named("atlas-capture", move || {
            let mut source = match make_source() {
                Ok(s) => s,
                Err(e) => {
                    error!(error = %e, "capture: could not open input");
                    return;
                }
            };
            let mut model = match make_model() {
                Ok(m) => m,
                Err(e) => {
                    error!(error = %e, "capture: could not initialize speech model");
                    return;
                }
            };
            self.run(&mut source, &mut model, &shutdown);
        })
    }

    /// Blocking capture loop; returns when `shutdown` is raised.
    pub fn run(&mut self, source: &mut dyn FrameSource, model: &mut dyn SpeechModel, shutdown: &ShutdownSignal) {
        info!("capture: listening");
        worker::run_guarded("capture", shutdown, worker::DEFAULT_BACKOFF, || {
            match source.read_frame(READ_TIMEOUT)? {
                FrameRead::Frame(frame) => self.on_frame(&frame, &mut *model),
                FrameRead::Overflowed => debug!("capture: input overflow, frame dropped"),
                FrameRead::Timeout => {}
            }
            Ok(LoopControl::Continue)
        });
        info!("capture: stopped");
    }

    fn on_frame(&mut self, frame: &[f32], model: &mut dyn SpeechModel) {
        // An unscored frame still belongs in the ring and the utterance.
        let probability = match model.speech_probability(frame) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "capture: speech model failed; treating frame as unvoiced");
                0.0
            }
        };

        match self.segmenter.push(frame, probability) {
            SegmentEvent::SpeechStarted => self.on_speech_started(),
            SegmentEvent::Finalized(utterance) => {
                debug!(secs = utterance.duration().as_secs_f32(), "capture: utterance finalized");
                self.pool.submit(utterance);
            }
            SegmentEvent::Silence | SegmentEvent::Speaking => {}
        }
    }

    fn on_speech_started(&self) {
        // Cancel first; everything else can wait.
        if self.arbiter.barge_in() {
            self.bus
                .publish(topics::TURN_INTERRUPTED, json!({ "source": "voice" }));
        }
        self.bus.publish(
            topics::SPEECH_STARTED,
            json!({ "at": chrono::Utc::now().to_rfc3339() }),
        );
    }
}
