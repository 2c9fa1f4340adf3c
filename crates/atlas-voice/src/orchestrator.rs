//! Voice Orchestrator - wires every component together.
//!
//! Owns the bus, the turn arbiter and the shutdown signal, hands `Arc`s of
//! them to each component at construction, starts the background threads
//! and runs the reactive dialogue loop on the caller's thread.

use crate::audio::{AudioSink, MicrophoneSource, NullSink, RodioSink};
use crate::bus::EventBus;
use crate::collaborators::{GeneratorIntentRouter, GeneratorMood, GeneratorSalience, MemoryRecall};
use crate::config::VoiceConfig;
use crate::dialogue::{Collaborators, DialogueLoop};
use crate::ear::VoiceActivityCapture;
use crate::error::{VoiceError, VoiceResult};
use crate::filter::TranscriptFilter;
use crate::habits::HabitBook;
use crate::reward::RewardBook;
use crate::heartbeat::HeartbeatEmitter;
use crate::idle::{IdleScheduler, MemorySource, VitalsSource};
use crate::llm::{create_best_generator, ResponseGenerator, StreamingChatGenerator};
use crate::playback::PlaybackController;
use crate::segmenter::SegmenterConfig;
use crate::signal::ShutdownSignal;
use crate::speaker::{Speaker, TranscriptHook};
use crate::stt::{create_best_stt, SttBackend};
use crate::transcription::TranscriptionPool;
use crate::turn::TurnArbiter;
use crate::vad::WebRtcSpeechModel;
use crate::vitals::{Interoception, SystemProbe, VitalsProbe};
use crate::voice_output::{create_best_tts, PlaceholderTts, TtsBackend, VoiceDescriptor};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

/// How the user talks to the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Microphone in, speaker out.
    Voice,
    /// Typed text in, speaker out.
    Hybrid,
    /// Typed text in, no audio at all.
    Text,
}

impl Mode {
    pub fn listens(self) -> bool {
        self == Mode::Voice
    }

    pub fn speaks(self) -> bool {
        self != Mode::Text
    }
}

impl FromStr for Mode {
    type Err = VoiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "voice" => Ok(Mode::Voice),
            "hybrid" => Ok(Mode::Hybrid),
            "text" => Ok(Mode::Text),
            other => Err(VoiceError::Config(format!("unknown mode '{}'", other))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Mode::Voice => "voice",
            Mode::Hybrid => "hybrid",
            Mode::Text => "text",
        };
        f.write_str(s)
    }
}

/// The external services the orchestrator talks through.
pub struct Backends {
    pub stt: Arc<dyn SttBackend>,
    pub tts: Arc<dyn TtsBackend>,
    pub generator: Arc<dyn ResponseGenerator>,
    pub sink: Box<dyn AudioSink>,
    pub vitals: Arc<dyn VitalsProbe>,
    pub collaborators: Collaborators,
}

impl Backends {
    /// Real backends chosen from environment and config, degrading to
    /// placeholders for anything that is not configured.
    pub fn from_config(config: &VoiceConfig, mode: Mode) -> Self {
        let llm = &config.llm;
        let generator: Arc<dyn ResponseGenerator> = Arc::from(create_best_generator(
            llm,
            &config.dialogue.system_prompt,
            &config.dialogue.fallback_reply,
        ));

        let sink: Box<dyn AudioSink> = if mode.speaks() {
            match RodioSink::open() {
                Ok(sink) => Box::new(sink),
                Err(e) => {
                    warn!(error = %e, "no output device; continuing silently");
                    Box::new(NullSink)
                }
            }
        } else {
            Box::new(NullSink)
        };

        let mut collaborators = Collaborators::default();
        // Classifiers and the greeter get a generator without the persona prompt.
        if let Ok(classifier) = StreamingChatGenerator::from_env(llm, "") {
            let classifier: Arc<dyn ResponseGenerator> = Arc::new(classifier);
            collaborators.router = Arc::new(GeneratorIntentRouter::new(classifier.clone()));
            collaborators.salience = Arc::new(GeneratorSalience::new(classifier.clone()));
            collaborators.mood = Arc::new(GeneratorMood::new(classifier.clone()));
            collaborators.greeter = Some(classifier);
        }

        Self {
            stt: Arc::from(create_best_stt(llm)),
            tts: if mode.speaks() {
                Arc::from(create_best_tts(llm))
            } else {
                Arc::new(PlaceholderTts)
            },
            generator,
            sink,
            vitals: Arc::new(SystemProbe::new()),
            collaborators,
        }
    }
}

/// Typed input: interrupts whatever is being said, then queues the line.
#[derive(Clone)]
pub struct TextInput {
    arbiter: Arc<TurnArbiter>,
    tx: Sender<String>,
}

impl TextInput {
    /// Returns `false` once the dialogue loop has gone away.
    pub fn submit(&self, line: String) -> bool {
        self.arbiter.explicit_interrupt();
        self.tx.send(line).is_ok()
    }
}

pub struct VoiceOrchestrator {
    config: VoiceConfig,
    mode: Mode,
    bus: Arc<EventBus>,
    arbiter: Arc<TurnArbiter>,
    shutdown: ShutdownSignal,
    stt: Arc<dyn SttBackend>,
    speaker: Arc<Speaker>,
    generator: Arc<dyn ResponseGenerator>,
    interoception: Arc<Interoception>,
    memory: Arc<dyn MemoryRecall>,
    dialogue: DialogueLoop,
    inputs_tx: Sender<String>,
    inputs_rx: Receiver<String>,
    pool: Option<Arc<TranscriptionPool>>,
    threads: Vec<JoinHandle<()>>,
}

impl VoiceOrchestrator {
    pub fn new(config: VoiceConfig, mode: Mode, backends: Backends) -> VoiceResult<Self> {
        Self::with_transcript_hook(config, mode, backends, None)
    }

    /// `hook` sees every sentence the agent speaks (the console prints them).
    pub fn with_transcript_hook(
        config: VoiceConfig,
        mode: Mode,
        backends: Backends,
        hook: Option<TranscriptHook>,
    ) -> VoiceResult<Self> {
        config.validate()?;
        info!(%mode, "initializing voice orchestrator");

        let bus = Arc::new(EventBus::new());
        let arbiter = Arc::new(TurnArbiter::new());

        let playback = Arc::new(PlaybackController::new(backends.sink, &config.playback));
        let voice = VoiceDescriptor {
            name: config.dialogue.voice.clone(),
            speed: config.dialogue.voice_speed,
        };
        let mut speaker = Speaker::new(backends.tts, playback, voice);
        if let Some(hook) = hook {
            speaker = speaker.with_transcript_hook(hook);
        }
        let speaker = Arc::new(speaker);

        let interoception = Arc::new(Interoception::new(
            backends.vitals,
            bus.clone(),
            config.heartbeat.resource_warning_percent,
        ));

        let habits_path = PathBuf::from(&config.storage_path).join("habits.json");
        let habits = Arc::new(HabitBook::open(habits_path, bus.clone())?);
        habits.listen();
        let rewards = Arc::new(RewardBook::open(PathBuf::from(&config.storage_path).join("rewards.json")));

        let memory = backends.collaborators.memory.clone();
        let dialogue = DialogueLoop::new(
            config.dialogue.clone(),
            config.turn.clone(),
            arbiter.clone(),
            bus.clone(),
            speaker.clone(),
            backends.generator.clone(),
        )
        .with_habits(habits)
        .with_rewards(rewards)
        .with_collaborators(backends.collaborators);

        let (inputs_tx, inputs_rx) = mpsc::channel();

        Ok(Self {
            config,
            mode,
            bus,
            arbiter,
            shutdown: ShutdownSignal::new(),
            stt: backends.stt,
            speaker,
            generator: backends.generator,
            interoception,
            memory,
            dialogue,
            inputs_tx,
            inputs_rx,
            pool: None,
            threads: Vec::new(),
        })
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    pub fn arbiter(&self) -> Arc<TurnArbiter> {
        self.arbiter.clone()
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn text_input(&self) -> TextInput {
        TextInput {
            arbiter: self.arbiter.clone(),
            tx: self.inputs_tx.clone(),
        }
    }

    /// Start heartbeat, idle scheduler and (in voice mode) capture.
    pub fn start(&mut self, idle_enabled: bool) -> VoiceResult<()> {
        info!("starting voice orchestrator");

        self.interoception.attach_to_heartbeat();
        let heartbeat = HeartbeatEmitter::new(
            self.bus.clone(),
            Duration::from_secs(self.config.heartbeat.interval_secs.max(1)),
        );
        self.threads.push(heartbeat.spawn(self.shutdown.clone())?);

        if idle_enabled && self.config.idle.enabled && self.mode.speaks() {
            let idle = IdleScheduler::new(
                &self.config.idle,
                self.arbiter.clone(),
                &self.bus,
                self.speaker.clone(),
                self.generator.clone(),
            )
            .with_source(Arc::new(MemorySource::new(self.memory.clone())))
            .with_source(Arc::new(VitalsSource::new(self.interoception.clone())));
            self.threads.push(Arc::new(idle).spawn(self.shutdown.clone())?);
        }

        if self.mode.listens() {
            self.start_capture()?;
        }

        info!("voice orchestrator started");
        Ok(())
    }

    fn start_capture(&mut self) -> VoiceResult<()> {
        let capture = &self.config.capture;
        let pool = Arc::new(TranscriptionPool::spawn(
            self.stt.clone(),
            TranscriptFilter::new(self.config.filter.clone()),
            capture.transcription_workers,
            capture.max_in_flight_transcriptions,
            self.inputs_tx.clone(),
            self.shutdown.clone(),
        )?);

        let ear = VoiceActivityCapture::new(
            SegmenterConfig::from_capture(capture),
            self.arbiter.clone(),
            self.bus.clone(),
            pool.clone(),
        );
        let (rate, frame, vad_mode) = (capture.sample_rate, capture.frame_size, capture.vad_mode);
        let handle = ear.spawn(
            move || MicrophoneSource::open(rate, frame),
            move || WebRtcSpeechModel::new(rate, vad_mode),
            self.shutdown.clone(),
        )?;
        self.threads.push(handle);
        self.pool = Some(pool);
        Ok(())
    }

    /// Greet, converse until exit or shutdown, say goodbye and archive.
    pub fn run(&mut self) {
        self.dialogue.greet();
        self.dialogue.run(&self.inputs_rx, &self.shutdown);
        self.dialogue.farewell();
        self.dialogue.finish();
    }

    /// Raise shutdown and join every background thread.
    pub fn stop(&mut self) {
        info!("stopping voice orchestrator");
        self.shutdown.raise();
        self.arbiter.explicit_interrupt();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("background thread panicked during shutdown");
            }
        }
        if let Some(pool) = self.pool.take() {
            pool.join();
        }
        info!("voice orchestrator stopped");
    }
}

impl Drop for VoiceOrchestrator {
    fn drop(&mut self) {
        if !self.threads.is_empty() {
            self.stop();
        }
    }
}
