//! # ATLAS Voice - turn-taking and interruption for a spoken agent
//!
//! Decides who may speak, when speech starts and stops, and how the agent's
//! own voice is cut off the moment the user starts talking.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                         Voice Orchestrator                        │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────────┐                │
//! │  │ Microphone │→ │ VAD +      │→ │ Transcription│→ dialogue input │
//! │  │  (cpal)    │  │ pre-roll   │  │ pool (STT)   │                 │
//! │  └────────────┘  └─────┬──────┘  └──────────────┘                 │
//! │                 barge_in│                                          │
//! │                        ↓                                          │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────────┐                 │
//! │  │ Dialogue   │→ │   Turn     │← │ Idle         │                 │
//! │  │ (reactive) │  │  Arbiter   │  │ (proactive)  │                 │
//! │  └─────┬──────┘  └─────┬──────┘  └──────────────┘                 │
//! │        ↓  token + flag ↓                                          │
//! │  ┌────────────┐  ┌────────────┐  ┌──────────────┐                 │
//! │  │ Generator  │→ │ Sentences  │→ │ TTS →        │→ speaker (rodio)│
//! │  │ (stream)   │  │            │  │ 100ms chunks │                 │
//! │  └────────────┘  └────────────┘  └──────────────┘                 │
//! │                                                                   │
//! │  EventBus: intents, salience, mood, habits, heartbeat, vitals     │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod bus;
pub mod collaborators;
pub mod config;
pub mod dialogue;
pub mod ear;
pub mod error;
pub mod filter;
pub mod habits;
pub mod heartbeat;
pub mod idle;
pub mod llm;
pub mod orchestrator;
pub mod playback;
pub mod reward;
pub mod segmenter;
pub mod sentence;
pub mod signal;
pub mod speaker;
pub mod stt;
pub mod transcription;
pub mod turn;
pub mod vad;
pub mod vitals;
pub mod voice_output;
pub mod worker;

pub use audio::{AudioSink, FrameRead, FrameSource, MicrophoneSource, NullSink, RodioSink};
pub use bus::{topics, Event, EventBus};
pub use collaborators::{
    IntentRouter, JsonFileArchiver, MemoryRecall, MoodAnalyzer, SalienceScorer, SessionArchiver, SessionRecord,
    UserState,
};
pub use config::VoiceConfig;
pub use dialogue::{Collaborators, DialogueLoop, Exchange};
pub use ear::VoiceActivityCapture;
pub use error::{VoiceError, VoiceResult};
pub use filter::{TranscriptFilter, Verdict};
pub use habits::HabitBook;
pub use heartbeat::HeartbeatEmitter;
pub use idle::{CandidateSource, CycleOutcome, IdleScheduler};
pub use llm::{create_best_generator, ChatMessage, FragmentStream, ResponseGenerator};
pub use orchestrator::{Backends, Mode, TextInput, VoiceOrchestrator};
pub use playback::{PlaybackController, PlaybackOutcome};
pub use reward::RewardBook;
pub use segmenter::{PreRollBuffer, SegmentEvent, SpeechSegmenter, Utterance};
pub use sentence::SentenceChunker;
pub use signal::{ShutdownSignal, Signal};
pub use speaker::{Speaker, SpokenReply};
pub use stt::{create_best_stt, OpenRouterStt, PlaceholderStt, SttBackend};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use transcription::TranscriptionPool;
pub use turn::{CancellationFlag, TurnArbiter, TurnBusy, TurnKind, TurnState, TurnToken};
pub use vad::{SpeechModel, WebRtcSpeechModel};
pub use vitals::{Interoception, SystemProbe, Vitals, VitalsProbe};
pub use voice_output::{create_best_tts, OpenRouterTts, PcmSegment, PlaceholderTts, TtsBackend, VoiceDescriptor};
