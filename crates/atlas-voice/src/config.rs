//! Runtime configuration.
//!
//! Every field has a default so an empty environment yields a working setup.
//! Precedence: `ATLAS__SECTION__KEY` env vars > file at `ATLAS_CONFIG` (or
//! `config/atlas.toml`) > defaults.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    /// Samples per analysis frame.
    pub frame_size: usize,
    /// Frames kept in the pre-roll ring (15 x 512 @ 16 kHz ≈ 0.48 s).
    pub preroll_frames: usize,
    /// Speech probability above which a frame counts as voiced.
    pub speech_threshold: f32,
    /// Trailing silence that ends an utterance.
    pub silence_ms: u64,
    /// webrtc-vad aggressiveness, 0 (quality) to 3 (very aggressive).
    pub vad_mode: u8,
    /// Utterances longer than this are finalized early.
    pub max_utterance_secs: u64,
    pub transcription_workers: usize,
    /// Utterances beyond this many in flight are dropped.
    pub max_in_flight_transcriptions: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_size: 512,
            preroll_frames: 15,
            speech_threshold: 0.7,
            silence_ms: 1_200,
            vad_mode: 3,
            max_utterance_secs: 30,
            transcription_workers: 2,
            max_in_flight_transcriptions: 2,
        }
    }
}

impl CaptureConfig {
    /// Number of consecutive unvoiced frames that ends an utterance.
    pub fn silence_frames(&self) -> usize {
        let samples = self.sample_rate as u64 * self.silence_ms / 1_000;
        (samples / self.frame_size.max(1) as u64) as usize
    }

    pub fn max_utterance_frames(&self) -> usize {
        let samples = self.sample_rate as u64 * self.max_utterance_secs;
        (samples / self.frame_size.max(1) as u64) as usize
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_size as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Post-transcription hallucination filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Mean absolute amplitude below which audio is not transcribed at all.
    pub amplitude_floor: f32,
    pub junk_phrases: Vec<String>,
    /// Junk phrases only reject texts shorter than this.
    pub junk_max_len: usize,
    pub min_chars: usize,
    /// Repeated-token check applies above this many words.
    pub repeat_min_words: usize,
    pub diversity_min_words: usize,
    pub min_diversity: f32,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            amplitude_floor: 0.005,
            junk_phrases: ["thank you", "okay", "bye", "subscribe", "it's all good", "all good"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            junk_max_len: 15,
            min_chars: 3,
            repeat_min_words: 5,
            diversity_min_words: 8,
            min_diversity: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    pub chunk_ms: u64,
    /// Chunks allowed to sit in the device queue ahead of the one playing.
    pub lookahead_chunks: usize,
    /// Back-pressure poll interval; keep at or below `chunk_ms`.
    pub poll_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 100,
            lookahead_chunks: 1,
            poll_ms: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Speak `interruption_ack` after the user cuts the agent off.
    pub acknowledge_interrupts: bool,
    pub interruption_ack: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            acknowledge_interrupts: true,
            interruption_ack: "Yes, Sir?".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub enabled: bool,
    pub min_cooldown_secs: u64,
    pub max_cooldown_secs: u64,
    /// Required quiet time since the last user intent before speaking up.
    pub inactivity_secs: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_cooldown_secs: 300,
            max_cooldown_secs: 900,
            inactivity_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_secs: u64,
    /// CPU or RAM percentage that triggers `high_resource_warning`.
    pub resource_warning_percent: f32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            resource_warning_percent: 90.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogueConfig {
    pub voice: String,
    pub voice_speed: f32,
    /// Short-term context passed to the generator.
    pub history_len: usize,
    pub system_prompt: String,
    pub greeting: String,
    pub farewell: String,
    pub fallback_reply: String,
    pub exit_commands: Vec<String>,
    /// Sessions shorter than this are not archived.
    pub min_archive_messages: usize,
}

impl Default for DialogueConfig {
    fn default() -> Self {
        Self {
            voice: "bm_george".to_string(),
            voice_speed: 1.1,
            history_len: 10,
            system_prompt: "You are ATLAS, a dry, highly efficient AI assistant. Keep answers brief and speakable."
                .to_string(),
            greeting: "Online and ready, Sir.".to_string(),
            farewell: "Goodbye, Sir.".to_string(),
            fallback_reply: "I'm having trouble thinking right now, Sir.".to_string(),
            exit_commands: ["exit", "quit", "sleep", "!exit"].iter().map(|s| s.to_string()).collect(),
            min_archive_messages: 4,
        }
    }
}

/// OpenAI-compatible endpoint used for chat, speech and transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub stt_model: String,
    pub tts_model: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            model: "meta-llama/llama-3.3-70b-instruct".to_string(),
            temperature: 0.7,
            stt_model: "openai/whisper-1".to_string(),
            tts_model: "openai/tts-1".to_string(),
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub capture: CaptureConfig,
    pub filter: FilterConfig,
    pub playback: PlaybackConfig,
    pub turn: TurnConfig,
    pub idle: IdleConfig,
    pub heartbeat: HeartbeatConfig,
    pub dialogue: DialogueConfig,
    pub llm: LlmConfig,
    /// Habits file and session archives live here.
    pub storage_path: String,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            filter: FilterConfig::default(),
            playback: PlaybackConfig::default(),
            turn: TurnConfig::default(),
            idle: IdleConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            dialogue: DialogueConfig::default(),
            llm: LlmConfig::default(),
            storage_path: "./data".to_string(),
        }
    }
}

impl VoiceConfig {
    /// Load from `ATLAS_CONFIG` (default `config/atlas`) plus `ATLAS__*` env.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("ATLAS_CONFIG").unwrap_or_else(|_| "config/atlas".to_string());
        Self::load_from(&path)
    }

    /// Load from an explicit file path (extension optional; missing file is fine).
    pub fn load_from(path: &str) -> VoiceResult<Self> {
        let built = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(
                config::Environment::with_prefix("ATLAS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: VoiceConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        let c = &self.capture;
        if c.sample_rate == 0 || c.frame_size == 0 {
            return Err(VoiceError::Config("sample_rate and frame_size must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&c.speech_threshold) {
            return Err(VoiceError::Config(format!(
                "speech_threshold {} outside [0, 1]",
                c.speech_threshold
            )));
        }
        if c.vad_mode > 3 {
            return Err(VoiceError::Config(format!("vad_mode {} outside 0..=3", c.vad_mode)));
        }
        if c.transcription_workers == 0 || c.max_in_flight_transcriptions == 0 {
            return Err(VoiceError::Config("transcription pool needs at least one worker and slot".into()));
        }
        if self.playback.chunk_ms == 0 {
            return Err(VoiceError::Config("playback.chunk_ms must be non-zero".into()));
        }
        if self.playback.poll_ms == 0 || self.playback.poll_ms > self.playback.chunk_ms {
            return Err(VoiceError::Config("playback.poll_ms must be in 1..=chunk_ms".into()));
        }
        if self.idle.min_cooldown_secs > self.idle.max_cooldown_secs {
            return Err(VoiceError::Config("idle.min_cooldown_secs exceeds max_cooldown_secs".into()));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(VoiceError::Config("heartbeat.interval_secs must be non-zero".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = VoiceConfig::default();
        assert_eq!(cfg.capture.silence_frames(), 37);
        assert_eq!(cfg.capture.preroll_frames, 15);
        assert_eq!(cfg.capture.frame_size, 512);
        assert_eq!(cfg.playback.chunk_ms, 100);
        assert_eq!(cfg.idle.inactivity_secs, 180);
        assert_eq!(cfg.heartbeat.interval_secs, 60);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atlas.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "storage_path = \"/tmp/atlas\"\n[capture]\nspeech_threshold = 0.5\n[idle]\nenabled = false").unwrap();

        let cfg = VoiceConfig::load_from(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.storage_path, "/tmp/atlas");
        assert!((cfg.capture.speech_threshold - 0.5).abs() < f32::EPSILON);
        assert!(!cfg.idle.enabled);
        assert_eq!(cfg.capture.frame_size, 512);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = VoiceConfig::load_from("/nonexistent/atlas-config").unwrap();
        assert_eq!(cfg.storage_path, "./data");
        assert_eq!(cfg.dialogue.exit_commands.len(), 4);
    }

    #[test]
    fn rejects_bad_threshold() {
        let mut cfg = VoiceConfig::default();
        cfg.capture.speech_threshold = 1.5;
        assert!(cfg.validate().is_err());
    }
}
