//! **Voice output**: text-to-speech backends producing PCM.
//!
//! Synthesis returns decoded mono PCM segments so the playback controller can
//! slice them into short chunks and stop between any two of them.

use crate::config::LlmConfig;
use crate::error::{VoiceError, VoiceResult};
use rodio::Source;
use std::io::Cursor;
use std::time::Duration;
use tracing::debug;

/// Mono PCM with its sample rate.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmSegment {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmSegment {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }
}

/// Which voice to synthesize with.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceDescriptor {
    pub name: String,
    pub speed: f32,
}

impl Default for VoiceDescriptor {
    fn default() -> Self {
        Self {
            name: "bm_george".to_string(),
            speed: 1.1,
        }
    }
}

/// Text in, PCM out. An empty vector means there is nothing to play.
pub trait TtsBackend: Send + Sync {
    fn synthesize(&self, text: &str, voice: &VoiceDescriptor) -> VoiceResult<Vec<PcmSegment>>;
}

/// Produces no audio. Used for text-only runs and when no TTS is configured.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

impl TtsBackend for PlaceholderTts {
    fn synthesize(&self, _text: &str, _voice: &VoiceDescriptor) -> VoiceResult<Vec<PcmSegment>> {
        Ok(Vec::new())
    }
}

/// Decode a WAV/MP3 byte stream to mono f32 PCM.
pub fn decode_to_pcm(bytes: Vec<u8>) -> VoiceResult<PcmSegment> {
    let decoder = rodio::Decoder::new(Cursor::new(bytes))
        .map_err(|e| VoiceError::Tts(format!("Decode failed: {}", e)))?;
    let channels = decoder.channels().max(1) as usize;
    let sample_rate = decoder.sample_rate();
    let interleaved: Vec<f32> = decoder.convert_samples::<f32>().collect();

    let samples = if channels == 1 {
        interleaved
    } else {
        interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };
    Ok(PcmSegment::new(samples, sample_rate))
}

/// OpenAI-compatible `/audio/speech` endpoint (OpenAI, OpenRouter, etc.).
#[derive(Debug, Clone)]
pub struct OpenRouterTts {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::blocking::Client,
}

impl OpenRouterTts {
    /// Key from `TTS_API_KEY`, `LLM_API_KEY` or `OPENROUTER_API_KEY`; `TTS_API_URL`
    /// and `TTS_MODEL` override the configured endpoint.
    pub fn from_env(llm: &LlmConfig) -> VoiceResult<Self> {
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("LLM_API_KEY"))
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("TTS requires TTS_API_KEY, LLM_API_KEY, or OPENROUTER_API_KEY".to_string())
            })?;
        let base_url = std::env::var("TTS_API_URL").unwrap_or_else(|_| llm.base_url.clone());
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| llm.tts_model.clone());
        Self::new(base_url, api_key, model, Duration::from_secs(llm.request_timeout_secs))
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

impl TtsBackend for OpenRouterTts {
    fn synthesize(&self, text: &str, voice: &VoiceDescriptor) -> VoiceResult<Vec<PcmSegment>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": voice.name,
            "speed": voice.speed,
            "response_format": "wav",
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Tts(e.to_string()))?;
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        let segment = decode_to_pcm(bytes.to_vec())?;
        debug!(secs = segment.duration().as_secs_f32(), "synthesized");
        Ok(vec![segment])
    }
}

/// Remote TTS when a key is configured, otherwise silence.
pub fn create_best_tts(llm: &LlmConfig) -> Box<dyn TtsBackend> {
    match OpenRouterTts::from_env(llm) {
        Ok(tts) => Box::new(tts),
        Err(_) => Box::new(PlaceholderTts),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::pcm_to_wav;

    #[test]
    fn placeholder_tts_returns_empty() {
        let out = PlaceholderTts.synthesize("hello", &VoiceDescriptor::default()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn decodes_wav_bytes() {
        let wav = pcm_to_wav(&vec![0.25; 1600], 16_000).unwrap();
        let seg = decode_to_pcm(wav).unwrap();
        assert_eq!(seg.sample_rate, 16_000);
        assert_eq!(seg.samples.len(), 1600);
        assert_eq!(seg.duration().as_millis(), 100);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        assert!(decode_to_pcm(vec![1, 2, 3, 4]).is_err());
    }
}
