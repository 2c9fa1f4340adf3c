//! **Speech-to-Text**: turn a finished utterance into text.
//!
//! Backends: remote OpenAI-compatible transcription, local Whisper behind the
//! `whisper` feature, and a placeholder for running without either.

use crate::config::LlmConfig;
use crate::error::{VoiceError, VoiceResult};
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info};

/// Converts mono PCM to text. Return an empty string when nothing was said.
pub trait SttBackend: Send + Sync {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String>;
}

/// Encode f32 PCM (mono) as 16-bit WAV for upload.
pub fn pcm_to_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for &s in samples {
            writer.write_sample((s.clamp(-1.0, 1.0) * 32767.0).round() as i16)?;
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}

/// Returns a fixed response (empty by default). For running the loop without STT.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

impl SttBackend for PlaceholderStt {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        debug!(samples = samples.len(), sample_rate, "placeholder STT");
        Ok(self.response.clone().unwrap_or_default())
    }
}

/// OpenAI-compatible `/audio/transcriptions` (OpenAI Whisper, OpenRouter, etc.).
#[derive(Debug, Clone)]
pub struct OpenRouterStt {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::blocking::Client,
}

impl OpenRouterStt {
    /// Key from `STT_API_KEY`, `LLM_API_KEY` or `OPENROUTER_API_KEY`; `STT_API_URL`
    /// and `STT_MODEL` override the configured endpoint.
    pub fn from_env(llm: &LlmConfig) -> VoiceResult<Self> {
        let api_key = std::env::var("STT_API_KEY")
            .or_else(|_| std::env::var("LLM_API_KEY"))
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("STT requires STT_API_KEY, LLM_API_KEY, or OPENROUTER_API_KEY".to_string())
            })?;
        let base_url = std::env::var("STT_API_URL").unwrap_or_else(|_| llm.base_url.clone());
        let model = std::env::var("STT_MODEL").unwrap_or_else(|_| llm.stt_model.clone());
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
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
        })
    }
}

impl SttBackend for OpenRouterStt {
    fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
        if samples.is_empty() {
            return Ok(String::new());
        }
        let wav = pcm_to_wav(samples, sample_rate)?;
        let url = format!("{}/audio/transcriptions", self.base_url.trim_end_matches('/'));
        let part = reqwest::blocking::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let form = reqwest::blocking::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res.json().map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use parking_lot::Mutex;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// On-device Whisper over a ggml model (e.g. ggml-base.en.bin). 16 kHz mono only.
    pub struct WhisperStt {
        #[allow(dead_code)]
        context: WhisperContext,
        state: Mutex<whisper_rs::WhisperState>,
    }

    impl WhisperStt {
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let context = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            info!(model_path, "local Whisper loaded");
            Ok(Self {
                context,
                state: Mutex::new(state),
            })
        }
    }

    impl SttBackend for WhisperStt {
        fn transcribe(&self, samples: &[f32], sample_rate: u32) -> VoiceResult<String> {
            if samples.is_empty() {
                return Ok(String::new());
            }
            if sample_rate != 16000 {
                return Err(VoiceError::Stt(format!("Whisper expects 16 kHz; got {} Hz", sample_rate)));
            }
            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_no_timestamps(true);
            params.set_language(Some("en"));

            let mut state = self.state.lock();
            state
                .full(params, samples)
                .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
            Ok(state
                .as_iter()
                .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string())
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Best available backend: local Whisper (`WHISPER_MODEL_PATH`, `whisper`
/// feature), then the remote API when a key is set, then the placeholder.
pub fn create_best_stt(llm: &LlmConfig) -> Box<dyn SttBackend> {
    #[cfg(feature = "whisper")]
    {
        if let Ok(path) = std::env::var("WHISPER_MODEL_PATH") {
            let path = path.trim();
            if !path.is_empty() {
                match whisper_stt::WhisperStt::new(path) {
                    Ok(w) => return Box::new(w),
                    Err(e) => tracing::warn!(error = %e, "local Whisper unavailable"),
                }
            }
        }
    }
    match OpenRouterStt::from_env(llm) {
        Ok(remote) => {
            info!(model = %remote.model, "using remote STT");
            Box::new(remote)
        }
        Err(_) => {
            info!("no STT configured; using placeholder");
            Box::new(PlaceholderStt::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_defaults_to_empty() {
        let stt = PlaceholderStt::new();
        assert_eq!(stt.transcribe(&[0.0; 480], 16_000).unwrap(), "");
    }

    #[test]
    fn placeholder_with_response() {
        let stt = PlaceholderStt::with_response("hello world");
        assert_eq!(stt.transcribe(&[], 16_000).unwrap(), "hello world");
    }

    #[test]
    fn wav_header_and_length() {
        let wav = pcm_to_wav(&[0.0, 0.5, -0.5, 1.0], 16_000).unwrap();
        assert_eq!(&wav[..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(wav.len(), 44 + 4 * 2);

        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        assert_eq!(reader.spec().channels, 1);
    }
}
