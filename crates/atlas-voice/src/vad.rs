//! Speech probability scoring.
//!
//! The capture loop only needs "how likely is this frame speech"; the
//! [`SpeechModel`] trait is that seam. The WebRTC adapter scores a frame by
//! running the detector over consecutive 10 ms windows and reporting the voiced
//! fraction, which turns its binary output into a usable probability.

use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Scores one frame of mono audio in `[0, 1]`.
pub trait SpeechModel {
    fn speech_probability(&mut self, frame: &[f32]) -> VoiceResult<f32>;
}

/// WebRTC voice activity detector.
///
/// `Vad` wraps a raw C handle and is `!Send`; construct it on the capture
/// thread.
pub struct WebRtcSpeechModel {
    vad: Vad,
    window: usize,
    scratch: Vec<i16>,
}

impl WebRtcSpeechModel {
    /// `mode` is the aggressiveness, 0 (quality) to 3 (very aggressive).
    pub fn new(sample_rate: u32, mode: u8) -> VoiceResult<Self> {
        info!(sample_rate, mode, "initializing WebRTC VAD");

        let rate = match sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::VadInit(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                    other
                )))
            }
        };
        let vad_mode = match mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => return Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {}", other))),
        };

        let window = (sample_rate / 100) as usize;
        Ok(Self {
            vad: Vad::new_with_rate_and_mode(rate, vad_mode),
            window,
            scratch: Vec::with_capacity(window),
        })
    }

    /// Samples per scored sub-window (10 ms).
    pub fn window(&self) -> usize {
        self.window
    }
}

impl SpeechModel for WebRtcSpeechModel {
    fn speech_probability(&mut self, frame: &[f32]) -> VoiceResult<f32> {
        let mut scored = 0usize;
        let mut voiced = 0usize;

        // A trailing partial window is ignored.
        for window in frame.chunks_exact(self.window) {
            self.scratch.clear();
            self.scratch
                .extend(window.iter().map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16));
            let is_speech = self
                .vad
                .is_voice_segment(&self.scratch)
                .map_err(|_| VoiceError::VadProcessing("VAD rejected the window".to_string()))?;
            scored += 1;
            if is_speech {
                voiced += 1;
            }
        }

        if scored == 0 {
            return Err(VoiceError::VadProcessing(format!(
                "frame of {} samples is shorter than one {}-sample window",
                frame.len(),
                self.window
            )));
        }
        let p = voiced as f32 / scored as f32;
        debug!(probability = p, "vad");
        Ok(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_rate() {
        assert!(WebRtcSpeechModel::new(44_100, 3).is_err());
        assert!(WebRtcSpeechModel::new(16_000, 4).is_err());
    }

    #[test]
    fn window_is_ten_ms() {
        let model = WebRtcSpeechModel::new(16_000, 3).unwrap();
        assert_eq!(model.window(), 160);
    }

    #[test]
    fn silence_scores_zero() {
        let mut model = WebRtcSpeechModel::new(16_000, 3).unwrap();
        let p = model.speech_probability(&[0.0; 512]).unwrap();
        assert_eq!(p, 0.0);
    }

    #[test]
    fn short_frame_is_an_error() {
        let mut model = WebRtcSpeechModel::new(16_000, 3).unwrap();
        assert!(model.speech_probability(&[0.0; 100]).is_err());
    }
}
