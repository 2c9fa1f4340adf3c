//! Frame-level speech segmentation.
//!
//! Pure state machine driven by (frame, speech probability) pairs. Keeps a
//! fixed ring of recent frames so an utterance includes the audio just before
//! onset, where the VAD typically lags the first syllable.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::time::Duration;

/// A finished stretch of user speech, ready for transcription.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub samples: Vec<f32>,
    /// Wall-clock time of speech onset.
    pub captured_at: DateTime<Utc>,
    pub sample_rate: u32,
}

impl Utterance {
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate.max(1) as f64)
    }

    /// Mean absolute amplitude.
    pub fn mean_amplitude(&self) -> f32 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().map(|s| s.abs()).sum::<f32>() / self.samples.len() as f32
    }
}

/// Fixed-capacity ring of the most recent frames.
#[derive(Debug, Clone)]
pub struct PreRollBuffer {
    frames: VecDeque<Vec<f32>>,
    capacity: usize,
}

impl PreRollBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, frame: &[f32]) {
        if self.capacity == 0 {
            return;
        }
        if self.frames.len() == self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame.to_vec());
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest-first concatenation of the buffered frames.
    pub fn snapshot(&self) -> Vec<f32> {
        self.frames.iter().flatten().copied().collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SegmenterConfig {
    pub sample_rate: u32,
    pub preroll_frames: usize,
    pub speech_threshold: f32,
    /// Unvoiced frames tolerated inside an utterance; one more ends it.
    pub silence_frames: usize,
    /// Force-finalize once an utterance reaches this many frames.
    pub max_frames: usize,
}

impl SegmenterConfig {
    pub fn from_capture(c: &crate::config::CaptureConfig) -> Self {
        Self {
            sample_rate: c.sample_rate,
            preroll_frames: c.preroll_frames,
            speech_threshold: c.speech_threshold,
            silence_frames: c.silence_frames(),
            max_frames: c.max_utterance_frames(),
        }
    }
}

/// What a pushed frame meant.
#[derive(Debug)]
pub enum SegmentEvent {
    Silence,
    /// Onset. The agent must stop talking now.
    SpeechStarted,
    Speaking,
    Finalized(Utterance),
}

#[derive(Debug)]
pub struct SpeechSegmenter {
    config: SegmenterConfig,
    ring: PreRollBuffer,
    speaking: bool,
    silence_run: usize,
    frames: usize,
    buffer: Vec<f32>,
    onset: Option<DateTime<Utc>>,
}

impl SpeechSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            ring: PreRollBuffer::new(config.preroll_frames),
            config,
            speaking: false,
            silence_run: 0,
            frames: 0,
            buffer: Vec::new(),
            onset: None,
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    pub fn push(&mut self, frame: &[f32], probability: f32) -> SegmentEvent {
        self.ring.push(frame);
        let voiced = probability > self.config.speech_threshold;

        if !self.speaking {
            if !voiced {
                return SegmentEvent::Silence;
            }
            // The ring already holds the current frame.
            self.speaking = true;
            self.silence_run = 0;
            self.buffer = self.ring.snapshot();
            self.frames = self.ring.len();
            self.onset = Some(Utc::now());
            return SegmentEvent::SpeechStarted;
        }

        self.buffer.extend_from_slice(frame);
        self.frames += 1;
        if voiced {
            self.silence_run = 0;
        } else {
            self.silence_run += 1;
        }

        if self.silence_run > self.config.silence_frames
            || (self.config.max_frames > 0 && self.frames >= self.config.max_frames)
        {
            return SegmentEvent::Finalized(self.finalize());
        }
        SegmentEvent::Speaking
    }

    fn finalize(&mut self) -> Utterance {
        self.speaking = false;
        self.silence_run = 0;
        self.frames = 0;
        Utterance {
            samples: std::mem::take(&mut self.buffer),
            captured_at: self.onset.take().unwrap_or_else(Utc::now),
            sample_rate: self.config.sample_rate,
        }
    }
}
