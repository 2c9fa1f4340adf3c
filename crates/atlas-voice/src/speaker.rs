//! Generator output → sentences → synthesis → playback, under one turn.

use crate::llm::FragmentStream;
use crate::playback::{PlaybackController, PlaybackOutcome};
use crate::sentence::SentenceChunker;
use crate::turn::TurnToken;
use crate::voice_output::{TtsBackend, VoiceDescriptor};
use std::sync::Arc;
use tracing::{info, warn};

/// Called with every sentence right before it is spoken.
pub type TranscriptHook = Arc<dyn Fn(&str) + Send + Sync>;

/// What a turn actually produced.
#[derive(Debug, Clone, PartialEq)]
pub struct SpokenReply {
    /// Generated text up to the point the turn ended.
    pub text: String,
    pub outcome: PlaybackOutcome,
}

impl SpokenReply {
    pub fn interrupted(&self) -> bool {
        self.outcome == PlaybackOutcome::Aborted
    }
}

pub struct Speaker {
    tts: Arc<dyn TtsBackend>,
    playback: Arc<PlaybackController>,
    voice: VoiceDescriptor,
    on_sentence: Option<TranscriptHook>,
}

impl Speaker {
    pub fn new(tts: Arc<dyn TtsBackend>, playback: Arc<PlaybackController>, voice: VoiceDescriptor) -> Self {
        Self {
            tts,
            playback,
            voice,
            on_sentence: None,
        }
    }

    pub fn with_transcript_hook(mut self, hook: TranscriptHook) -> Self {
        self.on_sentence = Some(hook);
        self
    }

    /// Speak a generator stream sentence by sentence. Stops pulling fragments
    /// as soon as the turn is cancelled.
    pub fn speak_stream(&self, token: &TurnToken<'_>, fragments: FragmentStream) -> SpokenReply {
        let mut chunker = SentenceChunker::new();
        let mut text = String::new();

        for fragment in fragments {
            if token.is_cancelled() {
                return SpokenReply {
                    text,
                    outcome: PlaybackOutcome::Aborted,
                };
            }
            text.push_str(&fragment);
            for sentence in chunker.push(&fragment) {
                if self.say(token, &sentence) == PlaybackOutcome::Aborted {
                    return SpokenReply {
                        text,
                        outcome: PlaybackOutcome::Aborted,
                    };
                }
            }
        }

        let outcome = match chunker.finish() {
            Some(rest) => self.say(token, &rest),
            None if token.is_cancelled() => PlaybackOutcome::Aborted,
            None => PlaybackOutcome::Completed,
        };
        SpokenReply { text, outcome }
    }

    /// Speak a complete piece of text.
    pub fn speak_text(&self, token: &TurnToken<'_>, text: &str) -> SpokenReply {
        let fragments: FragmentStream = Box::new(std::iter::once(text.to_string()));
        self.speak_stream(token, fragments)
    }

    fn say(&self, token: &TurnToken<'_>, sentence: &str) -> PlaybackOutcome {
        if token.is_cancelled() {
            return PlaybackOutcome::Aborted;
        }
        info!(turn_id = token.id(), "ATLAS: {}", sentence);
        if let Some(hook) = &self.on_sentence {
            hook(sentence);
        }

        let segments = match self.tts.synthesize(sentence, &self.voice) {
            Ok(s) => s,
            Err(e) => {
                warn!(turn_id = token.id(), error = %e, "synthesis failed; skipping sentence");
                return PlaybackOutcome::Completed;
            }
        };
        if segments.is_empty() {
            return PlaybackOutcome::Completed;
        }
        self.playback.play(token, &segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullSink;
    use crate::config::PlaybackConfig;
    use crate::error::{VoiceError, VoiceResult};
    use crate::turn::{TurnArbiter, TurnKind};
    use crate::voice_output::{PcmSegment, PlaceholderTts};
    use parking_lot::Mutex;

    fn speaker(tts: Arc<dyn TtsBackend>) -> (Speaker, Arc<Mutex<Vec<String>>>) {
        let said = Arc::new(Mutex::new(Vec::new()));
        let s = said.clone();
        let playback = Arc::new(PlaybackController::new(Box::new(NullSink), &PlaybackConfig::default()));
        let speaker = Speaker::new(tts, playback, VoiceDescriptor::default())
            .with_transcript_hook(Arc::new(move |t: &str| s.lock().push(t.to_string())));
        (speaker, said)
    }

    #[test]
    fn speaks_each_sentence_in_order() {
        let (speaker, said) = speaker(Arc::new(PlaceholderTts));
        let arbiter = TurnArbiter::new();
        let token = arbiter.acquire(TurnKind::Reactive).unwrap();
        let reply = speaker.speak_text(&token, "First one. Second one! Third");
        assert_eq!(reply.outcome, PlaybackOutcome::Completed);
        assert_eq!(*said.lock(), vec!["First one.", "Second one!", "Third"]);
    }

    struct InterruptingTts {
        arbiter: Arc<TurnArbiter>,
        calls: Mutex<usize>,
    }

    impl TtsBackend for InterruptingTts {
        fn synthesize(&self, _text: &str, _voice: &VoiceDescriptor) -> VoiceResult<Vec<PcmSegment>> {
            let mut calls = self.calls.lock();
            *calls += 1;
            if *calls == 1 {
                self.arbiter.barge_in();
            }
            Ok(vec![PcmSegment::new(vec![0.0; 1600], 16_000)])
        }
    }

    #[test]
    fn stops_after_cancellation() {
        let arbiter = Arc::new(TurnArbiter::new());
        let tts = Arc::new(InterruptingTts {
            arbiter: arbiter.clone(),
            calls: Mutex::new(0),
        });
        let (speaker, said) = speaker(tts.clone());
        let token = arbiter.acquire(TurnKind::Reactive).unwrap();
        let reply = speaker.speak_text(&token, "One sentence. Two sentence. Three sentence.");
        assert!(reply.interrupted());
        assert_eq!(said.lock().len(), 1);
        assert_eq!(*tts.calls.lock(), 1);
    }

    struct BrokenTts;
    impl TtsBackend for BrokenTts {
        fn synthesize(&self, _: &str, _: &VoiceDescriptor) -> VoiceResult<Vec<PcmSegment>> {
            Err(VoiceError::Tts("down".into()))
        }
    }

    #[test]
    fn synthesis_failure_skips_sentence() {
        let (speaker, said) = speaker(Arc::new(BrokenTts));
        let arbiter = TurnArbiter::new();
        let token = arbiter.acquire(TurnKind::Reactive).unwrap();
        let reply = speaker.speak_text(&token, "Hello there. General Kenobi.");
        assert_eq!(reply.outcome, PlaybackOutcome::Completed);
        assert_eq!(said.lock().len(), 2);
    }
}
