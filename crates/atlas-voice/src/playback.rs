//! Chunked playback with cooperative cancellation.
//!
//! Audio is written to the device in ~100 ms slices and the turn's
//! cancellation flag is checked before every slice, so a barge-in silences the
//! agent within roughly one chunk. Only the holder of a [`TurnToken`] can play.

use crate::audio::AudioSink;
use crate::config::PlaybackConfig;
use crate::turn::TurnToken;
use crate::voice_output::PcmSegment;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackOutcome {
    Completed,
    Aborted,
}

pub struct PlaybackController {
    sink: Mutex<Box<dyn AudioSink>>,
    chunk: Duration,
    lookahead: usize,
    poll: Duration,
}

impl PlaybackController {
    pub fn new(sink: Box<dyn AudioSink>, config: &PlaybackConfig) -> Self {
        Self {
            sink: Mutex::new(sink),
            chunk: Duration::from_millis(config.chunk_ms.max(1)),
            lookahead: config.lookahead_chunks,
            poll: Duration::from_millis(config.poll_ms.clamp(1, config.chunk_ms.max(1))),
        }
    }

    fn chunk_len(&self, sample_rate: u32) -> usize {
        ((sample_rate as u128 * self.chunk.as_millis()) / 1000).max(1) as usize
    }

    /// Play `segments` in order, stopping early if the turn is cancelled.
    pub fn play(&self, token: &TurnToken<'_>, segments: &[PcmSegment]) -> PlaybackOutcome {
        let flag = token.flag();
        let mut sink = self.sink.lock();

        for segment in segments {
            let chunk_len = self.chunk_len(segment.sample_rate);
            for chunk in segment.samples.chunks(chunk_len) {
                if flag.is_set() {
                    return self.abort(&mut **sink, token);
                }
                while sink.queued() > self.lookahead {
                    if flag.wait_for(self.poll) {
                        return self.abort(&mut **sink, token);
                    }
                }
                if let Err(e) = sink.write(chunk, segment.sample_rate) {
                    warn!(turn_id = token.id(), error = %e, "device write failed; chunk dropped");
                }
            }
        }

        // Let the tail play out, still interruptible.
        while sink.queued() > 0 {
            if flag.wait_for(self.poll) {
                return self.abort(&mut **sink, token);
            }
        }
        debug!(turn_id = token.id(), "playback completed");
        PlaybackOutcome::Completed
    }

    fn abort(&self, sink: &mut dyn AudioSink, token: &TurnToken<'_>) -> PlaybackOutcome {
        sink.abort();
        info!(turn_id = token.id(), "playback aborted");
        PlaybackOutcome::Aborted
    }
}
