//! Proactive speech when the user has gone quiet.
//!
//! Every cooldown (random, 5 to 15 minutes by default) the scheduler checks
//! whether any user intent was seen recently. If not, it picks a candidate
//! source, turns its prompt into a short line and speaks it, but only if the
//! speaker is free *right now*. A busy speaker means the cycle is skipped.

use crate::bus::{topics, EventBus};
use crate::collaborators::MemoryRecall;
use crate::config::IdleConfig;
use crate::error::VoiceResult;
use crate::llm::ResponseGenerator;
use crate::signal::ShutdownSignal;
use crate::speaker::{Speaker, SpokenReply};
use crate::turn::{TurnArbiter, TurnKind};
use crate::vitals::Interoception;
use crate::worker::{self, LoopControl};
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use rand::Rng;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Produces a generation prompt for a proactive line, or nothing.
pub trait CandidateSource: Send + Sync {
    fn name(&self) -> &'static str;
    fn prompt(&self) -> Option<String>;
}

/// Always has something: a generic "still here" check-in.
#[derive(Debug, Default, Clone)]
pub struct CheckInSource;

impl CandidateSource for CheckInSource {
    fn name(&self) -> &'static str {
        "check-in"
    }

    fn prompt(&self) -> Option<String> {
        Some(
            "You have been sitting in silence. Generate a maximum 12-word proactive statement to break \
             the silence. Be dry, professional, and slightly witty. Address the user as 'Sir'.\n\
             Example: 'I remain online, Sir, should you require my assistance.'\n\
             Output ONLY the exact text."
                .to_string(),
        )
    }
}

/// Brings up a stored fact and offers to resume it.
pub struct MemorySource {
    memory: Arc<dyn MemoryRecall>,
    query: String,
}

impl MemorySource {
    pub fn new(memory: Arc<dyn MemoryRecall>) -> Self {
        Self {
            memory,
            query: "specific technical details preferences projects".to_string(),
        }
    }
}

impl CandidateSource for MemorySource {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn prompt(&self) -> Option<String> {
        let fact = self.memory.recall(&self.query, 1).into_iter().next()?;
        Some(format!(
            "You have been idle. You were just reviewing this specific memory: '{}'\n\
             Generate a maximum 15-word proactive statement. Address the user as 'Sir'.\n\
             Do not invent details. Only reference what is in the memory, and ask whether to resume that topic.\n\
             Output ONLY the exact text.",
            fact
        ))
    }
}

/// Comments on current host load.
pub struct VitalsSource {
    interoception: Arc<Interoception>,
}

impl VitalsSource {
    pub fn new(interoception: Arc<Interoception>) -> Self {
        Self { interoception }
    }
}

impl CandidateSource for VitalsSource {
    fn name(&self) -> &'static str {
        "vitals"
    }

    fn prompt(&self) -> Option<String> {
        let vitals = self.interoception.check();
        Some(format!(
            "Your current CPU is {}%. A low percentage means you are comfortably idling; a high one means you \
             are thinking hard.\nGenerate a maximum 12-word proactive check-in mentioning your system \
             stability. Address the user as 'Sir'.\nOutput ONLY the exact text.",
            vitals.cpu_percent.round() as i64
        ))
    }
}

/// Result of one scheduler cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// The user was active within the inactivity window.
    Inactive,
    /// No line could be produced.
    NoCandidate,
    /// Another turn holds the speaker.
    Busy,
    Spoke(SpokenReply),
}

pub struct IdleScheduler {
    arbiter: Arc<TurnArbiter>,
    speaker: Arc<Speaker>,
    generator: Arc<dyn ResponseGenerator>,
    sources: Vec<Arc<dyn CandidateSource>>,
    fallback: CheckInSource,
    cooldown: (Duration, Duration),
    inactivity: Duration,
    last_activity: Arc<Mutex<Instant>>,
}

impl IdleScheduler {
    /// Subscribes to the reactive intent topics to track user activity.
    pub fn new(
        config: &IdleConfig,
        arbiter: Arc<TurnArbiter>,
        bus: &EventBus,
        speaker: Arc<Speaker>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        for intent in topics::REACTIVE_INTENTS {
            let last = last_activity.clone();
            bus.subscribe(&topics::intent_topic(intent), move |_| {
                *last.lock() = Instant::now();
                Ok(())
            });
        }

        let min = config.min_cooldown_secs.min(config.max_cooldown_secs);
        Self {
            arbiter,
            speaker,
            generator,
            sources: Vec::new(),
            fallback: CheckInSource,
            cooldown: (Duration::from_secs(min), Duration::from_secs(config.max_cooldown_secs)),
            inactivity: Duration::from_secs(config.inactivity_secs),
            last_activity,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn CandidateSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    fn is_quiet(&self) -> bool {
        self.idle_for() >= self.inactivity
    }

    fn next_cooldown(&self) -> Duration {
        let (min, max) = self.cooldown;
        if min >= max {
            return min;
        }
        rand::thread_rng().gen_range(min..=max)
    }

    fn pick_prompt(&self) -> Option<String> {
        let chosen = self.sources.choose(&mut rand::thread_rng());
        if let Some(source) = chosen {
            if let Some(prompt) = source.prompt() {
                debug!(source = source.name(), "idle candidate");
                return Some(prompt);
            }
            debug!(source = source.name(), "source had nothing; falling back to check-in");
        }
        self.fallback.prompt()
    }

    fn compose(&self, prompt: &str) -> Option<String> {
        let text = match self.generator.generate(prompt, &[]) {
            Ok(stream) => stream.collect::<String>(),
            Err(e) => {
                debug!(error = %e, "idle line generation failed");
                return None;
            }
        };
        let line = text.trim().trim_matches(|c: char| c == '"' || c == '\'').trim();
        (!line.is_empty()).then(|| line.to_string())
    }

    /// One eligibility check and, if eligible, one proactive utterance.
    pub fn run_cycle(&self) -> CycleOutcome {
        if !self.is_quiet() {
            return CycleOutcome::Inactive;
        }
        let Some(line) = self.pick_prompt().and_then(|p| self.compose(&p)) else {
            return CycleOutcome::NoCandidate;
        };
        // The user may have spoken while the line was being generated.
        if !self.is_quiet() {
            return CycleOutcome::Inactive;
        }

        let token = match self.arbiter.try_acquire(TurnKind::Proactive) {
            Ok(token) => token,
            Err(_) => {
                debug!("speaker busy; skipping idle line");
                return CycleOutcome::Busy;
            }
        };
        info!(turn_id = token.id(), "speaking proactively");
        let reply = self.speaker.speak_text(&token, &line);
        token.release();
        CycleOutcome::Spoke(reply)
    }

    /// Run on a dedicated thread until shutdown.
    pub fn spawn(self: Arc<Self>, shutdown: ShutdownSignal) -> VoiceResult<JoinHandle<()>> {
        info!(
            min_secs = self.cooldown.0.as_secs(),
            max_secs = self.cooldown.1.as_secs(),
            "idle scheduler started"
        );
        worker::spawn_named("atlas-idle", move || {
            let guard = shutdown.clone();
            worker::run_guarded("idle", &guard, worker::DEFAULT_BACKOFF, || {
                if shutdown.wait_for(self.next_cooldown()) {
                    return Ok(LoopControl::Stop);
                }
                let outcome = self.run_cycle();
                debug!(?outcome, "idle cycle");
                Ok(LoopControl::Continue)
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullSink;
    use crate::collaborators::{FactList, NoMemory};
    use crate::config::PlaybackConfig;
    use crate::llm::CannedGenerator;
    use crate::playback::{PlaybackController, PlaybackOutcome};
    use crate::signal::Signal;
    use crate::voice_output::{PlaceholderTts, VoiceDescriptor};
    use serde_json::json;

    fn speaker() -> Arc<Speaker> {
        let playback = Arc::new(PlaybackController::new(Box::new(NullSink), &PlaybackConfig::default()));
        Arc::new(Speaker::new(Arc::new(PlaceholderTts), playback, VoiceDescriptor::default()))
    }

    fn quiet_config() -> IdleConfig {
        IdleConfig {
            inactivity_secs: 0,
            ..IdleConfig::default()
        }
    }

    fn scheduler(config: &IdleConfig, arbiter: Arc<TurnArbiter>, bus: &EventBus, reply: &str) -> IdleScheduler {
        IdleScheduler::new(config, arbiter, bus, speaker(), Arc::new(CannedGenerator::new(reply)))
    }

    #[test]
    fn recent_intent_blocks_idle_speech() {
        let bus = EventBus::new();
        let idle = scheduler(&IdleConfig::default(), Arc::new(TurnArbiter::new()), &bus, "Still here, Sir.");
        assert_eq!(idle.run_cycle(), CycleOutcome::Inactive);
    }

    #[test]
    fn intent_events_reset_the_timer() {
        let bus = EventBus::new();
        let idle = scheduler(&quiet_config(), Arc::new(TurnArbiter::new()), &bus, "x");
        std::thread::sleep(Duration::from_millis(30));
        assert!(idle.idle_for() >= Duration::from_millis(30));
        bus.publish("intent_QUERY", json!("what time is it"));
        assert!(idle.idle_for() < Duration::from_millis(30));
    }

    #[test]
    fn speaks_when_quiet_and_free() {
        let bus = EventBus::new();
        let arbiter = Arc::new(TurnArbiter::new());
        let idle = scheduler(&quiet_config(), arbiter.clone(), &bus, "\"I remain online, Sir.\"");
        match idle.run_cycle() {
            CycleOutcome::Spoke(reply) => {
                assert_eq!(reply.outcome, PlaybackOutcome::Completed);
                assert_eq!(reply.text, "I remain online, Sir.");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!arbiter.is_busy());
    }

    #[test]
    fn own_speech_does_not_count_as_activity() {
        let bus = EventBus::new();
        let idle = scheduler(&quiet_config(), Arc::new(TurnArbiter::new()), &bus, "Still here, Sir.");
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(idle.run_cycle(), CycleOutcome::Spoke(_)));
        assert!(idle.idle_for() >= Duration::from_millis(30));
    }

    #[test]
    fn busy_speaker_skips_cycle() {
        let bus = EventBus::new();
        let arbiter = Arc::new(TurnArbiter::new());
        let idle = scheduler(&quiet_config(), arbiter.clone(), &bus, "Hello, Sir.");
        let reactive = arbiter.acquire(TurnKind::Reactive).unwrap();
        assert_eq!(idle.run_cycle(), CycleOutcome::Busy);
        assert!(!reactive.is_cancelled());
    }

    #[test]
    fn empty_generation_is_no_candidate() {
        let bus = EventBus::new();
        let idle = scheduler(&quiet_config(), Arc::new(TurnArbiter::new()), &bus, "  ");
        assert_eq!(idle.run_cycle(), CycleOutcome::NoCandidate);
    }

    #[test]
    fn memory_source_falls_back_to_check_in() {
        let empty = MemorySource::new(Arc::new(NoMemory));
        assert!(empty.prompt().is_none());

        let bus = EventBus::new();
        let idle = scheduler(&quiet_config(), Arc::new(TurnArbiter::new()), &bus, "x")
            .with_source(Arc::new(empty));
        let prompt = idle.pick_prompt().unwrap();
        assert!(prompt.contains("sitting in silence"));

        let stocked = MemorySource::new(Arc::new(FactList::new([
            "Sir is building a solder reflow oven",
            "Sir prefers 63/37 solder wire",
        ])));
        assert!(stocked.prompt().unwrap().contains("Sir prefers 63/37 solder wire"));

        let project = MemorySource::new(Arc::new(FactList::new(["Sir's project uses a Raspberry Pi"])));
        assert!(project.prompt().unwrap().contains("Raspberry Pi"));
    }

    #[test]
    fn shutdown_interrupts_cooldown() {
        let bus = EventBus::new();
        let idle = Arc::new(scheduler(&IdleConfig::default(), Arc::new(TurnArbiter::new()), &bus, "x"));
        let shutdown = Signal::new();
        let handle = idle.spawn(shutdown.clone()).unwrap();
        let started = Instant::now();
        shutdown.raise();
        handle.join().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
