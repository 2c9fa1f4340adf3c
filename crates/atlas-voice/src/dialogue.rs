//! **Dialogue**: the reactive loop, user text in, spoken reply out.
//!
//! Each input is checked against exit words and habits first, then routed,
//! scored and mood-analyzed (results go out on the bus), and finally answered
//! with a streamed generation spoken under a reactive turn. An answer cut off
//! by the user is optionally followed by a short acknowledgment in a fresh turn.
//! The user's mood on each input reinforces or weakens the intent that
//! produced the previous reply.

use crate::bus::{topics, EventBus};
use crate::collaborators::{
    DiscardArchiver, IntentRouter, KeywordIntentRouter, MemoryRecall, MoodAnalyzer, NeutralMood,
    NeutralSalience, NoMemory, SalienceScorer, SessionArchiver, SessionRecord, UserState,
};
use crate::config::{DialogueConfig, TurnConfig};
use crate::habits::HabitBook;
use crate::llm::{ChatMessage, FragmentStream, ResponseGenerator};
use crate::playback::PlaybackOutcome;
use crate::reward::{feedback_for, RewardBook};
use crate::signal::ShutdownSignal;
use crate::speaker::{Speaker, SpokenReply};
use crate::turn::{TurnArbiter, TurnKind};
use chrono::{DateTime, Local, Timelike, Utc};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Salience at or above this is announced as `high_salience_event`.
pub const HIGH_SALIENCE: u8 = 9;

const INPUT_POLL: Duration = Duration::from_millis(200);

/// Intent credited for the reaction to the greeting.
const OPENING_INTENT: &str = "CHAT";

pub fn part_of_day(hour: u32) -> &'static str {
    match hour {
        5..=11 => "Morning",
        12..=16 => "Afternoon",
        17..=21 => "Evening",
        _ => "Late Night",
    }
}

/// Pluggable analysis and persistence.
#[derive(Clone)]
pub struct Collaborators {
    pub router: Arc<dyn IntentRouter>,
    pub salience: Arc<dyn SalienceScorer>,
    pub mood: Arc<dyn MoodAnalyzer>,
    pub memory: Arc<dyn MemoryRecall>,
    pub archiver: Arc<dyn SessionArchiver>,
    /// Writes the greeting and sign-off; the configured lines are used without one.
    pub greeter: Option<Arc<dyn ResponseGenerator>>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            router: Arc::new(KeywordIntentRouter),
            salience: Arc::new(NeutralSalience),
            mood: Arc::new(NeutralMood),
            memory: Arc::new(NoMemory),
            archiver: Arc::new(DiscardArchiver),
            greeter: None,
        }
    }
}

const FAREWELL_PROMPT: &str = "You are ATLAS, a dry, highly efficient AI.\n\
    Generate a maximum 8-word sign-off. Address the user as 'Sir'.\n\
    No flowery language, no metaphors, no system logs. Do not mention when you will return.\n\
    Example: 'Get some rest, Sir. Shutting down.'\n\
    Output ONLY the exact text.";

/// What happened to one input.
#[derive(Debug, Clone, PartialEq)]
pub enum Exchange {
    /// Blank input.
    Ignored,
    Exit,
    Habit(SpokenReply),
    Replied {
        intent: String,
        reply: SpokenReply,
        acknowledged: bool,
    },
}

pub struct DialogueLoop {
    config: DialogueConfig,
    turn: TurnConfig,
    arbiter: Arc<TurnArbiter>,
    bus: Arc<EventBus>,
    speaker: Arc<Speaker>,
    generator: Arc<dyn ResponseGenerator>,
    habits: Option<Arc<HabitBook>>,
    rewards: Option<Arc<RewardBook>>,
    last_intent: String,
    collaborators: Collaborators,
    history: VecDeque<ChatMessage>,
    session: Vec<ChatMessage>,
    started_at: DateTime<Utc>,
}

impl DialogueLoop {
    pub fn new(
        config: DialogueConfig,
        turn: TurnConfig,
        arbiter: Arc<TurnArbiter>,
        bus: Arc<EventBus>,
        speaker: Arc<Speaker>,
        generator: Arc<dyn ResponseGenerator>,
    ) -> Self {
        Self {
            config,
            turn,
            arbiter,
            bus,
            speaker,
            generator,
            habits: None,
            rewards: None,
            last_intent: OPENING_INTENT.to_string(),
            collaborators: Collaborators::default(),
            history: VecDeque::new(),
            session: Vec::new(),
            started_at: Utc::now(),
        }
    }

    pub fn with_habits(mut self, habits: Arc<HabitBook>) -> Self {
        self.habits = Some(habits);
        self
    }

    pub fn with_rewards(mut self, rewards: Arc<RewardBook>) -> Self {
        self.rewards = Some(rewards);
        self
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Messages of the whole session, oldest first.
    pub fn session(&self) -> &[ChatMessage] {
        &self.session
    }

    /// Short-term context handed to the generator.
    pub fn history(&self) -> Vec<ChatMessage> {
        self.history.iter().cloned().collect()
    }

    pub fn is_exit_command(&self, text: &str) -> bool {
        let lower = text.trim().to_lowercase();
        self.config.exit_commands.iter().any(|c| c.eq_ignore_ascii_case(&lower))
    }

    /// Speak a fixed line as its own reactive turn.
    pub fn say(&self, text: &str) -> Option<SpokenReply> {
        if text.trim().is_empty() {
            return None;
        }
        let token = self.arbiter.acquire(TurnKind::Reactive).ok()?;
        Some(self.speaker.speak_text(&token, text))
    }

    pub fn greet(&self) -> Option<SpokenReply> {
        let line = self.compose_line(&self.greeting_prompt(), &self.config.greeting);
        self.say(&line)
    }

    pub fn farewell(&self) -> Option<SpokenReply> {
        let line = self.compose_line(FAREWELL_PROMPT, &self.config.farewell);
        self.say(&line)
    }

    fn greeting_prompt(&self) -> String {
        let memory = match self
            .collaborators
            .memory
            .recall("user preferences habits", 1)
            .into_iter()
            .next()
        {
            Some(fact) => format!("Known fact:\n{}\n", fact),
            None => String::new(),
        };
        format!(
            "You are ATLAS, a dry, highly efficient, slightly witty AI.\n\
             Context: It is currently {}.\n{}\
             Generate a maximum 10-word greeting. Address the user as 'Sir'.\n\
             Never use flowery language or mention the weather. Use the time of day naturally.\n\
             Never mention schedules, meetings or agendas; you have no agenda data.\n\
             Example: 'Systems online. Working late again, Sir?'\n\
             Output ONLY the exact greeting text.",
            part_of_day(Local::now().hour()),
            memory
        )
    }

    /// Generated line, or `fallback` without a greeter or on failure.
    fn compose_line(&self, prompt: &str, fallback: &str) -> String {
        let Some(greeter) = &self.collaborators.greeter else {
            return fallback.to_string();
        };
        let text = match greeter.generate(prompt, &[]) {
            Ok(stream) => stream.collect::<String>(),
            Err(e) => {
                debug!(error = %e, "greeting generation failed");
                return fallback.to_string();
            }
        };
        let line = text.trim().trim_matches(|c: char| c == '"' || c == '\'').trim();
        if line.is_empty() {
            fallback.to_string()
        } else {
            line.to_string()
        }
    }

    /// Process one user input end to end.
    pub fn handle(&mut self, text: &str) -> Exchange {
        let text = text.trim();
        if text.is_empty() {
            return Exchange::Ignored;
        }
        if self.is_exit_command(text) {
            info!("exit command received");
            return Exchange::Exit;
        }
        info!("USER: {}", text);

        if let Some(response) = self.habits.as_ref().and_then(|h| h.check(text)) {
            debug!("habit hit");
            let reply = self.say(&response).unwrap_or(SpokenReply {
                text: String::new(),
                outcome: PlaybackOutcome::Aborted,
            });
            self.remember(text, &response);
            return Exchange::Habit(reply);
        }

        let (intent, state) = self.analyze(text);
        self.reinforce(&state, intent);
        let intent = self.last_intent.clone();
        let prompt = self.with_memory_context(text);
        let history = self.history();

        let fragments: FragmentStream = match self.generator.generate(&prompt, &history) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "generation failed; using fallback reply");
                Box::new(std::iter::once(self.config.fallback_reply.clone()))
            }
        };

        let reply = match self.arbiter.acquire(TurnKind::Reactive) {
            Ok(token) => {
                let reply = self.speaker.speak_stream(&token, fragments);
                token.release();
                reply
            }
            Err(e) => {
                warn!(error = %e, "could not take the speaker");
                return Exchange::Ignored;
            }
        };

        self.remember(text, reply.text.trim());
        let acknowledged = reply.interrupted() && self.acknowledge_interruption();
        Exchange::Replied {
            intent,
            reply,
            acknowledged,
        }
    }

    fn analyze(&self, text: &str) -> (String, UserState) {
        let c = &self.collaborators;

        let intent = c.router.route(text);
        info!(intent = %intent, "routed");
        self.bus.publish(&topics::intent_topic(&intent), json!(text));

        let score = c.salience.score(text);
        if score >= HIGH_SALIENCE {
            warn!(score, "high salience input");
            self.bus.publish(topics::HIGH_SALIENCE_EVENT, json!(text));
        }

        let state = c.mood.analyze(text);
        debug!(mood = %state.mood, urgency = %state.urgency, "user state");
        self.bus
            .publish(topics::USER_STATE_UPDATED, serde_json::to_value(&state).unwrap_or_default());

        (intent, state)
    }

    /// Credit the user's reaction to the previous reply, then remember `intent`.
    fn reinforce(&mut self, state: &UserState, intent: String) {
        let previous = std::mem::replace(&mut self.last_intent, intent);
        let (Some(rewards), Some(positive)) = (&self.rewards, feedback_for(&state.mood)) else {
            return;
        };
        match rewards.apply_feedback(&previous, positive) {
            Ok(weight) => self.bus.publish(
                topics::REWARD_APPLIED,
                json!({ "intent": previous, "positive": positive, "weight": weight }),
            ),
            Err(e) => warn!(error = %e, "could not persist reinforcement"),
        }
    }

    fn with_memory_context(&self, text: &str) -> String {
        let facts = self.collaborators.memory.recall(text, 3);
        if facts.is_empty() {
            return text.to_string();
        }
        let context: Vec<String> = facts.iter().map(|f| format!("- {}", f)).collect();
        format!("Relevant memories:\n{}\n\n{}", context.join("\n"), text)
    }

    fn acknowledge_interruption(&self) -> bool {
        if !self.turn.acknowledge_interrupts {
            return false;
        }
        info!("acknowledging interruption");
        self.say(&self.turn.interruption_ack).is_some()
    }

    fn remember(&mut self, user: &str, assistant: &str) {
        let mut pair = vec![ChatMessage::user(user)];
        if !assistant.is_empty() {
            pair.push(ChatMessage::assistant(assistant));
        }
        for message in pair {
            self.session.push(message.clone());
            self.history.push_back(message);
        }
        while self.history.len() > self.config.history_len {
            self.history.pop_front();
        }
    }

    /// Consume inputs until an exit command, a closed channel or shutdown.
    pub fn run(&mut self, inputs: &Receiver<String>, shutdown: &ShutdownSignal) {
        info!("dialogue loop running");
        while !shutdown.is_raised() {
            let text = match inputs.recv_timeout(INPUT_POLL) {
                Ok(text) => text,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("input closed");
                    break;
                }
            };
            if self.handle(&text) == Exchange::Exit {
                break;
            }
        }
    }

    /// Archive the session if it is long enough. Returns whether it was archived.
    pub fn finish(&self) -> bool {
        if self.session.len() < self.config.min_archive_messages {
            info!(messages = self.session.len(), "session too short to archive");
            return false;
        }
        let record = SessionRecord {
            started_at: self.started_at,
            ended_at: Utc::now(),
            messages: self.session.clone(),
        };
        match self.collaborators.archiver.archive(&record) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "session archival failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::NullSink;
    use crate::collaborators::FactList;
    use crate::config::PlaybackConfig;
    use crate::error::{VoiceError, VoiceResult};
    use crate::llm::CannedGenerator;
    use crate::playback::PlaybackController;
    use crate::voice_output::{PlaceholderTts, VoiceDescriptor};
    use parking_lot::Mutex;

    type Said = Arc<Mutex<Vec<String>>>;

    fn speaker() -> (Arc<Speaker>, Said) {
        let said: Said = Arc::new(Mutex::new(Vec::new()));
        let s = said.clone();
        let playback = Arc::new(PlaybackController::new(Box::new(NullSink), &PlaybackConfig::default()));
        let speaker = Speaker::new(Arc::new(PlaceholderTts), playback, VoiceDescriptor::default())
            .with_transcript_hook(Arc::new(move |t: &str| s.lock().push(t.to_string())));
        (Arc::new(speaker), said)
    }

    fn dialogue(generator: Arc<dyn ResponseGenerator>) -> (DialogueLoop, Arc<EventBus>, Said) {
        let bus = Arc::new(EventBus::new());
        let (speaker, said) = speaker();
        let d = DialogueLoop::new(
            DialogueConfig::default(),
            TurnConfig::default(),
            Arc::new(TurnArbiter::new()),
            bus.clone(),
            speaker,
            generator,
        );
        (d, bus, said)
    }

    fn record(bus: &EventBus, topic: &str) -> Arc<Mutex<Vec<serde_json::Value>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(topic, move |e| {
            s.lock().push(e.payload.clone());
            Ok(())
        });
        seen
    }

    #[test]
    fn exit_words_end_the_loop() {
        let (mut d, _, said) = dialogue(Arc::new(CannedGenerator::new("unused")));
        assert_eq!(d.handle("  QUIT "), Exchange::Exit);
        assert_eq!(d.handle("!exit"), Exchange::Exit);
        assert_eq!(d.handle("   "), Exchange::Ignored);
        assert!(said.lock().is_empty());
    }

    #[test]
    fn reply_is_spoken_and_intent_published() {
        let (mut d, bus, said) = dialogue(Arc::new(CannedGenerator::new("It is noon. Anything else?")));
        let intents = record(&bus, "intent_QUERY");
        let states = record(&bus, topics::USER_STATE_UPDATED);

        match d.handle("What time is it?") {
            Exchange::Replied { intent, reply, acknowledged } => {
                assert_eq!(intent, "QUERY");
                assert_eq!(reply.outcome, PlaybackOutcome::Completed);
                assert!(!acknowledged);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(*said.lock(), vec!["It is noon.", "Anything else?"]);
        assert_eq!(*intents.lock(), vec![json!("What time is it?")]);
        assert_eq!(states.lock()[0], serde_json::to_value(UserState::default()).unwrap());
        assert_eq!(d.session().len(), 2);
    }

    struct Urgent;
    impl SalienceScorer for Urgent {
        fn score(&self, _: &str) -> u8 {
            10
        }
    }

    #[test]
    fn high_salience_is_announced() {
        let (d, bus, _) = dialogue(Arc::new(CannedGenerator::new("On it.")));
        let mut d = d.with_collaborators(Collaborators {
            salience: Arc::new(Urgent),
            ..Collaborators::default()
        });
        let alarms = record(&bus, topics::HIGH_SALIENCE_EVENT);
        d.handle("the server room is on fire");
        assert_eq!(*alarms.lock(), vec![json!("the server room is on fire")]);
    }

    #[test]
    fn habit_short_circuits_generation() {
        let dir = tempfile::tempdir().unwrap();
        let (d, bus, said) = dialogue(Arc::new(CannedGenerator::new("should not be spoken")));
        let habits = Arc::new(HabitBook::open(dir.path().join("h.json"), bus.clone()).unwrap());
        let mut d = d.with_habits(habits);
        let routed = record(&bus, "intent_CHAT");

        assert!(matches!(d.handle("Hello, Atlas!"), Exchange::Habit(_)));
        assert_eq!(*said.lock(), vec!["Good to see you, Sir."]);
        assert!(routed.lock().is_empty());
    }

    struct Down;
    impl ResponseGenerator for Down {
        fn generate(&self, _: &str, _: &[ChatMessage]) -> VoiceResult<FragmentStream> {
            Err(VoiceError::Llm("503".into()))
        }
    }

    #[test]
    fn generator_failure_speaks_fallback() {
        let (mut d, _, said) = dialogue(Arc::new(Down));
        d.handle("hello there");
        assert_eq!(*said.lock(), vec![DialogueConfig::default().fallback_reply]);
    }

    struct Echo {
        seen: Mutex<Vec<(String, usize)>>,
    }
    impl ResponseGenerator for Echo {
        fn generate(&self, prompt: &str, history: &[ChatMessage]) -> VoiceResult<FragmentStream> {
            self.seen.lock().push((prompt.to_string(), history.len()));
            Ok(Box::new(std::iter::once("Noted.".to_string())))
        }
    }

    #[test]
    fn history_is_bounded_and_memory_prefixes_prompt() {
        let echo = Arc::new(Echo { seen: Mutex::new(Vec::new()) });
        let (d, _, _) = dialogue(echo.clone());
        let mut d = d.with_collaborators(Collaborators {
            memory: Arc::new(FactList::new(["Sir drinks earl grey tea"])),
            ..Collaborators::default()
        });

        for i in 0..8 {
            d.handle(&format!("message number {}", i));
        }
        d.handle("make me some tea");

        let seen = echo.seen.lock();
        assert_eq!(seen[0].1, 0);
        assert_eq!(seen.last().map(|s| s.1), Some(10));
        assert!(seen.last().map_or(false, |s| s.0.starts_with("Relevant memories:\n- Sir drinks earl grey tea")));
        assert_eq!(d.history().len(), 10);
        assert_eq!(d.session().len(), 18);
    }

    struct Recorder(Mutex<Vec<usize>>);
    impl SessionArchiver for Recorder {
        fn archive(&self, session: &SessionRecord) -> VoiceResult<()> {
            self.0.lock().push(session.messages.len());
            Ok(())
        }
    }

    #[test]
    fn archives_only_long_sessions() {
        let archiver = Arc::new(Recorder(Mutex::new(Vec::new())));
        let (d, _, _) = dialogue(Arc::new(CannedGenerator::new("Sure.")));
        let mut d = d.with_collaborators(Collaborators {
            archiver: archiver.clone(),
            ..Collaborators::default()
        });

        d.handle("one");
        assert!(!d.finish());
        d.handle("two");
        assert!(d.finish());
        assert_eq!(*archiver.0.lock(), vec![4]);
    }

    struct Moody;
    impl MoodAnalyzer for Moody {
        fn analyze(&self, text: &str) -> UserState {
            let mood = if text.contains("great") {
                "positive"
            } else if text.contains("useless") {
                "frustrated"
            } else {
                "neutral"
            };
            UserState {
                mood: mood.to_string(),
                ..UserState::default()
            }
        }
    }

    #[test]
    fn mood_reinforces_the_previous_intent() {
        let dir = tempfile::tempdir().unwrap();
        let rewards = Arc::new(RewardBook::open(dir.path().join("rewards.json")));
        let (d, bus, _) = dialogue(Arc::new(CannedGenerator::new("Right away.")));
        let mut d = d.with_rewards(rewards.clone()).with_collaborators(Collaborators {
            mood: Arc::new(Moody),
            ..Collaborators::default()
        });
        let applied = record(&bus, topics::REWARD_APPLIED);

        d.handle("great to be back");
        d.handle("What time is it?");
        d.handle("that answer was useless");

        assert!((rewards.weight("CHAT") - 1.1).abs() < 1e-5);
        assert!((rewards.weight("QUERY") - 0.9).abs() < 1e-5);
        let applied = applied.lock();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0]["intent"], json!("CHAT"));
        assert_eq!(applied[1]["intent"], json!("QUERY"));
        assert_eq!(applied[1]["positive"], json!(false));
        assert!(dir.path().join("rewards.json").exists());
    }

    #[test]
    fn greeting_is_generated_with_time_and_memory() {
        let greeter = Arc::new(Echo { seen: Mutex::new(Vec::new()) });
        let (d, _, said) = dialogue(Arc::new(CannedGenerator::new("unused")));
        let d = d.with_collaborators(Collaborators {
            memory: Arc::new(FactList::new(["Sir prefers espresso before noon"])),
            greeter: Some(greeter.clone()),
            ..Collaborators::default()
        });

        d.greet();
        assert_eq!(*said.lock(), vec!["Noted."]);
        let prompt = greeter.seen.lock()[0].0.clone();
        assert!(["Morning", "Afternoon", "Evening", "Late Night"]
            .iter()
            .any(|p| prompt.contains(&format!("It is currently {}.", p))));
        assert!(prompt.contains("Known fact:\nSir prefers espresso before noon"));
    }

    #[test]
    fn greeting_falls_back_to_configured_lines() {
        let (d, _, said) = dialogue(Arc::new(CannedGenerator::new("unused")));
        d.greet();
        let d = d.with_collaborators(Collaborators {
            greeter: Some(Arc::new(Down)),
            ..Collaborators::default()
        });
        d.farewell();
        let config = DialogueConfig::default();
        assert_eq!(*said.lock(), vec![config.greeting, config.farewell]);
    }

    #[test]
    fn parts_of_day() {
        assert_eq!(part_of_day(5), "Morning");
        assert_eq!(part_of_day(12), "Afternoon");
        assert_eq!(part_of_day(21), "Evening");
        assert_eq!(part_of_day(2), "Late Night");
    }

    #[test]
    fn run_stops_on_exit_and_disconnect() {
        let (mut d, _, said) = dialogue(Arc::new(CannedGenerator::new("Fine.")));
        let shutdown = ShutdownSignal::new();

        let (tx, rx) = std::sync::mpsc::channel();
        tx.send("hi there".to_string()).unwrap();
        tx.send("sleep".to_string()).unwrap();
        tx.send("still queued".to_string()).unwrap();
        d.run(&rx, &shutdown);
        assert_eq!(d.session().len(), 2);

        drop(tx);
        d.run(&rx, &shutdown);
        assert_eq!(said.lock().len(), 2);
    }
}
