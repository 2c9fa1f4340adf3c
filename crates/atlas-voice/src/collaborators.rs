//! Analysis collaborators consulted by the reactive loop.
//!
//! Each one is a small trait with a cheap default so the loop runs without
//! any model behind it. The `Generator*` implementations ask the configured
//! [`ResponseGenerator`] for a one-line classification and fall back to the
//! default answer on any failure.

use crate::error::VoiceResult;
use crate::llm::{ChatMessage, ResponseGenerator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Intents the router may produce.
pub const INTENTS: [&str; 5] = ["CHAT", "COMMAND", "MEMORY", "QUERY", "IMAGINE"];

pub trait IntentRouter: Send + Sync {
    /// One of [`INTENTS`].
    fn route(&self, text: &str) -> String;
}

pub trait SalienceScorer: Send + Sync {
    /// Urgency in `1..=10`.
    fn score(&self, text: &str) -> u8;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserState {
    pub mood: String,
    pub urgency: String,
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            mood: "neutral".to_string(),
            urgency: "low".to_string(),
        }
    }
}

pub trait MoodAnalyzer: Send + Sync {
    fn analyze(&self, text: &str) -> UserState;
}

pub trait MemoryRecall: Send + Sync {
    /// Up to `limit` stored facts relevant to `query`, best first.
    fn recall(&self, query: &str, limit: usize) -> Vec<String>;
}

/// A finished conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub messages: Vec<ChatMessage>,
}

pub trait SessionArchiver: Send + Sync {
    fn archive(&self, session: &SessionRecord) -> VoiceResult<()>;
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Keyword heuristics; never calls out.
#[derive(Debug, Default, Clone)]
pub struct KeywordIntentRouter;

impl IntentRouter for KeywordIntentRouter {
    fn route(&self, text: &str) -> String {
        let lower = text.trim().to_lowercase();
        let starts = |prefixes: &[&str]| prefixes.iter().any(|p| lower.starts_with(p));

        let intent = if starts(&["remember", "recall", "what did i", "do you remember"]) {
            "MEMORY"
        } else if starts(&["imagine", "what if", "brainstorm", "invent", "hypothesize"]) {
            "IMAGINE"
        } else if starts(&["open", "start", "stop", "set", "turn", "play", "run", "close"]) {
            "COMMAND"
        } else if lower.ends_with('?') || starts(&["what", "why", "how", "when", "where", "who"]) {
            "QUERY"
        } else {
            "CHAT"
        };
        intent.to_string()
    }
}

/// Scores everything as routine.
#[derive(Debug, Default, Clone)]
pub struct NeutralSalience;

impl SalienceScorer for NeutralSalience {
    fn score(&self, _text: &str) -> u8 {
        5
    }
}

#[derive(Debug, Default, Clone)]
pub struct NeutralMood;

impl MoodAnalyzer for NeutralMood {
    fn analyze(&self, _text: &str) -> UserState {
        UserState::default()
    }
}

/// No long-term memory.
#[derive(Debug, Default, Clone)]
pub struct NoMemory;

impl MemoryRecall for NoMemory {
    fn recall(&self, _query: &str, _limit: usize) -> Vec<String> {
        Vec::new()
    }
}

/// In-memory fact list ranked by words shared with the query. Words match
/// on a common stem of at least five characters, so "projects" finds
/// "project" and "preferences" finds "prefers".
#[derive(Debug, Default, Clone)]
pub struct FactList {
    facts: Vec<String>,
}

impl FactList {
    pub fn new<I, S>(facts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            facts: facts.into_iter().map(Into::into).collect(),
        }
    }
}

const STEM_LEN: usize = 5;

fn same_stem(a: &str, b: &str) -> bool {
    a == b || a.chars().zip(b.chars()).take_while(|(x, y)| x == y).count() >= STEM_LEN
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(str::to_lowercase)
        .collect()
}

impl MemoryRecall for FactList {
    fn recall(&self, query: &str, limit: usize) -> Vec<String> {
        let query = words(query);
        let mut ranked: Vec<(usize, &String)> = self
            .facts
            .iter()
            .map(|f| {
                let hits = words(f)
                    .iter()
                    .filter(|w| query.iter().any(|q| same_stem(q, w)))
                    .count();
                (hits, f)
            })
            .filter(|(hits, _)| *hits > 0)
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));
        ranked.into_iter().take(limit).map(|(_, f)| f.clone()).collect()
    }
}

/// Drops sessions.
#[derive(Debug, Default, Clone)]
pub struct DiscardArchiver;

impl SessionArchiver for DiscardArchiver {
    fn archive(&self, session: &SessionRecord) -> VoiceResult<()> {
        debug!(messages = session.messages.len(), "session discarded");
        Ok(())
    }
}

/// Writes each session to `<dir>/session_<timestamp>.json`.
#[derive(Debug, Clone)]
pub struct JsonFileArchiver {
    dir: PathBuf,
}

impl JsonFileArchiver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl SessionArchiver for JsonFileArchiver {
    fn archive(&self, session: &SessionRecord) -> VoiceResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        let name = format!("session_{}.json", session.started_at.format("%Y%m%d_%H%M%S"));
        let path = self.dir.join(name);
        std::fs::write(&path, serde_json::to_vec_pretty(session)?)?;
        info!(path = %path.display(), messages = session.messages.len(), "session archived");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Generator-backed
// ---------------------------------------------------------------------------

fn ask(generator: &dyn ResponseGenerator, prompt: &str) -> Option<String> {
    match generator.generate(prompt, &[]) {
        Ok(stream) => Some(stream.collect::<String>().trim().to_string()),
        Err(e) => {
            warn!(error = %e, "classification request failed");
            None
        }
    }
}

pub struct GeneratorIntentRouter {
    generator: Arc<dyn ResponseGenerator>,
}

impl GeneratorIntentRouter {
    pub fn new(generator: Arc<dyn ResponseGenerator>) -> Self {
        Self { generator }
    }
}

impl IntentRouter for GeneratorIntentRouter {
    fn route(&self, text: &str) -> String {
        let prompt = format!(
            "Categorize intent as EXACTLY ONE word from this list: CHAT, COMMAND, MEMORY, QUERY, IMAGINE.\n\
             - Use MEMORY for recalling facts or past conversations.\n\
             - Use IMAGINE if the user asks to hypothesize, brainstorm, or invent.\n\
             Output nothing but the single word.\nInput: {}\nIntent:",
            text
        );
        let answer: String = ask(self.generator.as_ref(), &prompt)
            .unwrap_or_default()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        if INTENTS.contains(&answer.as_str()) {
            answer
        } else {
            "CHAT".to_string()
        }
    }
}

pub struct GeneratorSalience {
    generator: Arc<dyn ResponseGenerator>,
}

impl GeneratorSalience {
    pub fn new(generator: Arc<dyn ResponseGenerator>) -> Self {
        Self { generator }
    }
}

impl SalienceScorer for GeneratorSalience {
    fn score(&self, text: &str) -> u8 {
        let prompt = format!(
            "Rate the urgency/importance of this input from 1 to 10. Output ONLY the integer.\nInput: {}\nScore:",
            text
        );
        ask(self.generator.as_ref(), &prompt)
            .and_then(|s| s.parse::<i64>().ok())
            .map_or(5, |n| n.clamp(1, 10) as u8)
    }
}

pub struct GeneratorMood {
    generator: Arc<dyn ResponseGenerator>,
}

impl GeneratorMood {
    pub fn new(generator: Arc<dyn ResponseGenerator>) -> Self {
        Self { generator }
    }
}

/// Parses `Mood=<word>, Urgency=<word>`.
pub fn parse_user_state(line: &str) -> UserState {
    let mut state = UserState::default();
    if let Some(rest) = line.split("Mood=").nth(1) {
        let mood = rest.split(',').next().unwrap_or("").trim().to_lowercase();
        if !mood.is_empty() {
            state.mood = mood;
        }
    }
    if let Some(rest) = line.split("Urgency=").nth(1) {
        let urgency = rest.trim().to_lowercase();
        if !urgency.is_empty() {
            state.urgency = urgency;
        }
    }
    state
}

impl MoodAnalyzer for GeneratorMood {
    fn analyze(&self, text: &str) -> UserState {
        let prompt = format!(
            "Analyze the text and output EXACTLY one line in this format: Mood=[word], Urgency=[word]\n\
             Options for Mood: positive, neutral, frustrated, panicked.\n\
             Options for Urgency: low, high.\n\n\
             Text: 'This is brilliant work!'\nOutput: Mood=positive, Urgency=low\n\n\
             Text: 'My hard drive just crashed, help me!'\nOutput: Mood=panicked, Urgency=high\n\n\
             Text: '{}'\nOutput:",
            text
        );
        ask(self.generator.as_ref(), &prompt)
            .map(|line| parse_user_state(&line))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VoiceError;
    use crate::llm::{CannedGenerator, FragmentStream};

    #[test]
    fn keyword_router_buckets() {
        let r = KeywordIntentRouter;
        assert_eq!(r.route("Remember that I like tea"), "MEMORY");
        assert_eq!(r.route("What if gravity were weaker"), "IMAGINE");
        assert_eq!(r.route("open the pod bay doors"), "COMMAND");
        assert_eq!(r.route("Is it raining?"), "QUERY");
        assert_eq!(r.route("nice weather today"), "CHAT");
    }

    #[test]
    fn generator_router_normalizes_and_falls_back() {
        let r = GeneratorIntentRouter::new(Arc::new(CannedGenerator::new("query.")));
        assert_eq!(r.route("anything"), "QUERY");
        let r = GeneratorIntentRouter::new(Arc::new(CannedGenerator::new("DANCE")));
        assert_eq!(r.route("anything"), "CHAT");
    }

    struct Failing;
    impl ResponseGenerator for Failing {
        fn generate(&self, _: &str, _: &[ChatMessage]) -> VoiceResult<FragmentStream> {
            Err(VoiceError::Llm("offline".into()))
        }
    }

    #[test]
    fn salience_is_clamped_with_default() {
        assert_eq!(GeneratorSalience::new(Arc::new(CannedGenerator::new("42"))).score("x"), 10);
        assert_eq!(GeneratorSalience::new(Arc::new(CannedGenerator::new("9"))).score("x"), 9);
        assert_eq!(GeneratorSalience::new(Arc::new(CannedGenerator::new("urgent"))).score("x"), 5);
        assert_eq!(GeneratorSalience::new(Arc::new(Failing)).score("x"), 5);
    }

    #[test]
    fn parses_mood_line() {
        let s = parse_user_state("Mood=Panicked, Urgency=HIGH");
        assert_eq!(s.mood, "panicked");
        assert_eq!(s.urgency, "high");
        assert_eq!(parse_user_state("no idea"), UserState::default());
        assert_eq!(GeneratorMood::new(Arc::new(Failing)).analyze("x"), UserState::default());
    }

    #[test]
    fn fact_list_ranks_by_overlap() {
        let m = FactList::new(["Sir prefers 63/37 solder wire", "The lab printer is offline", "Solder station runs at 350C"]);
        let hits = m.recall("which solder wire do I use", 2);
        assert_eq!(hits[0], "Sir prefers 63/37 solder wire");
        assert_eq!(hits.len(), 2);
        assert!(m.recall("quantum", 3).is_empty());
    }

    #[test]
    fn fact_list_matches_word_stems() {
        let m = FactList::new(["Sir is building a solder reflow oven", "Sir prefers 63/37 solder wire"]);
        assert_eq!(m.recall("preferences", 1), vec!["Sir prefers 63/37 solder wire".to_string()]);
        assert_eq!(m.recall("reflowing", 1), vec!["Sir is building a solder reflow oven".to_string()]);
        assert!(m.recall("prep", 1).is_empty());
    }

    #[test]
    fn json_archiver_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = JsonFileArchiver::new(dir.path().join("sessions"));
        let session = SessionRecord {
            started_at: Utc::now(),
            ended_at: Utc::now(),
            messages: vec![ChatMessage::user("hi"), ChatMessage::assistant("hello")],
        };
        archiver.archive(&session).unwrap();

        let files: Vec<_> = std::fs::read_dir(dir.path().join("sessions")).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        let back: SessionRecord = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(back.messages, session.messages);
    }
}
