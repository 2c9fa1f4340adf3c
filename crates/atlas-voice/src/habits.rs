//! Learned reflexes: exact phrases answered instantly without generation.

use crate::bus::{topics, EventBus};
use crate::error::{VoiceError, VoiceResult};
use parking_lot::RwLock;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Lowercase, punctuation removed, whitespace trimmed.
pub fn normalize_trigger(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| !c.is_ascii_punctuation())
        .collect::<String>()
        .trim()
        .to_string()
}

fn default_habits() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("hello atlas".to_string(), "Good to see you, Sir.".to_string()),
        ("status report".to_string(), "All core systems nominal, Sir.".to_string()),
    ])
}

/// Trigger → response map persisted as pretty JSON.
pub struct HabitBook {
    path: PathBuf,
    habits: RwLock<BTreeMap<String, String>>,
    bus: Arc<EventBus>,
}

impl HabitBook {
    /// Load from `path`, seeding the defaults when the file is missing or
    /// unreadable.
    pub fn open(path: impl Into<PathBuf>, bus: Arc<EventBus>) -> VoiceResult<Self> {
        let path = path.into();
        let habits: Option<BTreeMap<String, String>> = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(h) => Some(h),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "habit file unreadable; reseeding defaults");
                    None
                }
            },
            Err(_) => None,
        };
        let book = Self {
            path,
            habits: RwLock::new(habits.clone().unwrap_or_else(default_habits)),
            bus,
        };
        if habits.is_none() {
            book.save()?;
        }
        info!(count = book.len(), "habits loaded");
        Ok(book)
    }

    /// Subscribe to `learn_new_habit` so other components can teach new reflexes.
    pub fn listen(self: &Arc<Self>) {
        let book = Arc::clone(self);
        self.bus.subscribe(topics::LEARN_NEW_HABIT, move |event| {
            let trigger = event.payload["trigger"].as_str().unwrap_or_default();
            let response = event.payload["response"].as_str().unwrap_or_default();
            if trigger.is_empty() || response.is_empty() {
                anyhow::bail!("learn_new_habit needs both trigger and response");
            }
            book.learn(trigger, response)?;
            Ok(())
        });
    }

    pub fn learn(&self, trigger: &str, response: &str) -> VoiceResult<()> {
        let trigger = normalize_trigger(trigger);
        if trigger.is_empty() {
            return Err(VoiceError::Config("habit trigger is empty after normalization".into()));
        }
        self.habits.write().insert(trigger.clone(), response.to_string());
        self.save()?;
        info!(trigger = %trigger, "new habit formed");
        Ok(())
    }

    /// Canned response for `text`, publishing `habit_triggered` on a hit.
    pub fn check(&self, text: &str) -> Option<String> {
        let key = normalize_trigger(text);
        let response = self.habits.read().get(&key).cloned()?;
        self.bus.publish(topics::HABIT_TRIGGERED, json!(key));
        Some(response)
    }

    pub fn len(&self) -> usize {
        self.habits.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self) -> VoiceResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let bytes = serde_json::to_vec_pretty(&*self.habits.read())?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}
