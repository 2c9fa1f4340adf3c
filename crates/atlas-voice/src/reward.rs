//! Reinforcement of response pathways from the user's reaction.
//!
//! A positive mood after a reply strengthens the intent that produced it; a
//! frustrated one weakens it. Weights live in `[0.1, 2.0]`, start at 1.0 and
//! persist as JSON next to the habits.

use crate::error::VoiceResult;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MIN_WEIGHT: f32 = 0.1;
pub const MAX_WEIGHT: f32 = 2.0;
const STEP: f32 = 0.1;

/// How a mood verdict bears on the previous reply, if at all.
pub fn feedback_for(mood: &str) -> Option<bool> {
    match mood.trim().to_lowercase().as_str() {
        "positive" => Some(true),
        "frustrated" => Some(false),
        _ => None,
    }
}

pub struct RewardBook {
    path: PathBuf,
    weights: RwLock<BTreeMap<String, f32>>,
}

impl RewardBook {
    /// Load from `path`; a missing or unreadable file starts every pathway at 1.0.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let weights = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "reward file unreadable; starting fresh");
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path,
            weights: RwLock::new(weights),
        }
    }

    pub fn weight(&self, intent: &str) -> f32 {
        self.weights.read().get(intent).copied().unwrap_or(1.0)
    }

    /// Nudge `intent` up or down and persist. Returns the new weight.
    pub fn apply_feedback(&self, intent: &str, positive: bool) -> VoiceResult<f32> {
        let weight = {
            let mut weights = self.weights.write();
            let current = weights.get(intent).copied().unwrap_or(1.0);
            let delta = if positive { STEP } else { -STEP };
            let next = (current + delta).clamp(MIN_WEIGHT, MAX_WEIGHT);
            weights.insert(intent.to_string(), next);
            next
        };
        self.save()?;
        info!(intent, positive, weight, "reinforcement applied");
        Ok(weight)
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
        let bytes = serde_json::to_vec(&*self.weights.read())?;
        std::fs::write(&self.path, bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moods_map_to_feedback() {
        assert_eq!(feedback_for("Positive"), Some(true));
        assert_eq!(feedback_for("frustrated"), Some(false));
        assert_eq!(feedback_for("neutral"), None);
    }

    #[test]
    fn weights_are_clamped_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rewards.json");
        let book = RewardBook::open(&path);
        assert_eq!(book.weight("CHAT"), 1.0);

        for _ in 0..15 {
            book.apply_feedback("CHAT", true).unwrap();
        }
        assert_eq!(book.weight("CHAT"), MAX_WEIGHT);
        for _ in 0..30 {
            book.apply_feedback("QUERY", false).unwrap();
        }
        assert_eq!(book.weight("QUERY"), MIN_WEIGHT);

        let reopened = RewardBook::open(&path);
        assert_eq!(reopened.weight("CHAT"), MAX_WEIGHT);
        assert_eq!(reopened.weight("QUERY"), MIN_WEIGHT);
        assert_eq!(reopened.weight("MEMORY"), 1.0);
    }
}
