//! Rejects transcripts that are almost certainly STT hallucinations.
//!
//! Whisper-style models invent text for near-silent or noisy input: stock
//! sign-offs ("thank you", "subscribe"), loops of the same word, fragments.

use crate::config::FilterConfig;
use std::collections::HashSet;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept(String),
    Reject(&'static str),
}

#[derive(Debug, Clone)]
pub struct TranscriptFilter {
    config: FilterConfig,
}

impl TranscriptFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    /// Audio too quiet to be worth sending to STT.
    pub fn below_amplitude_floor(&self, mean_abs: f32) -> bool {
        mean_abs < self.config.amplitude_floor
    }

    pub fn check(&self, raw: &str) -> Verdict {
        let text = raw.trim();
        if text.chars().count() < self.config.min_chars {
            return Verdict::Reject("too short");
        }

        let words: Vec<String> = text
            .split_whitespace()
            .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric() && c != '\'').to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();

        if words.len() > self.config.repeat_min_words
            && words.windows(3).any(|w| w[0] == w[1] && w[1] == w[2])
        {
            return Verdict::Reject("repeated tokens");
        }

        let normalized = text.to_lowercase();
        let normalized = normalized.trim_matches('.');
        if text.len() < self.config.junk_max_len
            && self.config.junk_phrases.iter().any(|p| p.eq_ignore_ascii_case(normalized))
        {
            return Verdict::Reject("junk phrase");
        }

        if words.len() >= self.config.diversity_min_words {
            let unique: HashSet<&String> = words.iter().collect();
            let diversity = unique.len() as f32 / words.len() as f32;
            if diversity < self.config.min_diversity {
                return Verdict::Reject("low lexical diversity");
            }
        }

        Verdict::Accept(text.to_string())
    }
}

impl Default for TranscriptFilter {
    fn default() -> Self {
        Self::new(FilterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_normal_sentence() {
        let f = TranscriptFilter::default();
        assert_eq!(
            f.check("  What is the weather like today?  "),
            Verdict::Accept("What is the weather like today?".into())
        );
    }

    #[test]
    fn rejects_short_text() {
        let f = TranscriptFilter::default();
        assert_eq!(f.check("hm"), Verdict::Reject("too short"));
    }

    #[test]
    fn rejects_junk_phrases() {
        let f = TranscriptFilter::default();
        assert_eq!(f.check("Thank you."), Verdict::Reject("junk phrase"));
        assert_eq!(f.check("Okay"), Verdict::Reject("junk phrase"));
        assert!(matches!(f.check("Thank you for the help today"), Verdict::Accept(_)));
    }

    #[test]
    fn rejects_three_in_a_row() {
        let f = TranscriptFilter::default();
        assert_eq!(
            f.check("so I went to the the the store"),
            Verdict::Reject("repeated tokens")
        );
        // too few words for the repetition rule
        assert!(matches!(f.check("no no no way"), Verdict::Accept(_)));
    }

    #[test]
    fn rejects_low_diversity() {
        let f = TranscriptFilter::default();
        assert_eq!(
            f.check("go stop go stop go stop go stop go stop"),
            Verdict::Reject("low lexical diversity")
        );
    }

    #[test]
    fn amplitude_floor() {
        let f = TranscriptFilter::default();
        assert!(f.below_amplitude_floor(0.001));
        assert!(!f.below_amplitude_floor(0.05));
    }
}
