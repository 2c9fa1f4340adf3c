//! Splits a token stream from the generator into speakable sentences.
//!
//! Synthesis starts as soon as the first sentence is complete instead of after
//! the whole reply. A period is only a boundary when it plausibly ends a
//! sentence: not after short tokens ("Mr.", "ok."), not inside abbreviations
//! ("e.g.") and not inside numbers ("3.14", or "3." still waiting for digits).

#[derive(Debug, Default, Clone)]
pub struct SentenceChunker {
    buffer: String,
}

/// Characters that may trail a terminator and belong to the same sentence.
fn is_trailer(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '"' | '\'' | ')')
}

impl SentenceChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a fragment; returns every sentence it completed.
    pub fn push(&mut self, fragment: &str) -> Vec<String> {
        self.buffer
            .extend(fragment.chars().filter(|c| *c != '*' && *c != '#'));

        let mut out = Vec::new();
        let mut from = 0;
        while let Some(end) = self.boundary_after(from) {
            let candidate = self.buffer[..end].trim();
            if candidate.chars().count() > 1 {
                out.push(candidate.to_string());
                self.buffer.drain(..end);
                from = 0;
            } else {
                // Too short to speak on its own; carry it into the next one.
                from = end;
            }
        }
        out
    }

    /// Whatever is left once the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim();
        (rest.chars().count() > 1).then(|| rest.to_string())
    }

    fn boundary_after(&self, from: usize) -> Option<usize> {
        let buf = &self.buffer;
        for (i, c) in buf[from..].char_indices().map(|(i, c)| (i + from, c)) {
            let ends = match c {
                '!' | '?' | '\n' => true,
                '.' => self.period_ends_sentence(i),
                _ => false,
            };
            if ends {
                let mut end = i + c.len_utf8();
                if c != '\n' {
                    for t in buf[end..].chars() {
                        if !is_trailer(t) {
                            break;
                        }
                        end += t.len_utf8();
                    }
                }
                return Some(end);
            }
        }
        None
    }

    fn period_ends_sentence(&self, i: usize) -> bool {
        let buf = &self.buffer;
        let next = buf[i + 1..].chars().next();
        if next.map_or(false, |c| c.is_ascii_digit()) {
            return false;
        }

        let before = &buf[..i];
        if before.ends_with(char::is_whitespace) {
            return true;
        }
        let token = before.split_whitespace().last().unwrap_or("");
        let token = token.trim_start_matches(|c: char| matches!(c, '"' | '\'' | '('));

        if next.is_none() && !token.is_empty() && token.chars().all(|c| c.is_ascii_digit()) {
            // "3." at the end of the buffer may still become "3.5".
            return false;
        }
        if token.contains('.') {
            return false;
        }
        token.chars().count() > 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parts: &[&str]) -> Vec<String> {
        let mut c = SentenceChunker::new();
        let mut out: Vec<String> = parts.iter().flat_map(|p| c.push(p)).collect();
        out.extend(c.finish());
        out
    }

    #[test]
    fn splits_streamed_tokens() {
        let out = feed(&["Hello", " there", ". How", " are you", "? Fine", "!"]);
        assert_eq!(out, vec!["Hello there.", "How are you?", "Fine!"]);
    }

    #[test]
    fn keeps_decimals_together() {
        let out = feed(&["Pi is about 3", ".", "14 today. Done"]);
        assert_eq!(out, vec!["Pi is about 3.14 today.", "Done"]);
    }

    #[test]
    fn short_tokens_and_abbreviations_do_not_split() {
        let out = feed(&["Ask Mr. Smith, e.g. tomorrow. Thanks."]);
        assert_eq!(out, vec!["Ask Mr. Smith, e.g. tomorrow.", "Thanks."]);
    }

    #[test]
    fn strips_markdown() {
        let out = feed(&["**Bold** move", "!\n## Next line\n"]);
        assert_eq!(out, vec!["Bold move!", "Next line"]);
    }

    #[test]
    fn newline_is_a_boundary() {
        let out = feed(&["first line\nsecond line"]);
        assert_eq!(out, vec!["first line", "second line"]);
    }

    #[test]
    fn terminator_runs_stay_attached() {
        let out = feed(&["Really?! Yes..."]);
        assert_eq!(out, vec!["Really?!", "Yes..."]);
    }

    #[test]
    fn single_char_is_carried_over() {
        let mut c = SentenceChunker::new();
        assert!(c.push("A!").len() == 1);
        assert!(c.push("\n").is_empty());
        assert_eq!(c.push("ok then!"), vec!["ok then!"]);
    }
}
