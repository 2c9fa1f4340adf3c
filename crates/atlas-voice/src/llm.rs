//! Response generation: streaming chat completions.
//!
//! The generator yields text fragments lazily so the speaker can start on the
//! first sentence while the rest is still being produced. Dropping the stream
//! closes the HTTP response, which is how an interrupted turn stops generation.

use crate::config::LlmConfig;
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One turn of conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Lazily produced text fragments.
pub type FragmentStream = Box<dyn Iterator<Item = String> + Send>;

pub trait ResponseGenerator: Send + Sync {
    fn generate(&self, prompt: &str, history: &[ChatMessage]) -> VoiceResult<FragmentStream>;
}

/// OpenAI-compatible `/chat/completions` with `stream: true` (OpenRouter by default).
#[derive(Debug, Clone)]
pub struct StreamingChatGenerator {
    base_url: String,
    api_key: String,
    model: String,
    temperature: f32,
    system_prompt: String,
    client: reqwest::blocking::Client,
}

impl StreamingChatGenerator {
    /// Key from `LLM_API_KEY` or `OPENROUTER_API_KEY`; `LLM_MODEL` overrides the model.
    pub fn from_env(llm: &LlmConfig, system_prompt: impl Into<String>) -> VoiceResult<Self> {
        let api_key = std::env::var("LLM_API_KEY")
            .or_else(|_| std::env::var("OPENROUTER_API_KEY"))
            .map_err(|_| VoiceError::Config("LLM requires LLM_API_KEY or OPENROUTER_API_KEY".to_string()))?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| llm.model.clone());
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(llm.request_timeout_secs))
            .build()
            .map_err(|e| VoiceError::Llm(e.to_string()))?;
        Ok(Self {
            base_url: llm.base_url.clone(),
            api_key,
            model,
            temperature: llm.temperature,
            system_prompt: system_prompt.into(),
            client,
        })
    }

    fn messages(&self, prompt: &str, history: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !self.system_prompt.is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(history.iter().cloned());
        messages.push(ChatMessage::user(prompt));
        messages
    }
}

impl ResponseGenerator for StreamingChatGenerator {
    fn generate(&self, prompt: &str, history: &[ChatMessage]) -> VoiceResult<FragmentStream> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": self.messages(prompt, history),
            "stream": true,
            "temperature": self.temperature,
        });
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("X-Title", "ATLAS")
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Llm(format!("Request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().unwrap_or_default();
            return Err(VoiceError::Llm(format!("API error {}: {}", status, text)));
        }

        let lines = BufReader::new(response).lines();
        Ok(Box::new(SseFragments { lines, done: false }))
    }
}

/// Iterates `data:` lines of a server-sent-event body, yielding content deltas.
struct SseFragments<L> {
    lines: L,
    done: bool,
}

impl<L> Iterator for SseFragments<L>
where
    L: Iterator<Item = std::io::Result<String>>,
{
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while !self.done {
            let line = match self.lines.next() {
                Some(Ok(line)) => line,
                Some(Err(e)) => {
                    warn!(error = %e, "stream read failed; ending response");
                    self.done = true;
                    break;
                }
                None => {
                    self.done = true;
                    break;
                }
            };
            match parse_sse_line(&line) {
                SseLine::Done => self.done = true,
                SseLine::Content(text) => return Some(text),
                SseLine::Skip => {}
            }
        }
        None
    }
}

#[derive(Debug, PartialEq)]
enum SseLine {
    Content(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> SseLine {
    let Some(payload) = line.strip_prefix("data:") else {
        return SseLine::Skip;
    };
    let payload = payload.trim();
    if payload == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<serde_json::Value>(payload) {
        Ok(json) => match json["choices"][0]["delta"]["content"].as_str() {
            Some(delta) if !delta.is_empty() => SseLine::Content(delta.to_string()),
            _ => SseLine::Skip,
        },
        Err(e) => {
            debug!(error = %e, "unparseable stream line");
            SseLine::Skip
        }
    }
}

/// Fixed reply, for running without an LLM.
#[derive(Debug, Clone)]
pub struct CannedGenerator {
    reply: String,
}

impl CannedGenerator {
    pub fn new(reply: impl Into<String>) -> Self {
        Self { reply: reply.into() }
    }
}

impl ResponseGenerator for CannedGenerator {
    fn generate(&self, _prompt: &str, _history: &[ChatMessage]) -> VoiceResult<FragmentStream> {
        let words: Vec<String> = self
            .reply
            .split_inclusive(' ')
            .map(str::to_string)
            .collect();
        Ok(Box::new(words.into_iter()))
    }
}

/// Remote streaming chat when a key is configured, otherwise the canned fallback.
pub fn create_best_generator(llm: &LlmConfig, system_prompt: &str, fallback: &str) -> Box<dyn ResponseGenerator> {
    match StreamingChatGenerator::from_env(llm, system_prompt) {
        Ok(g) => {
            info!(model = %g.model, "using streaming chat generator");
            Box::new(g)
        }
        Err(_) => {
            info!("no LLM configured; using canned replies");
            Box::new(CannedGenerator::new(fallback))
        }
    }
}
