//! Language-model relevance scoring.
//!
//! The model sees the source paper and a numbered batch of candidates and is
//! asked for one `Paper N: score X.XX` line per candidate. Anything else in the
//! reply is ignored.

use std::collections::HashMap;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::LlmError;
use crate::layers::{DiscoveredPaper, SourcePaper};

const EXCERPT_CHARS: usize = 300;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
    fn model_id(&self) -> &str;
}

/// Any OpenAI-compatible `/chat/completions` endpoint (OpenAI, Ollama,
/// vLLM, OpenRouter, ...).
pub struct OpenAiCompatibleModel {
    endpoint: Url,
    api_key: Option<String>,
    model: String,
    client: Client,
}

impl OpenAiCompatibleModel {
    pub fn new(base_url: &str, api_key: Option<String>, model: impl Into<String>) -> Result<Self, LlmError> {
        let mut base = base_url.trim().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let endpoint = Url::parse(&base)
            .and_then(|u| u.join("chat/completions"))
            .map_err(|e| LlmError::Unavailable(format!("invalid LLM base URL '{}': {}", base_url, e)))?;
        Ok(Self {
            endpoint,
            api_key,
            model: model.into(),
            client: Client::new(),
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAiCompatibleModel {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let messages = vec![
            Message {
                role: "system".into(),
                content: "You rate how related academic papers are. Reply only with score lines.".into(),
            },
            Message {
                role: "user".into(),
                content: prompt.to_string(),
            },
        ];
        let body = serde_json::json!({
            "model": &self.model,
            "messages": messages,
            "max_tokens": 512,
            "temperature": 0.0,
        });

        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;
        let status = resp.status().as_u16();
        let json: serde_json::Value = resp.json().await?;
        if status >= 400 {
            let message = json["error"]["message"]
                .as_str()
                .or_else(|| json["message"].as_str())
                .unwrap_or("unknown API error")
                .to_string();
            return Err(LlmError::Api { status, message });
        }

        match json["choices"][0]["message"]["content"].as_str() {
            Some(content) if !content.trim().is_empty() => Ok(content.to_string()),
            _ => Err(LlmError::EmptyCompletion),
        }
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// First `max_chars` characters, cut on a char boundary.
fn excerpt(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn build_batch_prompt(source: &SourcePaper, batch: &[DiscoveredPaper]) -> String {
    let mut prompt = String::new();
    prompt.push_str("Source paper:\n");
    prompt.push_str(&format!("Title: {}\n", source.title));
    if let Some(abs) = &source.abstract_text {
        prompt.push_str(&format!("Abstract: {}\n", excerpt(abs, EXCERPT_CHARS)));
    }
    prompt.push_str("\nRate how relevant each candidate is to the source paper on a scale from 0.00 to 1.00.\n\n");

    for (i, paper) in batch.iter().enumerate() {
        prompt.push_str(&format!("Paper {}:\n", i + 1));
        prompt.push_str(&format!("Title: {}\n", paper.title));
        prompt.push_str(&format!("Relationship: {}\n", paper.relationship));
        if let Some(abs) = &paper.abstract_text {
            prompt.push_str(&format!("Abstract: {}\n", excerpt(abs, EXCERPT_CHARS)));
        }
        prompt.push('\n');
    }

    prompt.push_str("Answer with exactly one line per candidate in the form `Paper N: score X.XX`.\n");
    prompt
}

fn score_line() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\bpaper\s*#?\s*(\d+)\s*[:\-=)]\s*(?:\*\*)?\s*(?:score\s*[:=]?\s*)?(\d+(?:\.\d+)?)")
            .expect("score line pattern is valid")
    })
}

/// Batch index (0-based) -> score. Lines that do not parse, point outside the
/// batch or carry a score outside `[0, 1]` are skipped; the first score for
/// an index wins.
pub fn parse_scores(response: &str, batch_len: usize) -> HashMap<usize, f64> {
    let mut scores = HashMap::new();
    for line in response.lines() {
        let Some(caps) = score_line().captures(line) else {
            continue;
        };
        let (Ok(number), Ok(score)) = (caps[1].parse::<usize>(), caps[2].parse::<f64>()) else {
            continue;
        };
        if number == 0 || number > batch_len || !(0.0..=1.0).contains(&score) {
            continue;
        }
        scores.entry(number - 1).or_insert(score);
    }
    scores
}
