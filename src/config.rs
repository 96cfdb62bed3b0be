//! Process settings read from the environment (after `dotenvy`).

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DiscoveryError, Result};
use crate::layers::guard::{GuardConfig, RateLimitMode};
use crate::layers::DiscoverySource;

pub const DEFAULT_MAX_CONCURRENT_REQUESTS: usize = 32;
const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone, PartialEq)]
pub struct LlmSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub semantic_scholar_api_key: Option<String>,
    pub openalex_email: Option<String>,
    /// `None` when neither `LLM_BASE_URL` nor `LLM_API_KEY` is set.
    pub llm: Option<LlmSettings>,
    pub max_concurrent_requests: usize,
    pub requests_per_minute: BTreeMap<DiscoverySource, u32>,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown: Duration,
    pub rate_limit_mode: RateLimitMode,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = GuardConfig::default();
        Self {
            semantic_scholar_api_key: None,
            openalex_email: None,
            llm: None,
            max_concurrent_requests: DEFAULT_MAX_CONCURRENT_REQUESTS,
            requests_per_minute: DiscoverySource::ALL
                .into_iter()
                .map(|s| (s, GuardConfig::for_source(s).requests_per_minute))
                .collect(),
            circuit_failure_threshold: defaults.failure_threshold,
            circuit_cooldown: defaults.cooldown,
            rate_limit_mode: defaults.mode,
        }
    }
}

/// Prefix of the `<PREFIX>_REQUESTS_PER_MINUTE` variable for a source.
pub fn env_prefix(source: DiscoverySource) -> &'static str {
    match source {
        DiscoverySource::BibliographicIndex => "OPENALEX",
        DiscoverySource::AcademicGraph => "SEMANTIC_SCHOLAR",
        DiscoverySource::RealtimeResearch => "ARXIV",
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Missing or blank values fall back to defaults; values that are present
    /// but do not parse are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Settings::default();

        let llm_base_url = get("LLM_BASE_URL");
        let llm_api_key = get("LLM_API_KEY");
        let llm = if llm_base_url.is_some() || llm_api_key.is_some() {
            Some(LlmSettings {
                base_url: llm_base_url.unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
                api_key: llm_api_key,
                model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
                timeout: Duration::from_secs(parse_or("LLM_TIMEOUT_SECS", get("LLM_TIMEOUT_SECS"), 30)?),
            })
        } else {
            None
        };

        let mut requests_per_minute = defaults.requests_per_minute.clone();
        for source in DiscoverySource::ALL {
            let key = format!("{}_REQUESTS_PER_MINUTE", env_prefix(source));
            if let Some(raw) = get(&key) {
                let rpm: u32 = parse_value(&key, &raw)?;
                if rpm == 0 {
                    return Err(DiscoveryError::Config(format!("{} must be positive", key)));
                }
                requests_per_minute.insert(source, rpm);
            }
        }

        let rate_limit_mode = match get("RATE_LIMIT_MODE").map(|m| m.to_ascii_lowercase()) {
            None => defaults.rate_limit_mode,
            Some(m) if m == "reject" => RateLimitMode::Reject,
            Some(m) if m == "queue" => RateLimitMode::Queue,
            Some(other) => {
                return Err(DiscoveryError::Config(format!(
                    "RATE_LIMIT_MODE must be 'reject' or 'queue', got '{}'",
                    other
                )))
            }
        };

        Ok(Self {
            semantic_scholar_api_key: get("SEMANTIC_SCHOLAR_API_KEY"),
            openalex_email: get("OPENALEX_EMAIL"),
            llm,
            max_concurrent_requests: parse_or(
                "MAX_CONCURRENT_REQUESTS",
                get("MAX_CONCURRENT_REQUESTS"),
                defaults.max_concurrent_requests,
            )?
            .max(1),
            requests_per_minute,
            circuit_failure_threshold: parse_or(
                "CIRCUIT_FAILURE_THRESHOLD",
                get("CIRCUIT_FAILURE_THRESHOLD"),
                defaults.circuit_failure_threshold,
            )?
            .max(1),
            circuit_cooldown: Duration::from_secs(parse_or(
                "CIRCUIT_COOLDOWN_SECS",
                get("CIRCUIT_COOLDOWN_SECS"),
                defaults.circuit_cooldown.as_secs(),
            )?),
            rate_limit_mode,
        })
    }

    /// Guard policy for one source: provider defaults overridden by settings.
    pub fn guard_config(&self, source: DiscoverySource) -> GuardConfig {
        let mut config = GuardConfig::for_source(source);
        if let Some(rpm) = self.requests_per_minute.get(&source) {
            config.requests_per_minute = *rpm;
        }
        config.failure_threshold = self.circuit_failure_threshold;
        config.cooldown = self.circuit_cooldown;
        config.mode = self.rate_limit_mode;
        config
    }
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| DiscoveryError::Config(format!("{}='{}': {}", key, raw, e)))
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match raw {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}
