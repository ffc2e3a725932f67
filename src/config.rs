//! Runtime configuration loaded from the environment
//!
//! Binaries call `dotenv::dotenv()` first so a local `.env` file is honoured.

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Exponential backoff settings for model calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based), doubling up to `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub gemini_base_url: String,
    /// Tool rounds allowed per user message
    pub max_tool_rounds: u32,
    pub tool_timeout: Duration,
    pub retry: RetryPolicy,
    pub streaming: bool,
    pub api_port: u16,
    /// Live chats the API keeps before evicting the oldest idle one
    pub max_chats: usize,
    /// Archived sessions kept before the oldest is dropped
    pub archive_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: String::new(),
            gemini_model: DEFAULT_MODEL.to_string(),
            gemini_base_url: DEFAULT_BASE_URL.to_string(),
            max_tool_rounds: 8,
            tool_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            streaming: false,
            api_port: 8080,
            max_chats: 1000,
            archive_capacity: 1000,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_retries: parse_or(&lookup, "MODEL_MAX_RETRIES", defaults.retry.max_retries)?,
            initial_delay: Duration::from_millis(parse_or(
                &lookup,
                "MODEL_RETRY_INITIAL_MS",
                defaults.retry.initial_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(parse_or(
                &lookup,
                "MODEL_RETRY_MAX_MS",
                defaults.retry.max_delay.as_millis() as u64,
            )?),
        };

        let api_port = match lookup("PORT").or_else(|| lookup("API_PORT")) {
            Some(raw) => parse_value("PORT", &raw)?,
            None => defaults.api_port,
        };

        let max_tool_rounds = parse_or(&lookup, "MAX_TOOL_ROUNDS", defaults.max_tool_rounds)?;
        if max_tool_rounds == 0 {
            return Err(OrchestrationError::Config(
                "MAX_TOOL_ROUNDS must be at least 1".to_string(),
            ));
        }

        let max_chats = parse_or(&lookup, "MAX_CHATS", defaults.max_chats)?;
        let archive_capacity = parse_or(&lookup, "ARCHIVE_CAPACITY", defaults.archive_capacity)?;
        if max_chats == 0 || archive_capacity == 0 {
            return Err(OrchestrationError::Config(
                "MAX_CHATS and ARCHIVE_CAPACITY must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            gemini_api_key: lookup("GEMINI_API_KEY").unwrap_or_default(),
            gemini_model: lookup("GEMINI_MODEL").unwrap_or(defaults.gemini_model),
            gemini_base_url: lookup("GEMINI_BASE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.gemini_base_url),
            max_tool_rounds,
            tool_timeout: Duration::from_millis(parse_or(
                &lookup,
                "TOOL_TIMEOUT_MS",
                defaults.tool_timeout.as_millis() as u64,
            )?),
            retry,
            streaming: parse_or(&lookup, "STREAMING", defaults.streaming)?,
            api_port,
            max_chats,
            archive_capacity,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => parse_value(key, &raw),
        _ => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        OrchestrationError::Config(format!("{} has invalid value {:?}: {}", key, raw, e))
    })
}
