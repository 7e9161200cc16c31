use std::env;
use std::path::PathBuf;
use std::time::Duration;

use atelier_contracts::sessions::DEFAULT_PROJECT_ID;

use crate::orchestrator::RetryPolicy;
use crate::token_usage::{DEFAULT_CONTEXT_LIMIT, DEFAULT_NEAR_LIMIT_RATIO};

const REQUEST_TIMEOUT_S_DEFAULT: u64 = 120;
const MAX_RETRIES_DEFAULT: u32 = 3;
const RETRY_BACKOFF_MS_DEFAULT: u64 = 2_000;

#[derive(Debug, Clone, PartialEq)]
pub struct StudioConfig {
    pub data_dir: PathBuf,
    pub project_id: String,
    pub request_timeout_s: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Used when the model catalog has no context window for a model.
    pub context_limit: u64,
    pub near_limit_ratio: f64,
    pub openrouter_api_key: Option<String>,
    pub openrouter_api_base: Option<String>,
}

impl StudioConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            project_id: DEFAULT_PROJECT_ID.to_string(),
            request_timeout_s: REQUEST_TIMEOUT_S_DEFAULT,
            max_retries: MAX_RETRIES_DEFAULT,
            retry_backoff_ms: RETRY_BACKOFF_MS_DEFAULT,
            context_limit: DEFAULT_CONTEXT_LIMIT,
            near_limit_ratio: DEFAULT_NEAR_LIMIT_RATIO,
            openrouter_api_key: None,
            openrouter_api_base: None,
        }
    }

    pub fn from_env() -> Self {
        let data_dir = non_empty_env("ATELIER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);
        Self::with_data_dir(data_dir).apply_overrides(non_empty_env)
    }

    /// Applies `ATELIER_*` / `OPENROUTER_*` overrides read through `lookup`.
    /// Unparseable values keep the current setting; numbers are clamped.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(value) = parse_with::<u64>(&lookup, "ATELIER_REQUEST_TIMEOUT_S") {
            self.request_timeout_s = value.clamp(5, 600);
        }
        if let Some(value) = parse_with::<u32>(&lookup, "ATELIER_MAX_RETRIES") {
            self.max_retries = value.min(6);
        }
        if let Some(value) = parse_with::<u64>(&lookup, "ATELIER_RETRY_BACKOFF_MS") {
            self.retry_backoff_ms = value.clamp(50, 60_000);
        }
        if let Some(value) = parse_with::<u64>(&lookup, "ATELIER_CONTEXT_LIMIT") {
            self.context_limit = value;
        }
        if let Some(value) = parse_with::<f64>(&lookup, "ATELIER_NEAR_LIMIT_RATIO") {
            if value.is_finite() {
                self.near_limit_ratio = value.clamp(0.05, 1.0);
            }
        }
        if let Some(key) = lookup("OPENROUTER_API_KEY") {
            self.openrouter_api_key = Some(key);
        }
        if let Some(base) = lookup("OPENROUTER_API_BASE") {
            self.openrouter_api_base = Some(base);
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_s)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            request_timeout: self.request_timeout(),
        }
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }
}

fn default_data_dir() -> PathBuf {
    env::var_os("HOME")
        .map(PathBuf::from)
        .map(|home| home.join(".atelier"))
        .unwrap_or_else(|| PathBuf::from(".atelier"))
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_with<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    lookup(key).and_then(|raw| raw.trim().parse::<T>().ok())
}
