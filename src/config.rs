use std::path::PathBuf;

use crate::{Error, Result};

pub const DEFAULT_ALIASES_PATH: &str = "config.yml";
pub const DEFAULT_SLACK_API_URL: &str = "https://slack.com/api";
pub const DEFAULT_WORKER_HANDLER: &str = "sqlbot-worker";
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// Process settings, read once at startup from environment-style keys.
#[derive(Clone, Debug)]
pub struct Settings {
    pub aliases_path: PathBuf,
    pub slack_token: Option<String>,
    pub slack_api_url: String,
    pub worker_handler: String,
    pub queue_capacity: usize,
    pub env: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            aliases_path: PathBuf::from(DEFAULT_ALIASES_PATH),
            slack_token: None,
            slack_api_url: DEFAULT_SLACK_API_URL.to_string(),
            worker_handler: DEFAULT_WORKER_HANDLER.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            env: None,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary key lookup; empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let queue_capacity = match get("SQLBOT_QUEUE_CAPACITY") {
            Some(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "SQLBOT_QUEUE_CAPACITY must be a positive integer, got `{raw}`"
                    ))
                })?,
            None => defaults.queue_capacity,
        };

        Ok(Self {
            aliases_path: get("SQLBOT_ALIASES_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.aliases_path),
            slack_token: get("SLACK_TOKEN"),
            slack_api_url: get("SLACK_API_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.slack_api_url),
            worker_handler: get("SQLBOT_WORKER_HANDLER").unwrap_or(defaults.worker_handler),
            queue_capacity,
            env: get("ENV"),
        })
    }

    pub fn require_slack_token(&self) -> Result<&str> {
        self.slack_token
            .as_deref()
            .ok_or_else(|| Error::Config("SLACK_TOKEN is not set".into()))
    }
}
