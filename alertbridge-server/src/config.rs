use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use alertbridge_core::{DEFAULT_NOTIFY_ANNOTATION, DEFAULT_RESPONDERS_ANNOTATION};

use crate::dispatcher::default_concurrency;

#[derive(Clone)]
pub struct Config {
    pub opsgenie_api_key: String,
    pub opsgenie_api_url: String,
    pub opsgenie_priority: String,
    /// Responders used when a request names none of its own.
    pub default_responders: Vec<String>,
    pub notify_annotation: String,
    pub responders_annotation: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Shared secret for event signatures. Unset disables verification.
    pub webhook_secret: Option<String>,
    /// Where automatic approvals are posted. Unset disables automatic approval.
    pub review_submit_url: Option<String>,
    pub max_concurrency: usize,
    pub handle_timeout: Duration,
    pub max_attempts: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let opsgenie_api_key = env::var("OPSGENIE_API_KEY")
            .context("OPSGENIE_API_KEY environment variable is required")?;

        let opsgenie_api_url = env::var("OPSGENIE_API_URL")
            .unwrap_or_else(|_| "https://api.opsgenie.com".to_string());

        let opsgenie_priority =
            env::var("OPSGENIE_PRIORITY").unwrap_or_else(|_| "P3".to_string());

        let default_responders = parse_list(env::var("OPSGENIE_DEFAULT_RESPONDERS").ok());

        let notify_annotation = env::var("NOTIFY_ANNOTATION")
            .unwrap_or_else(|_| DEFAULT_NOTIFY_ANNOTATION.to_string());
        let responders_annotation = env::var("RESPONDERS_ANNOTATION")
            .unwrap_or_else(|_| DEFAULT_RESPONDERS_ANNOTATION.to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = state_dir_from_env();

        let webhook_secret = parse_secret(env::var("WEBHOOK_SECRET").ok());

        let review_submit_url = parse_optional(env::var("REVIEW_SUBMIT_URL").ok());

        let max_concurrency = match env::var("MAX_CONCURRENCY") {
            Ok(value) => value
                .parse::<usize>()
                .context("MAX_CONCURRENCY must be a valid number")?,
            Err(_) => default_concurrency(),
        };

        let handle_timeout = env::var("HANDLE_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<u64>()
            .map(Duration::from_secs)
            .context("HANDLE_TIMEOUT_SECS must be a valid number")?;

        let max_attempts = env::var("MAX_ATTEMPTS")
            .unwrap_or_else(|_| "5".to_string())
            .parse::<u32>()
            .context("MAX_ATTEMPTS must be a valid number")?;

        Ok(Config {
            opsgenie_api_key,
            opsgenie_api_url,
            opsgenie_priority,
            default_responders,
            notify_annotation,
            responders_annotation,
            port,
            state_dir,
            webhook_secret,
            review_submit_url,
            max_concurrency,
            handle_timeout,
            max_attempts,
        })
    }
}

/// STATE_DIR, defaulting to the current directory. Usable without the
/// rest of the configuration.
pub fn state_dir_from_env() -> PathBuf {
    env::var("STATE_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
}

/// Parse WEBHOOK_SECRET from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace,
/// so a blank secret never turns into "every signature made with the empty key".
pub fn parse_secret(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

/// A trimmed value, or None when it is missing or blank.
pub fn parse_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Split a comma-separated list, trimming entries and dropping blank ones.
pub fn parse_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
