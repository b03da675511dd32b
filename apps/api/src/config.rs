use std::time::Duration;

use anyhow::{Context, Result};

use crate::llm_client::{anthropic, google};

/// Application configuration loaded from environment variables.
/// Startup fails if required variables are missing.
///
/// Per-operation model and prompt settings are NOT here: they are operator-editable
/// rows read fresh on every invocation (see `store::OperationConfig`).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub s3_endpoint: String,
    pub aws_access_key_id: String,
    pub aws_secret_access_key: String,
    pub jwt_secret: String,
    pub anthropic_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub google_api_key: Option<String>,
    pub google_base_url: String,
    pub assistant: AssistantLimits,
    pub broadcast_timeout: Duration,
    pub port: u16,
    pub rust_log: String,
}

/// Bounds applied to every assistant invocation.
#[derive(Debug, Clone, Copy)]
pub struct AssistantLimits {
    pub max_round_trips: u32,
    pub turn_timeout: Duration,
}

impl Default for AssistantLimits {
    fn default() -> Self {
        Self {
            max_round_trips: 8,
            turn_timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        let defaults = AssistantLimits::default();

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: require_env("REDIS_URL")?,
            s3_endpoint: require_env("S3_ENDPOINT")?,
            aws_access_key_id: require_env("AWS_ACCESS_KEY_ID")?,
            aws_secret_access_key: require_env("AWS_SECRET_ACCESS_KEY")?,
            jwt_secret: require_env("JWT_SECRET")?,
            anthropic_api_key: optional_env("ANTHROPIC_API_KEY"),
            anthropic_base_url: optional_env("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|| anthropic::DEFAULT_BASE_URL.to_string()),
            google_api_key: optional_env("GOOGLE_API_KEY"),
            google_base_url: optional_env("GOOGLE_BASE_URL")
                .unwrap_or_else(|| google::DEFAULT_BASE_URL.to_string()),
            assistant: AssistantLimits {
                max_round_trips: parse_nonzero_env(
                    "ASSISTANT_MAX_ROUND_TRIPS",
                    defaults.max_round_trips,
                )?,
                turn_timeout: Duration::from_secs(parse_nonzero_env(
                    "ASSISTANT_TURN_TIMEOUT_SECS",
                    defaults.turn_timeout.as_secs(),
                )?),
            },
            broadcast_timeout: Duration::from_millis(parse_env("BROADCAST_TIMEOUT_MS", 2000u64)?),
            port: parse_env("PORT", 8080u16).context("PORT must be a valid port number")?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

/// Unset and blank values are both treated as absent.
fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match optional_env(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' has an invalid value: {raw}")),
        None => Ok(default),
    }
}

/// Like `parse_env`, for limits where zero would make every request fail.
fn parse_nonzero_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr + Default + PartialEq,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value = parse_env(key, default)?;
    anyhow::ensure!(
        value != T::default(),
        "Environment variable '{key}' must be at least 1"
    );
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_falls_back_to_default() {
        assert_eq!(
            parse_env("RECRUITER_TEST_UNSET_VARIABLE", 42u32).unwrap(),
            42
        );
    }

    #[test]
    fn test_zero_limit_is_rejected() {
        std::env::set_var("RECRUITER_TEST_ZERO_LIMIT", "0");
        let err = parse_nonzero_env("RECRUITER_TEST_ZERO_LIMIT", 8u32).unwrap_err();
        assert!(err.to_string().contains("must be at least 1"));

        std::env::set_var("RECRUITER_TEST_ONE_LIMIT", "1");
        assert_eq!(parse_nonzero_env("RECRUITER_TEST_ONE_LIMIT", 8u32).unwrap(), 1);
        assert_eq!(parse_nonzero_env("RECRUITER_TEST_UNSET_LIMIT", 120u64).unwrap(), 120);
    }

    #[test]
    fn test_assistant_limits_defaults() {
        let limits = AssistantLimits::default();
        assert_eq!(limits.max_round_trips, 8);
        assert_eq!(limits.turn_timeout, Duration::from_secs(120));
    }
}
