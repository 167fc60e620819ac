//! Environment-driven settings.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::runner::RunnerConfig;

#[derive(Debug, Clone)]
pub struct Settings {
    /// SQLite database file for users and call records.
    pub database_path: PathBuf,
    /// Scoring backend endpoint.
    pub eval_endpoint: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
    /// `running` records older than this are demoted at startup.
    pub stale_running_after: Duration,
}

impl Settings {
    /// Load from the process environment; a `.env` file is honored when
    /// present. Only `EVAL_ENDPOINT` is required.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let eval_endpoint =
            std::env::var("EVAL_ENDPOINT").context("EVAL_ENDPOINT is required")?;
        let database_path = std::env::var("CALLGRADE_DB_PATH")
            .unwrap_or_else(|_| "callgrade.db".to_string())
            .into();
        let max_attempts = env_or("EVAL_MAX_ATTEMPTS", 3)?;
        let base_delay = Duration::from_secs(env_or("EVAL_BASE_DELAY_SECS", 5)?);
        let stale_running_after =
            Duration::from_secs(env_or("EVAL_STALE_RUNNING_SECS", 600)?);

        Ok(Self {
            database_path,
            eval_endpoint,
            max_attempts,
            base_delay,
            stale_running_after,
        })
    }

    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
        }
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => parse_value(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value_accepts_numbers_with_whitespace() {
        let parsed: u32 = parse_value("EVAL_MAX_ATTEMPTS", " 4 ").unwrap();
        assert_eq!(parsed, 4);
        let parsed: u64 = parse_value("EVAL_BASE_DELAY_SECS", "10").unwrap();
        assert_eq!(parsed, 10);
    }

    #[test]
    fn test_parse_value_rejects_garbage_with_key_in_message() {
        let err = parse_value::<u32>("EVAL_MAX_ATTEMPTS", "many").unwrap_err();
        assert!(err.to_string().contains("EVAL_MAX_ATTEMPTS"));
    }

    #[test]
    fn test_runner_config_carries_retry_settings() {
        let settings = Settings {
            database_path: "test.db".into(),
            eval_endpoint: "http://localhost:9/evaluate".into(),
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            stale_running_after: Duration::from_secs(60),
        };
        let config = settings.runner_config();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay, Duration::from_secs(2));
    }
}
