//! Configuration management

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;

/// Guard configuration
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// SQLite database path for call history and cache
    pub db_path: PathBuf,

    /// How far back a successful identical call counts as redundant
    pub lookback_minutes: i64,

    /// Default cache TTL in minutes
    pub cache_ttl_minutes: i64,

    /// Historical reflections included in correction prompts
    pub history_limit: usize,

    /// Reflective corrections below this confidence are not retried
    pub confidence_threshold: f64,

    /// Model hint for the reflective agent (haiku, sonnet, opus)
    pub model: String,

    /// Anthropic API key (optional - reflective correction requires it)
    pub anthropic_api_key: Option<String>,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            lookback_minutes: 10,
            cache_ttl_minutes: 30,
            history_limit: 5,
            confidence_threshold: crate::reflection::MIN_CONFIDENCE,
            model: "sonnet".to_string(),
            anthropic_api_key: None,
        }
    }
}

impl GuardConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let db_path = std::env::var("TOOLGUARD_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let lookback_minutes = env_parse("TOOLGUARD_LOOKBACK_MINUTES")?
            .unwrap_or(defaults.lookback_minutes);

        let cache_ttl_minutes = env_parse("TOOLGUARD_CACHE_TTL_MINUTES")?
            .unwrap_or(defaults.cache_ttl_minutes);

        let history_limit = env_parse("TOOLGUARD_HISTORY_LIMIT")?
            .unwrap_or(defaults.history_limit);

        let confidence_threshold: f64 = env_parse("TOOLGUARD_CONFIDENCE_THRESHOLD")?
            .unwrap_or(defaults.confidence_threshold);
        if !(0.0..=1.0).contains(&confidence_threshold) {
            anyhow::bail!(
                "TOOLGUARD_CONFIDENCE_THRESHOLD must be within 0.0..=1.0, got {}",
                confidence_threshold
            );
        }

        let model = std::env::var("TOOLGUARD_MODEL").unwrap_or(defaults.model);

        let anthropic_api_key = std::env::var("ANTHROPIC_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        Ok(Self {
            db_path,
            lookback_minutes,
            cache_ttl_minutes,
            history_limit,
            confidence_threshold,
            model,
            anthropic_api_key,
        })
    }
}

fn env_parse<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {}: '{}'", name, raw)),
        Err(_) => Ok(None),
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("toolguard")
        .join("toolguard.db")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GuardConfig::default();
        assert_eq!(config.lookback_minutes, 10);
        assert_eq!(config.cache_ttl_minutes, 30);
        assert_eq!(config.history_limit, 5);
        assert!((config.confidence_threshold - 0.30).abs() < f64::EPSILON);
        assert!(config.db_path.ends_with("toolguard/toolguard.db"));
        assert!(config.anthropic_api_key.is_none());
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("TOOLGUARD_TEST_PARSE_GARBAGE", "ten");
        let parsed: Result<Option<i64>> = env_parse("TOOLGUARD_TEST_PARSE_GARBAGE");
        assert!(parsed.is_err());

        std::env::set_var("TOOLGUARD_TEST_PARSE_OK", " 42 ");
        let parsed: Option<i64> = env_parse("TOOLGUARD_TEST_PARSE_OK").unwrap();
        assert_eq!(parsed, Some(42));

        let missing: Option<i64> = env_parse("TOOLGUARD_TEST_PARSE_MISSING").unwrap();
        assert!(missing.is_none());
    }
}
