//! Environment-driven configuration, validated eagerly at startup.
//!
//! Mirrors the set of tunables the original service reads straight out of
//! `os.environ`, but collected into one struct with typed, fail-fast
//! validation instead of scattered `os.environ.get` calls.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Strings the original service treats as boolean "true", case-insensitive.
const TRUTHY: [&str; 4] = ["1", "true", "yes", "on"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {name} is required but was not set")]
    Missing { name: &'static str },

    #[error("environment variable {name}={value:?} is not a valid {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Fully resolved runtime configuration for the coordinator, fetch engine
/// and ingest pipeline.
#[derive(Debug, Clone)]
pub struct Config {
    pub ingest_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub max_concurrent_downloads: usize,
    pub max_retry: i64,
    pub default_sleep: Duration,
    pub rate_limit_max_sleep: Duration,
    pub use_book_title: bool,
    pub use_cf_bypass: bool,
    pub using_external_bypasser: bool,
    pub disable_download_coordinator: bool,
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
    pub custom_script: Option<PathBuf>,
}

impl Config {
    /// Loads configuration from the process environment, applying the same
    /// defaults the original service falls back to when a variable is
    /// unset, and rejecting values that fail validation.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            ingest_dir: required_path("INGEST_DIR")?,
            tmp_dir: required_path("TMP_DIR")?,
            max_concurrent_downloads: positive_usize("MAX_CONCURRENT_DOWNLOADS", 3)?,
            max_retry: non_negative_i64("MAX_RETRY", 3)?,
            default_sleep: non_negative_duration("DEFAULT_SLEEP", 5.0)?,
            rate_limit_max_sleep: non_negative_duration("RATE_LIMIT_MAX_SLEEP", 60.0)?,
            use_book_title: truthy_env("USE_BOOK_TITLE", false),
            use_cf_bypass: truthy_env("USE_CF_BYPASS", false),
            using_external_bypasser: truthy_env("USING_EXTERNAL_BYPASSER", false),
            disable_download_coordinator: truthy_env("DISABLE_DOWNLOAD_COORDINATOR", false),
            http_proxy: non_empty_env("HTTP_PROXY"),
            https_proxy: non_empty_env("HTTPS_PROXY"),
            custom_script: non_empty_env("CUSTOM_SCRIPT").map(PathBuf::from),
        })
    }
}

/// Matches the original's `_is_truthy`: exact membership in a small set of
/// lowercase strings, not a generic bool parse.
#[must_use]
pub fn is_truthy(value: &str) -> bool {
    TRUTHY.contains(&value.trim().to_ascii_lowercase().as_str())
}

fn truthy_env(name: &'static str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(value) => is_truthy(&value),
        Err(_) => default,
    }
}

fn non_empty_env(name: &'static str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn required_path(name: &'static str) -> Result<PathBuf, ConfigError> {
    let value = std::env::var(name).map_err(|_| ConfigError::Missing { name })?;
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid {
            name,
            value,
            expected: "non-empty path",
        });
    }
    Ok(PathBuf::from(value))
}

fn positive_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    let Some(raw) = non_empty_env(name) else {
        return Ok(default);
    };
    let parsed: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value: raw.clone(), expected: "positive integer" })?;
    if parsed <= 0 {
        return Err(ConfigError::Invalid {
            name,
            value: raw,
            expected: "positive integer",
        });
    }
    Ok(parsed as usize)
}

fn non_negative_i64(name: &'static str, default: i64) -> Result<i64, ConfigError> {
    let Some(raw) = non_empty_env(name) else {
        return Ok(default);
    };
    let parsed: i64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value: raw.clone(), expected: "non-negative integer" })?;
    if parsed < 0 {
        return Err(ConfigError::Invalid {
            name,
            value: raw,
            expected: "non-negative integer",
        });
    }
    Ok(parsed)
}

fn non_negative_duration(name: &'static str, default_secs: f64) -> Result<Duration, ConfigError> {
    let Some(raw) = non_empty_env(name) else {
        return Ok(Duration::from_secs_f64(default_secs));
    };
    let parsed: f64 = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { name, value: raw.clone(), expected: "non-negative number of seconds" })?;
    if !parsed.is_finite() || parsed < 0.0 {
        return Err(ConfigError::Invalid {
            name,
            value: raw,
            expected: "non-negative number of seconds",
        });
    }
    Ok(Duration::from_secs_f64(parsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthy_matches_exact_set_case_insensitively() {
        assert!(is_truthy("1"));
        assert!(is_truthy("TRUE"));
        assert!(is_truthy("Yes"));
        assert!(is_truthy("on"));
        assert!(!is_truthy("0"));
        assert!(!is_truthy("nope"));
        assert!(!is_truthy(""));
    }
}
