//! `Retry-After` parsing, rate-limit wait computation, and human-readable
//! size-hint parsing shared by `fetch_page` and `download_stream`.

use std::time::Duration;

/// HTTP statuses the engine treats as rate-limited rather than failed.
const RATE_LIMIT_STATUS_CODES: [u16; 2] = [429, 503];

/// Tuning knobs threaded through both fetch operations, derived from
/// [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct RetryTuning {
    pub max_retry: i64,
    pub default_sleep: Duration,
    pub rate_limit_max_sleep: Duration,
}

/// Parses a `Retry-After` header value into seconds: a bare non-negative
/// integer, or an RFC 7231 HTTP-date (seconds until that date, floored at
/// zero for dates in the past).
#[must_use]
pub fn parse_retry_after(value: &str) -> Option<f64> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    if trimmed.chars().all(|c| c.is_ascii_digit()) {
        return trimmed.parse::<f64>().ok();
    }

    let target = httpdate::parse_http_date(trimmed).ok()?;
    let now = std::time::SystemTime::now();
    let wait = target
        .duration_since(now)
        .unwrap_or(Duration::ZERO);
    Some(wait.as_secs_f64())
}

/// Returns `Some((wait, header_value))` when `status` indicates a rate
/// limit, computing the wait from `Retry-After` when present and falling
/// back to `default_sleep * 2^consecutive_attempts`, capped at
/// `rate_limit_max_sleep`.
#[must_use]
pub fn rate_limit_wait(
    status: u16,
    retry_after_header: Option<&str>,
    consecutive_attempts: u32,
    default_sleep: Duration,
    rate_limit_max_sleep: Duration,
) -> Option<(Duration, Option<String>)> {
    if !RATE_LIMIT_STATUS_CODES.contains(&status) {
        return None;
    }

    let wait_seconds = retry_after_header
        .and_then(parse_retry_after)
        .unwrap_or_else(|| default_sleep.as_secs_f64() * 2f64.powi(consecutive_attempts as i32));

    let capped = wait_seconds.max(0.0).min(rate_limit_max_sleep.as_secs_f64());
    Some((
        Duration::from_secs_f64(capped),
        retry_after_header.map(str::to_string),
    ))
}

/// Parses human-readable size hints (`"1.2 mb"`, `"900kb"`, comma decimals)
/// into a byte count; falls back to a bare numeric parse.
#[must_use]
pub fn parse_size_to_bytes(size: &str) -> Option<u64> {
    if size.is_empty() {
        return None;
    }
    let cleaned = size.trim().to_ascii_lowercase();
    if cleaned.is_empty() {
        return None;
    }
    let cleaned = cleaned.replace(' ', "").replace(',', ".");

    const UNITS: [(&str, u64); 3] = [("kb", 1024), ("mb", 1024 * 1024), ("gb", 1024 * 1024 * 1024)];
    for (unit, multiplier) in UNITS {
        if let Some(prefix) = cleaned.strip_suffix(unit) {
            let value: f64 = prefix.parse().ok()?;
            return Some((value * multiplier as f64) as u64);
        }
    }

    cleaned.parse::<f64>().ok().map(|value| value as u64)
}

/// Computes the sleep duration for a generic (non-rate-limit) retry, per
/// `DEFAULT_SLEEP * (MAX_RETRY - retries_remaining + 1)`. Clamped at zero —
/// the original formula cannot go negative for well-formed budgets, but a
/// caller-supplied `retry_budget` larger than `max_retry` could otherwise
/// produce a value `Duration` cannot represent.
#[must_use]
pub fn generic_retry_sleep(tuning: &RetryTuning, retries_remaining: i64) -> Duration {
    let factor = (tuning.max_retry - retries_remaining + 1).max(0) as f64;
    tuning.default_sleep.mul_f64(factor)
}
