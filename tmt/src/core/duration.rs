//! Human duration parsing (`5m`, `1h 30m`, `2d`) and `HH:MM:SS` formatting.

use std::time::Duration;

use anyhow::{Result, anyhow};

/// Default test duration when metadata does not provide one.
pub const DEFAULT_TEST_DURATION: &str = "5m";

/// Parse a human duration into a positive number of seconds.
///
/// Accepts whitespace-separated parts, each a number with an optional unit
/// suffix (`s`, `m`, `h`, `d`). A bare number counts as seconds.
pub fn duration_to_seconds(value: &str) -> Result<u64> {
    let mut total: u64 = 0;
    let mut parts = 0;
    for part in value.split_whitespace() {
        parts += 1;
        let (number, multiplier) = match part.char_indices().last() {
            Some((idx, 's')) => (&part[..idx], 1),
            Some((idx, 'm')) => (&part[..idx], 60),
            Some((idx, 'h')) => (&part[..idx], 60 * 60),
            Some((idx, 'd')) => (&part[..idx], 24 * 60 * 60),
            _ => (part, 1),
        };
        let number: f64 = number
            .parse()
            .map_err(|_| anyhow!("invalid duration '{value}'"))?;
        if !number.is_finite() || number < 0.0 {
            return Err(anyhow!("invalid duration '{value}'"));
        }
        let seconds = (number * multiplier as f64).round();
        if seconds >= u64::MAX as f64 {
            return Err(anyhow!("invalid duration '{value}'"));
        }
        total = total
            .checked_add(seconds as u64)
            .ok_or_else(|| anyhow!("invalid duration '{value}'"))?;
    }
    if parts == 0 || total == 0 {
        return Err(anyhow!("duration must be positive, got '{value}'"));
    }
    Ok(total)
}

/// Convenience wrapper returning a `Duration`.
pub fn parse_duration(value: &str) -> Result<Duration> {
    Ok(Duration::from_secs(duration_to_seconds(value)?))
}

/// Format elapsed time as `HH:MM:SS` (hours are not wrapped).
pub fn format_hms(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
