//! Compact duration strings used for job intervals and runtime settings.
//!
//! The accepted form is a concatenation of integer/unit pairs, e.g. `"30s"`,
//! `"5m"`, `"1h30m"`, `"500ms"`, `"2d"`. Units: `ms`, `s`, `m`, `h`, `d`.

use std::time::Duration;

use crate::error::{EngineError, EngineResult};

const MILLIS_PER_SEC: u64 = 1_000;
const SECS_PER_MIN: u64 = 60;
const SECS_PER_HOUR: u64 = 3_600;
const SECS_PER_DAY: u64 = 86_400;

/// Parse a compact duration string into a [`Duration`].
pub fn parse_duration(input: &str) -> EngineResult<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(EngineError::InvalidInterval(input.to_string()));
    }

    let mut total_ms: u64 = 0;
    let mut digits = String::new();
    let mut chars = s.chars().peekable();
    let mut seen_pair = false;

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        if digits.is_empty() {
            return Err(EngineError::InvalidInterval(input.to_string()));
        }
        let value: u64 = digits
            .parse()
            .map_err(|_| EngineError::InvalidInterval(input.to_string()))?;
        digits.clear();

        let unit_ms = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            's' => MILLIS_PER_SEC,
            'm' => SECS_PER_MIN * MILLIS_PER_SEC,
            'h' => SECS_PER_HOUR * MILLIS_PER_SEC,
            'd' => SECS_PER_DAY * MILLIS_PER_SEC,
            _ => return Err(EngineError::InvalidInterval(input.to_string())),
        };

        total_ms = value
            .checked_mul(unit_ms)
            .and_then(|v| total_ms.checked_add(v))
            .ok_or_else(|| EngineError::InvalidInterval(input.to_string()))?;
        seen_pair = true;
    }

    // A trailing bare number has no unit
    if !digits.is_empty() || !seen_pair {
        return Err(EngineError::InvalidInterval(input.to_string()));
    }

    Ok(Duration::from_millis(total_ms))
}

/// Render a [`Duration`] in the compact form accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis() as u64;
    if total_ms == 0 {
        return "0s".to_string();
    }

    let ms = total_ms % MILLIS_PER_SEC;
    let mut secs = total_ms / MILLIS_PER_SEC;

    let days = secs / SECS_PER_DAY;
    secs %= SECS_PER_DAY;
    let hours = secs / SECS_PER_HOUR;
    secs %= SECS_PER_HOUR;
    let mins = secs / SECS_PER_MIN;
    secs %= SECS_PER_MIN;

    let mut out = String::new();
    if days > 0 {
        out.push_str(&format!("{days}d"));
    }
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    if ms > 0 {
        out.push_str(&format!("{ms}ms"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7_200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn parses_compound_values() {
        assert_eq!(
            parse_duration("1h30m").unwrap(),
            Duration::from_secs(5_400)
        );
        assert_eq!(
            parse_duration("1m30s500ms").unwrap(),
            Duration::from_millis(90_500)
        );
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "  ", "10", "s", "10x", "m10", "1.5s", "-5s"] {
            assert!(parse_duration(bad).is_err(), "expected error for {bad:?}");
        }
    }

    #[test]
    fn formats_round_trip() {
        for d in [
            Duration::ZERO,
            Duration::from_millis(500),
            Duration::from_secs(90),
            Duration::from_secs(5_400),
            Duration::from_secs(86_400 * 30),
            Duration::from_millis(90_500),
        ] {
            let rendered = format_duration(d);
            assert_eq!(parse_duration(&rendered).unwrap(), d, "via {rendered:?}");
        }
    }
}
