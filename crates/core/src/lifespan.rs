//! Lifespan strings such as `4h`, `1h30m`, `90s` or `7d`.
//!
//! A lifespan is a sequence of `<integer><unit>` pairs with units `ms`, `s`,
//! `m`, `h` and `d`. The total must be positive and at most
//! [`MAX_LIFESPAN_DAYS`] days.

use chrono::Duration;

use crate::error::PolicyError;

const MS_PER_UNIT: &[(&str, i64)] = &[
    ("ms", 1),
    ("s", 1_000),
    ("m", 60_000),
    ("h", 3_600_000),
    ("d", 86_400_000),
];

/// Upper bound on any lifespan, roughly a century.
pub const MAX_LIFESPAN_DAYS: i64 = 36_500;

/// Parse a lifespan string into a positive duration.
pub fn parse_lifespan(input: &str) -> Result<Duration, PolicyError> {
    let invalid = || PolicyError::config(format!("invalid lifespan '{input}'"));

    let text = input.trim();
    if text.is_empty() {
        return Err(invalid());
    }

    let mut total_ms: i64 = 0;
    let mut rest = text;
    while !rest.is_empty() {
        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return Err(invalid());
        }
        let value: i64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest.chars().take_while(|c| c.is_ascii_alphabetic()).count();
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let factor = MS_PER_UNIT
            .iter()
            .find(|(name, _)| *name == unit)
            .map(|(_, factor)| *factor)
            .ok_or_else(invalid)?;

        total_ms = value
            .checked_mul(factor)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(invalid)?;
    }

    if total_ms <= 0 {
        return Err(PolicyError::config(format!("lifespan '{input}' must be positive")));
    }
    let lifespan = Duration::milliseconds(total_ms);
    if lifespan > Duration::days(MAX_LIFESPAN_DAYS) {
        return Err(PolicyError::config(format!(
            "lifespan '{input}' exceeds {MAX_LIFESPAN_DAYS} days"
        )));
    }
    Ok(lifespan)
}

/// Render a duration in the same notation `parse_lifespan` accepts.
pub fn format_lifespan(duration: Duration) -> String {
    let mut ms = duration.num_milliseconds();
    if ms <= 0 {
        return "0s".to_string();
    }
    let mut out = String::new();
    for (unit, factor) in MS_PER_UNIT.iter().rev() {
        let count = ms / factor;
        if count > 0 {
            out.push_str(&format!("{count}{unit}"));
            ms -= count * factor;
        }
    }
    out
}
