//! Shared utility functions used across the crate.

use std::time::Duration;

use crate::cli::config::ConfigError;

/// Parse a duration string (e.g., "30s", "500ms", "3m", "1h") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds (e.g., "30s", "1.5s")
/// - `Nm` - minutes (e.g., "3m")
/// - `Nh` - hours (e.g., "1h")
/// - Plain number - treated as milliseconds (e.g., "1000")
///
/// A leading minus sign yields `ConfigError::NegativeDuration`; anything else that
/// does not parse yields `ConfigError::InvalidDuration`.
pub fn parse_duration_str(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_string());

    let (number, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600.0)
    } else {
        (s, 0.001)
    };

    let value: f64 = number.trim().parse().map_err(|_| invalid())?;
    if !value.is_finite() {
        return Err(invalid());
    }
    if value < 0.0 || number.trim_start().starts_with('-') {
        return Err(ConfigError::NegativeDuration(s.to_string()));
    }
    Duration::try_from_secs_f64(value * scale).map_err(|_| invalid())
}

/// Parse an optional duration, falling back to `default` when absent.
pub fn parse_duration_or(s: Option<&str>, default: Duration) -> Result<Duration, ConfigError> {
    match s {
        Some(s) => parse_duration_str(s),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_milliseconds() {
        assert_eq!(
            parse_duration_str("500ms").unwrap(),
            Duration::from_millis(500)
        );
        assert_eq!(
            parse_duration_str("1000ms").unwrap(),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_parse_seconds() {
        assert_eq!(parse_duration_str("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration_str("1s").unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_parse_minutes() {
        assert_eq!(parse_duration_str("3m").unwrap(), Duration::from_secs(180));
        assert_eq!(parse_duration_str("1m").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_hours() {
        assert_eq!(parse_duration_str("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_plain_number() {
        assert_eq!(
            parse_duration_str("1000").unwrap(),
            Duration::from_millis(1000)
        );
    }

    #[test]
    fn test_parse_with_whitespace() {
        assert_eq!(parse_duration_str(" 30s ").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_fractional() {
        assert_eq!(
            parse_duration_str("1.5s").unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(parse_duration_str("0.5m").unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_parse_zero() {
        assert_eq!(parse_duration_str("0s").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_parse_negative() {
        assert!(matches!(
            parse_duration_str("-3m"),
            Err(ConfigError::NegativeDuration(_))
        ));
        assert!(matches!(
            parse_duration_str("-0.5s"),
            Err(ConfigError::NegativeDuration(_))
        ));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(matches!(
            parse_duration_str("invalid"),
            Err(ConfigError::InvalidDuration(_))
        ));
        assert!(matches!(
            parse_duration_str("abc123"),
            Err(ConfigError::InvalidDuration(_))
        ));
        assert!(matches!(
            parse_duration_str("infs"),
            Err(ConfigError::InvalidDuration(_))
        ));
    }

    #[test]
    fn test_parse_duration_or_default() {
        assert_eq!(
            parse_duration_or(None, Duration::from_secs(30)).unwrap(),
            Duration::from_secs(30)
        );
        assert_eq!(
            parse_duration_or(Some("2s"), Duration::from_secs(30)).unwrap(),
            Duration::from_secs(2)
        );
    }
}
