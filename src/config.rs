//! Environment overrides for server and game configuration.
//!
//! Every setting has a compiled-in default; a `CRASH_*` environment variable
//! replaces it when present.

use std::str::FromStr;
use std::time::Duration;

/// Errors raised while reading configuration overrides.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Variable is set but does not parse.
    #[error("{key}={value:?} is not a valid value")]
    Invalid {
        /// Environment variable name.
        key: &'static str,
        /// Raw value found.
        value: String,
    },

    /// Variable parses but is outside the accepted range.
    #[error("{key} out of range: {reason}")]
    OutOfRange {
        /// Environment variable name.
        key: &'static str,
        /// Accepted range.
        reason: &'static str,
    },
}

/// Parse `key` from the environment if set.
pub(crate) fn env_parse<T: FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(None),
    }
}

/// Parse a millisecond duration from the environment if set.
pub(crate) fn env_millis(key: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

/// Reject values outside `[min, max]`.
pub(crate) fn check_range<T: PartialOrd>(
    key: &'static str,
    value: T,
    min: T,
    max: T,
    reason: &'static str,
) -> Result<T, ConfigError> {
    if value >= min && value <= max {
        Ok(value)
    } else {
        Err(ConfigError::OutOfRange { key, reason })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_unset() {
        let value: Option<u32> = env_parse("CRASH_TEST_SURELY_UNSET").unwrap();
        assert_eq!(value, None);
    }

    #[test]
    fn test_env_parse_invalid() {
        std::env::set_var("CRASH_TEST_INVALID_NUMBER", "ten");
        let result = env_parse::<u32>("CRASH_TEST_INVALID_NUMBER");
        assert!(matches!(result, Err(ConfigError::Invalid { key: "CRASH_TEST_INVALID_NUMBER", .. })));
    }

    #[test]
    fn test_env_millis() {
        std::env::set_var("CRASH_TEST_MILLIS", " 250 ");
        assert_eq!(
            env_millis("CRASH_TEST_MILLIS").unwrap(),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_check_range() {
        assert_eq!(check_range("K", 0.5, 0.0, 1.0, "0..1").unwrap(), 0.5);
        assert!(check_range("K", 1.5, 0.0, 1.0, "0..1").is_err());
    }
}
