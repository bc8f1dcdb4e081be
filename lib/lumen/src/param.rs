//! Environment parameter helpers. Every tunable is read at most once by the
//! consumer; a value that is present but malformed is reported back so the
//! caller can log it and fall back to the default.

use std::env;
use std::str::FromStr;

/// Outcome of looking up one environment parameter.
pub enum EnvValue<T> {
    /// Variable not set; use the default.
    Unset,
    /// Variable set and parsed.
    Parsed(T),
    /// Variable set but unparseable; carries the raw text.
    Malformed(String),
}

/// Read and parse an environment variable.
pub fn parse_env<T: FromStr>(name: &str) -> EnvValue<T> {
    match env::var(name) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => EnvValue::Parsed(value),
            Err(_) => EnvValue::Malformed(raw),
        },
        Err(_) => EnvValue::Unset,
    }
}

/// Parse a numeric or boolean parameter, falling back to `default` when the
/// variable is unset or malformed. A malformed value is pushed onto
/// `warnings` for later logging.
pub fn env_or<T: FromStr + Copy>(name: &str, default: T, warnings: &mut Vec<String>) -> T {
    match parse_env::<T>(name) {
        EnvValue::Unset => default,
        EnvValue::Parsed(value) => value,
        EnvValue::Malformed(raw) => {
            warnings.push(format!("ignoring malformed {}={:?}", name, raw));
            default
        }
    }
}

/// Boolean parameters accept 0/1 (the numeric convention of the original
/// plugin) as well as true/false.
pub fn env_bool(name: &str, default: bool, warnings: &mut Vec<String>) -> bool {
    match env::var(name) {
        Err(_) => default,
        Ok(raw) => match raw.as_str() {
            "0" => false,
            "1" => true,
            _ => match raw.parse::<bool>() {
                Ok(value) => value,
                Err(_) => {
                    warnings.push(format!("ignoring malformed {}={:?}", name, raw));
                    default
                }
            },
        },
    }
}

/// String parameter; `None` when unset.
#[inline]
pub fn env_string(name: &str) -> Option<String> {
    env::var(name).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Env mutation is process global; each test uses its own variable name.

    #[test]
    fn test_env_or_unset() {
        let mut warnings = Vec::new();
        assert_eq!(env_or("LUMEN_TEST_UNSET", 42usize, &mut warnings), 42);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_env_or_parsed() {
        env::set_var("LUMEN_TEST_PARSED", "17");
        let mut warnings = Vec::new();
        assert_eq!(env_or("LUMEN_TEST_PARSED", 0usize, &mut warnings), 17);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_env_or_malformed() {
        env::set_var("LUMEN_TEST_MALFORMED", "banana");
        let mut warnings = Vec::new();
        assert_eq!(env_or("LUMEN_TEST_MALFORMED", 5usize, &mut warnings), 5);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_env_bool_numeric() {
        env::set_var("LUMEN_TEST_BOOL", "1");
        let mut warnings = Vec::new();
        assert!(env_bool("LUMEN_TEST_BOOL", false, &mut warnings));
        env::set_var("LUMEN_TEST_BOOL", "0");
        assert!(!env_bool("LUMEN_TEST_BOOL", true, &mut warnings));
        assert!(warnings.is_empty());
    }
}
