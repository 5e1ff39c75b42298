//! Topic filter validation and matching.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels (must be last)
//!
//! A filter without wildcards matches only the identical topic, byte for byte.

use crate::error::{Error, Result};

/// Check that a topic filter is well formed.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidConfig("empty topic filter".to_string()));
    }
    if filter.len() > u16::MAX as usize {
        return Err(Error::InvalidConfig("topic filter too long".to_string()));
    }

    let mut levels = filter.split('/').peekable();
    while let Some(level) = levels.next() {
        match level {
            "#" if levels.peek().is_some() => {
                return Err(Error::InvalidConfig(format!(
                    "'#' must be the last level: {}",
                    filter
                )));
            }
            "#" | "+" => {}
            _ if level.contains(['#', '+']) => {
                return Err(Error::InvalidConfig(format!(
                    "wildcard must occupy a whole level: {}",
                    filter
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Whether `topic` is matched by `filter`.
pub fn matches(filter: &str, topic: &str) -> bool {
    if filter == topic {
        return true;
    }

    // Wildcards at the first level never match $-prefixed system topics.
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("a/b", "a/b"));
        assert!(!matches("a/b", "x/y"));
        assert!(!matches("a/b", "A/b"));
        assert!(!matches("a/b", "a/b/c"));
        assert!(!matches("a/b/c", "a/b"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("a/+/c", "a/b/c"));
        assert!(matches("a/+", "a/"));
        assert!(!matches("a/+", "a/b/c"));
        assert!(matches("+/+", "/x"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("a/#", "a"));
        assert!(matches("a/#", "a/b"));
        assert!(matches("a/#", "a/b/c"));
        assert!(matches("#", "anything/at/all"));
        assert!(!matches("a/#", "b/c"));
    }

    #[test]
    fn test_system_topics() {
        assert!(!matches("#", "$SYS/broker/load"));
        assert!(!matches("+/broker", "$SYS/broker"));
        assert!(matches("$SYS/#", "$SYS/broker/load"));
    }

    #[test]
    fn test_multi_level_wildcard_must_be_last() {
        assert!(validate_filter("a/#").is_ok());
        assert!(validate_filter("a/#/b").is_err());
        assert!(validate_filter("a/b#").is_err());
        assert!(validate_filter("a+/b").is_err());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("+/+/#").is_ok());
    }
}
