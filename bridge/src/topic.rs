//! MQTT topic filter matching.
//!
//! Supports MQTT wildcards:
//! - `+` matches exactly one topic level
//! - `#` matches any number of remaining topic levels, including none (must be last)
//!
//! Matching is level by level over `/`, case sensitive, and never allocates,
//! so it is cheap enough to run for every message delivered by the backend.

use crate::error::{Error, Result};

const SEPARATOR: char = '/';
const SINGLE_LEVEL: &str = "+";
const MULTI_LEVEL: &str = "#";

/// Validate a subscription topic filter.
pub fn validate_filter(filter: &str) -> Result<()> {
    if filter.is_empty() {
        return Err(Error::InvalidTopicFilter("empty filter".to_string()));
    }

    let mut levels = filter.split(SEPARATOR).peekable();
    while let Some(level) = levels.next() {
        match level {
            MULTI_LEVEL if levels.peek().is_some() => {
                return Err(Error::InvalidTopicFilter(format!(
                    "{filter}: # must be the last level"
                )));
            }
            MULTI_LEVEL | SINGLE_LEVEL => {}
            _ if level.contains(['+', '#']) => {
                return Err(Error::InvalidTopicFilter(format!(
                    "{filter}: wildcard must occupy a whole level"
                )));
            }
            _ => {}
        }
    }

    Ok(())
}

/// Check whether `topic` matches `filter`.
///
/// A malformed filter never matches.
pub fn matches(filter: &str, topic: &str) -> bool {
    // Wildcards at the first level do not match topics starting with '$'.
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split(SEPARATOR);
    let mut topic_levels = topic.split(SEPARATOR);

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some(MULTI_LEVEL), _) => return filter_levels.next().is_none(),
            (Some(SINGLE_LEVEL), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Return the first filter, in iteration order, that matches `topic`.
pub fn select_filter<'a, I>(filters: I, topic: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    filters.into_iter().find(|filter| matches(filter, topic))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(matches("sport/tennis", "sport/tennis"));
        assert!(!matches("sport/tennis", "sport/Tennis"));
        assert!(!matches("sport/tennis", "sport/tennis/player"));
        assert!(!matches("sport/tennis/player", "sport/tennis"));
    }

    #[test]
    fn test_single_level_wildcard() {
        assert!(matches("sport/+", "sport/tennis"));
        assert!(!matches("sport/+", "sport/tennis/player"));
        assert!(!matches("sport/+", "sport"));
        assert!(matches("sport/+", "sport/"));
        assert!(matches("+/tennis/+", "sport/tennis/player"));
        assert!(matches("+", "sport"));
        assert!(!matches("+", "sport/tennis"));
        assert!(matches("+/+", "/finance"));
    }

    #[test]
    fn test_multi_level_wildcard() {
        assert!(matches("sport/#", "sport"));
        assert!(matches("sport/#", "sport/tennis"));
        assert!(matches("sport/#", "sport/tennis/player"));
        assert!(!matches("sport/#", "sports"));
        assert!(matches("#", "sport/tennis/player"));
        assert!(matches("sport/+/#", "sport/tennis"));
        assert!(matches("sport/+/#", "sport/tennis/player/ranking"));
    }

    #[test]
    fn test_malformed_filter_never_matches() {
        assert!(!matches("sport/#/player", "sport/tennis/player"));
    }

    #[test]
    fn test_dollar_topics() {
        assert!(!matches("#", "$SYS/uptime"));
        assert!(!matches("+/uptime", "$SYS/uptime"));
        assert!(matches("$SYS/#", "$SYS/uptime"));
    }

    #[test]
    fn test_select_filter_first_match_wins() {
        let filters = ["a/b", "a/+", "#"];
        assert_eq!(select_filter(filters, "a/b"), Some("a/b"));
        assert_eq!(select_filter(filters, "a/c"), Some("a/+"));
        assert_eq!(select_filter(filters, "x/y/z"), Some("#"));

        let filters = ["#", "a/b"];
        assert_eq!(select_filter(filters, "a/b"), Some("#"));
    }

    #[test]
    fn test_select_filter_none() {
        assert_eq!(select_filter(["a/+", "b/#"], "c/d"), None);
        assert_eq!(select_filter(Vec::<&str>::new(), "c/d"), None);
    }

    #[test]
    fn test_validate_filter() {
        assert!(validate_filter("a/b").is_ok());
        assert!(validate_filter("a/+/c").is_ok());
        assert!(validate_filter("a/#").is_ok());
        assert!(validate_filter("#").is_ok());
        assert!(validate_filter("").is_err());
        assert!(validate_filter("a/#/c").is_err());
        assert!(validate_filter("a/b+").is_err());
        assert!(validate_filter("a#").is_err());
    }
}
