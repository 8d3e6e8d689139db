//! Topic name and filter validation
//!
//! Rules enforced here:
//! - names never contain `+` or `#`
//! - `+` occupies a whole level, `#` a whole level and only the last one
//! - `$share/{group}/{filter}` carries a non-empty, wildcard-free group
//! - `$`-prefixed topics are not matched by a leading wildcard

use std::fmt;

const MAX_TOPIC_LEN: usize = 65535;
const SHARE_PREFIX: &str = "$share/";

/// Why a topic name or filter was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicError {
    Empty,
    TooLong,
    NullCharacter,
    WildcardInName,
    MisplacedMultiWildcard,
    PartialSingleWildcard,
    InvalidShareGroup,
    EmptySharedFilter,
    TooManyLevels,
}

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            TopicError::Empty => "topic cannot be empty",
            TopicError::TooLong => "topic exceeds maximum length",
            TopicError::NullCharacter => "topic cannot contain null character",
            TopicError::WildcardInName => "topic name cannot contain wildcards",
            TopicError::MisplacedMultiWildcard => "'#' must be the whole last level",
            TopicError::PartialSingleWildcard => "'+' must occupy an entire level",
            TopicError::InvalidShareGroup => "invalid shared subscription group",
            TopicError::EmptySharedFilter => "shared subscription filter cannot be empty",
            TopicError::TooManyLevels => "topic exceeds maximum allowed levels",
        };
        f.write_str(msg)
    }
}

impl std::error::Error for TopicError {}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NullCharacter);
    }
    Ok(())
}

fn check_levels(topic: &str, max_levels: usize) -> Result<(), TopicError> {
    if max_levels > 0 && topic.split('/').count() > max_levels {
        return Err(TopicError::TooManyLevels);
    }
    Ok(())
}

/// Validate a topic name used in PUBLISH. `max_levels == 0` means unlimited.
pub fn validate_topic_name(topic: &str, max_levels: usize) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName);
    }
    check_levels(topic, max_levels)
}

/// Validate a topic filter, shared or not. `max_levels == 0` means unlimited
/// and only counts the levels after the share group.
pub fn validate_topic_filter(filter: &str, max_levels: usize) -> Result<(), TopicError> {
    check_common(filter)?;

    let actual = match split_shared(filter)? {
        Some((_, actual)) => actual,
        None => filter,
    };
    check_levels(actual, max_levels)?;

    let mut levels = actual.split('/').peekable();
    while let Some(level) = levels.next() {
        if level.contains('#') && (level != "#" || levels.peek().is_some()) {
            return Err(TopicError::MisplacedMultiWildcard);
        }
        if level.contains('+') && level != "+" {
            return Err(TopicError::PartialSingleWildcard);
        }
    }
    Ok(())
}

/// Split `$share/{group}/{filter}` into `(group, filter)`.
///
/// Returns `Ok(None)` for ordinary filters and an error for a malformed
/// shared filter.
pub fn split_shared(filter: &str) -> Result<Option<(&str, &str)>, TopicError> {
    let Some(rest) = filter.strip_prefix(SHARE_PREFIX) else {
        return Ok(None);
    };
    let (group, actual) = rest.split_once('/').ok_or(TopicError::InvalidShareGroup)?;
    if group.is_empty() || group.contains(['+', '#']) {
        return Err(TopicError::InvalidShareGroup);
    }
    if actual.is_empty() {
        return Err(TopicError::EmptySharedFilter);
    }
    Ok(Some((group, actual)))
}

/// Reference matcher for a single filter against a topic name.
///
/// The trie is the fast path; this is used for retained-message lookups
/// and ACL pattern checks.
pub fn topic_matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    for pattern in filter.split('/') {
        if pattern == "#" {
            return true;
        }
        match topic_levels.next() {
            Some(level) if pattern == "+" || pattern == level => {}
            _ => return false,
        }
    }
    topic_levels.next().is_none()
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("test" ; "single level")]
    #[test_case("/test/topic" ; "leading slash")]
    #[test_case("test/topic/" ; "trailing slash")]
    #[test_case("$SYS/broker" ; "system topic")]
    fn test_valid_topic_names(topic: &str) {
        assert_eq!(validate_topic_name(topic, 0), Ok(()));
    }

    #[test_case("", TopicError::Empty ; "empty")]
    #[test_case("a\0b", TopicError::NullCharacter ; "null")]
    #[test_case("test+topic", TopicError::WildcardInName ; "plus")]
    #[test_case("test/#", TopicError::WildcardInName ; "hash")]
    fn test_invalid_topic_names(topic: &str, expected: TopicError) {
        assert_eq!(validate_topic_name(topic, 0), Err(expected));
    }

    #[test]
    fn test_validate_topic_filter() {
        for ok in ["#", "+", "a/+/c", "a/#", "+/+/+", "$share/g/a/+", "$share/g/#"] {
            assert_eq!(validate_topic_filter(ok, 0), Ok(()), "{ok}");
        }
        assert_eq!(
            validate_topic_filter("a/#/c", 0),
            Err(TopicError::MisplacedMultiWildcard)
        );
        assert_eq!(
            validate_topic_filter("a#", 0),
            Err(TopicError::MisplacedMultiWildcard)
        );
        assert_eq!(
            validate_topic_filter("a+/b", 0),
            Err(TopicError::PartialSingleWildcard)
        );
        assert_eq!(
            validate_topic_filter("$share//a", 0),
            Err(TopicError::InvalidShareGroup)
        );
        assert_eq!(
            validate_topic_filter("$share/g+/a", 0),
            Err(TopicError::InvalidShareGroup)
        );
        assert_eq!(
            validate_topic_filter("$share/g/", 0),
            Err(TopicError::EmptySharedFilter)
        );
        assert_eq!(
            validate_topic_filter("$share/g", 0),
            Err(TopicError::InvalidShareGroup)
        );
    }

    #[test]
    fn test_max_levels() {
        assert!(validate_topic_name("a/b/c", 3).is_ok());
        assert_eq!(
            validate_topic_name("/a/b/c", 3),
            Err(TopicError::TooManyLevels)
        );
        assert!(validate_topic_filter("$share/group/a/b/c", 3).is_ok());
        assert_eq!(
            validate_topic_filter("a/b/c/#", 3),
            Err(TopicError::TooManyLevels)
        );
    }

    #[test]
    fn test_split_shared() {
        assert_eq!(split_shared("a/b"), Ok(None));
        assert_eq!(split_shared("$share/g/a/b"), Ok(Some(("g", "a/b"))));
    }

    #[test]
    fn test_topic_matches() {
        assert!(topic_matches_filter("test/topic", "test/topic"));
        assert!(!topic_matches_filter("test", "test/topic"));
        assert!(!topic_matches_filter("test/topic", "test"));

        assert!(topic_matches_filter("a/b/c", "+/b/+"));
        assert!(!topic_matches_filter("test", "+/+"));
        assert!(!topic_matches_filter("test/topic/extra", "test/+"));
        assert!(topic_matches_filter("/finance", "+/+"));

        assert!(topic_matches_filter("test", "test/#"));
        assert!(topic_matches_filter("test/topic/more", "#"));
        assert!(!topic_matches_filter("other/topic", "test/#"));

        assert!(!topic_matches_filter("$SYS/test", "+/test"));
        assert!(!topic_matches_filter("$SYS/test", "#"));
        assert!(topic_matches_filter("$SYS/test", "$SYS/#"));
    }
}
