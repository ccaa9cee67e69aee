//! Value patterns for index searches.
//!
//! A pattern string is parsed by its wildcard placement: `*x*` matches
//! values containing `x`, `x*` values starting with `x`, `*x` values ending
//! with `x`, a lone `*` (or empty string) matches everything and anything
//! else is an exact match. Negated forms are built with [`QueryPattern::negate`].

use std::fmt;

const WILDCARD: char = '*';

/// A value pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPattern {
    /// Matches every value
    Any,
    /// Value equals the operand
    Exact(String),
    /// Value starts with the operand
    Prefix(String),
    /// Value ends with the operand
    Suffix(String),
    /// Value contains the operand
    Contains(String),
    /// Value differs from the operand
    NotEqual(String),
    /// Value does not start with the operand
    NotPrefix(String),
    /// Value does not end with the operand
    NotSuffix(String),
    /// Value does not contain the operand
    NotContains(String),
}

impl QueryPattern {
    /// Parses a wildcard pattern.
    pub fn parse(pattern: &str) -> Self {
        if pattern.is_empty() || pattern.chars().all(|c| c == WILDCARD) {
            return QueryPattern::Any;
        }

        let leading = pattern.starts_with(WILDCARD);
        let trailing = pattern.ends_with(WILDCARD);
        let operand = pattern.trim_matches(WILDCARD).to_string();

        match (leading, trailing) {
            (true, true) => QueryPattern::Contains(operand),
            (false, true) => QueryPattern::Prefix(operand),
            (true, false) => QueryPattern::Suffix(operand),
            (false, false) => QueryPattern::Exact(operand),
        }
    }

    /// Returns the complementary pattern.
    ///
    /// `Any` has no complement and is returned unchanged.
    pub fn negate(self) -> Self {
        match self {
            QueryPattern::Any => QueryPattern::Any,
            QueryPattern::Exact(s) => QueryPattern::NotEqual(s),
            QueryPattern::Prefix(s) => QueryPattern::NotPrefix(s),
            QueryPattern::Suffix(s) => QueryPattern::NotSuffix(s),
            QueryPattern::Contains(s) => QueryPattern::NotContains(s),
            QueryPattern::NotEqual(s) => QueryPattern::Exact(s),
            QueryPattern::NotPrefix(s) => QueryPattern::Prefix(s),
            QueryPattern::NotSuffix(s) => QueryPattern::Suffix(s),
            QueryPattern::NotContains(s) => QueryPattern::Contains(s),
        }
    }

    /// Tests a value against the pattern.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            QueryPattern::Any => true,
            QueryPattern::Exact(s) => value == s,
            QueryPattern::Prefix(s) => value.starts_with(s.as_str()),
            QueryPattern::Suffix(s) => value.ends_with(s.as_str()),
            QueryPattern::Contains(s) => value.contains(s.as_str()),
            QueryPattern::NotEqual(s) => value != s,
            QueryPattern::NotPrefix(s) => !value.starts_with(s.as_str()),
            QueryPattern::NotSuffix(s) => !value.ends_with(s.as_str()),
            QueryPattern::NotContains(s) => !value.contains(s.as_str()),
        }
    }

    /// Key to seek to when the pattern selects a contiguous range of an
    /// ordered index. `None` means the whole index must be scanned.
    pub fn seek_key(&self) -> Option<&str> {
        match self {
            QueryPattern::Exact(s) | QueryPattern::Prefix(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// For range patterns, returns false once an ordered scan has moved past
    /// the last possible match.
    pub fn in_range(&self, value: &str) -> bool {
        match self {
            QueryPattern::Exact(s) => value == s,
            QueryPattern::Prefix(s) => value.starts_with(s.as_str()),
            _ => true,
        }
    }
}

impl fmt::Display for QueryPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryPattern::Any => write!(f, "*"),
            QueryPattern::Exact(s) => write!(f, "{}", s),
            QueryPattern::Prefix(s) => write!(f, "{}*", s),
            QueryPattern::Suffix(s) => write!(f, "*{}", s),
            QueryPattern::Contains(s) => write!(f, "*{}*", s),
            QueryPattern::NotEqual(s) => write!(f, "!{}", s),
            QueryPattern::NotPrefix(s) => write!(f, "!{}*", s),
            QueryPattern::NotSuffix(s) => write!(f, "!*{}", s),
            QueryPattern::NotContains(s) => write!(f, "!*{}*", s),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        assert_eq!(QueryPattern::parse("*"), QueryPattern::Any);
        assert_eq!(QueryPattern::parse(""), QueryPattern::Any);
        assert_eq!(QueryPattern::parse("abc"), QueryPattern::Exact("abc".into()));
        assert_eq!(QueryPattern::parse("ab*"), QueryPattern::Prefix("ab".into()));
        assert_eq!(QueryPattern::parse("*bc"), QueryPattern::Suffix("bc".into()));
        assert_eq!(QueryPattern::parse("*b*"), QueryPattern::Contains("b".into()));
    }

    #[test]
    fn test_matches() {
        let values = ["alpha", "alps", "beta", "gamma"];
        let hits = |p: QueryPattern| -> Vec<&str> {
            values.iter().copied().filter(|v| p.matches(v)).collect()
        };

        assert_eq!(hits(QueryPattern::parse("al*")), vec!["alpha", "alps"]);
        assert_eq!(hits(QueryPattern::parse("*ta")), vec!["beta"]);
        assert_eq!(hits(QueryPattern::parse("*mm*")), vec!["gamma"]);
        assert_eq!(hits(QueryPattern::parse("beta")), vec!["beta"]);
        assert_eq!(hits(QueryPattern::parse("al*").negate()), vec!["beta", "gamma"]);
        assert_eq!(hits(QueryPattern::parse("*a").negate()), vec!["alps"]);
    }

    #[test]
    fn test_negate_twice() {
        let p = QueryPattern::parse("*x*");
        assert_eq!(p.clone().negate().negate(), p);
    }

    #[test]
    fn test_range() {
        let p = QueryPattern::parse("al*");
        assert_eq!(p.seek_key(), Some("al"));
        assert!(p.in_range("alps"));
        assert!(!p.in_range("beta"));
        assert_eq!(QueryPattern::parse("*a").seek_key(), None);
    }
}
