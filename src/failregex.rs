//! Failure and ignore patterns.
//!
//! The `<HOST>` token in a pattern is replaced by a sub-pattern with a named
//! `host` group that matches an IPv4/IPv6 literal (optionally IPv4-mapped) or
//! a hostname. Patterns are compiled in multi-line mode so `$` anchors at
//! each line of a multi-line buffer.

use regex::{Regex, RegexBuilder};

use crate::error::{WardenError, WardenResult};

/// Replacement for the `<HOST>` shortcut.
pub const HOST_PATTERN: &str =
    r"(?:::f{4,6}:)?(?P<host>[0-9a-fA-F]{0,4}(?::[0-9a-fA-F]{0,4}){2,7}|[\w\-.^_]*\w)";

const HOST_TOKEN: &str = "<HOST>";

/// Compiled pattern together with the source text it was built from.
#[derive(Debug, Clone)]
pub struct CompiledRegex {
    source: String,
    regex: Regex,
}

impl CompiledRegex {
    pub fn new(pattern: &str) -> WardenResult<Self> {
        if pattern.trim().is_empty() {
            return Err(WardenError::Regex("empty pattern".to_string()));
        }
        let expanded = pattern.replace(HOST_TOKEN, HOST_PATTERN);
        let regex = RegexBuilder::new(&expanded)
            .multi_line(true)
            .build()
            .map_err(|e| WardenError::Regex(format!("unable to compile '{}': {}", pattern, e)))?;
        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.regex.is_match(text)
    }

    pub fn has_host_group(&self) -> bool {
        self.regex.capture_names().flatten().any(|n| n == "host")
    }
}

/// Result of a failure pattern match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailMatch {
    /// Index of the pattern that matched.
    pub index: usize,
    /// The `host` capture.
    pub host: String,
    /// Byte range of the whole match in the searched text.
    pub start: usize,
    pub end: usize,
}

/// Ordered fail and ignore patterns of a filter.
#[derive(Debug, Clone, Default)]
pub struct RegexList {
    fail: Vec<CompiledRegex>,
    ignore: Vec<CompiledRegex>,
}

impl RegexList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a failure pattern; it must yield a `host` group.
    pub fn add_fail(&mut self, pattern: &str) -> WardenResult<()> {
        let compiled = CompiledRegex::new(pattern)?;
        if !compiled.has_host_group() {
            return Err(WardenError::Regex(format!(
                "no 'host' group in '{}'",
                pattern
            )));
        }
        self.fail.push(compiled);
        Ok(())
    }

    pub fn add_ignore(&mut self, pattern: &str) -> WardenResult<()> {
        self.ignore.push(CompiledRegex::new(pattern)?);
        Ok(())
    }

    pub fn remove_fail(&mut self, index: usize) -> WardenResult<String> {
        remove_at(&mut self.fail, index)
    }

    pub fn remove_ignore(&mut self, index: usize) -> WardenResult<String> {
        remove_at(&mut self.ignore, index)
    }

    pub fn fail_patterns(&self) -> Vec<String> {
        self.fail.iter().map(|r| r.source.clone()).collect()
    }

    pub fn ignore_patterns(&self) -> Vec<String> {
        self.ignore.iter().map(|r| r.source.clone()).collect()
    }

    /// True if any ignore pattern matches `text`.
    pub fn is_ignored(&self, text: &str) -> bool {
        self.ignore.iter().any(|r| r.is_match(text))
    }

    /// First failure pattern (in insertion order) that matches `text`.
    pub fn find_failure(&self, text: &str) -> Option<FailMatch> {
        self.fail.iter().enumerate().find_map(|(index, r)| {
            let caps = r.regex.captures(text)?;
            let whole = caps.get(0)?;
            let host = caps.name("host")?.as_str().to_string();
            Some(FailMatch {
                index,
                host,
                start: whole.start(),
                end: whole.end(),
            })
        })
    }
}

fn remove_at(list: &mut Vec<CompiledRegex>, index: usize) -> WardenResult<String> {
    if index >= list.len() {
        return Err(WardenError::Config(format!(
            "regex index {} out of range (have {})",
            index,
            list.len()
        )));
    }
    Ok(list.remove(index).source)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_expansion_ipv4() {
        let mut list = RegexList::new();
        list.add_fail("Authentication failure for .* from <HOST>$").unwrap();
        let m = list
            .find_failure("Authentication failure for root from 193.168.0.128")
            .unwrap();
        assert_eq!(m.host, "193.168.0.128");
        assert_eq!(m.index, 0);
    }

    #[test]
    fn test_host_expansion_ipv6() {
        let mut list = RegexList::new();
        list.add_fail("from <HOST> port").unwrap();
        let m = list.find_failure("from 2001:db8::1 port 22").unwrap();
        assert_eq!(m.host, "2001:db8::1");
    }

    #[test]
    fn test_host_expansion_mapped() {
        let mut list = RegexList::new();
        list.add_fail("from <HOST> port").unwrap();
        let m = list.find_failure("from ::ffff:10.0.0.1 port 22").unwrap();
        assert_eq!(m.host, "10.0.0.1");
    }

    #[test]
    fn test_host_expansion_hostname() {
        let mut list = RegexList::new();
        list.add_fail("rhost=<HOST>").unwrap();
        let m = list.find_failure("auth failure; rhost=evil.example.com").unwrap();
        assert_eq!(m.host, "evil.example.com");
    }

    #[test]
    fn test_missing_host_group_rejected() {
        let mut list = RegexList::new();
        let err = list.add_fail("Authentication failure").unwrap_err();
        assert!(matches!(err, WardenError::Regex(_)));
        assert!(list.fail_patterns().is_empty());
    }

    #[test]
    fn test_explicit_host_group_accepted() {
        let mut list = RegexList::new();
        list.add_fail(r"from (?P<host>\S+)$").unwrap();
        assert_eq!(list.find_failure("from 1.2.3.4").unwrap().host, "1.2.3.4");
    }

    #[test]
    fn test_empty_and_invalid_rejected() {
        let mut list = RegexList::new();
        assert!(list.add_fail("").is_err());
        assert!(list.add_ignore("   ").is_err());
        assert!(list.add_fail("(<HOST>").is_err());
    }

    #[test]
    fn test_first_match_wins() {
        let mut list = RegexList::new();
        list.add_fail(r"user \S+ from <HOST>").unwrap();
        list.add_fail(r"from <HOST>").unwrap();
        let m = list.find_failure("user bob from 1.1.1.1").unwrap();
        assert_eq!(m.index, 0);
        let m = list.find_failure("guest from 2.2.2.2").unwrap();
        assert_eq!(m.index, 1);
    }

    #[test]
    fn test_ignore() {
        let mut list = RegexList::new();
        list.add_ignore("for user nagios").unwrap();
        assert!(list.is_ignored("failed for user nagios from 1.2.3.4"));
        assert!(!list.is_ignored("failed for user root from 1.2.3.4"));
    }

    #[test]
    fn test_remove_by_index() {
        let mut list = RegexList::new();
        list.add_fail("a <HOST>").unwrap();
        list.add_fail("b <HOST>").unwrap();
        assert_eq!(list.remove_fail(0).unwrap(), "a <HOST>");
        assert_eq!(list.fail_patterns(), vec!["b <HOST>"]);
        assert!(list.remove_fail(5).is_err());
        assert!(list.remove_ignore(0).is_err());
    }

    #[test]
    fn test_multiline_dollar() {
        let mut list = RegexList::new();
        list.add_fail("from <HOST>$").unwrap();
        let m = list.find_failure("from 1.1.1.1\nsomething else").unwrap();
        assert_eq!(m.host, "1.1.1.1");
    }
}
