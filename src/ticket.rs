//! Fail and ban tickets passed between filter, fail manager and actions.

use crate::net::Address;

/// A failure (or a batch of failures) attributed to one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailTicket {
    pub addr: Address,
    pub time: i64,
    pub attempts: u32,
    pub matches: Vec<String>,
}

impl FailTicket {
    pub fn new(addr: Address, time: i64) -> Self {
        Self {
            addr,
            time,
            attempts: 1,
            matches: Vec::new(),
        }
    }

    pub fn with_matches(mut self, matches: Vec<String>) -> Self {
        self.matches = matches;
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

/// An active ban. `duration < 0` means the ban never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanTicket {
    pub addr: Address,
    pub start: i64,
    pub duration: i64,
    pub attempts: u32,
    pub matches: Vec<String>,
}

impl BanTicket {
    pub fn new(addr: Address, start: i64, duration: i64) -> Self {
        Self {
            addr,
            start,
            duration,
            attempts: 0,
            matches: Vec::new(),
        }
    }

    pub fn from_fail(fail: &FailTicket, start: i64, duration: i64) -> Self {
        Self {
            addr: fail.addr.clone(),
            start,
            duration,
            attempts: fail.attempts,
            matches: fail.matches.clone(),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.duration < 0
    }

    /// End of the ban, or `None` for a permanent one.
    pub fn end(&self) -> Option<i64> {
        if self.is_permanent() {
            None
        } else {
            Some(self.start.saturating_add(self.duration))
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.end().map(|end| end <= now).unwrap_or(false)
    }

    /// Event tags for command substitution: `ip`, `time`, `failures`, `matches`.
    pub fn event_info(&self) -> EventInfo {
        EventInfo {
            ip: self.addr.to_string(),
            time: self.start,
            failures: self.attempts,
            matches: self.matches.join("\n"),
        }
    }
}

/// Per-event values substituted into action templates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventInfo {
    pub ip: String,
    pub time: i64,
    pub failures: u32,
    pub matches: String,
}

impl EventInfo {
    pub fn get(&self, tag: &str) -> Option<String> {
        match tag {
            "ip" => Some(self.ip.clone()),
            "time" => Some(self.time.to_string()),
            "failures" => Some(self.failures.to_string()),
            "matches" => Some(self.matches.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fail_ticket_defaults() {
        let t = FailTicket::new(Address::parse("1.2.3.4"), 100);
        assert_eq!(t.attempts, 1);
        assert!(t.matches.is_empty());
    }

    #[test]
    fn test_ban_ticket_end() {
        let t = BanTicket::new(Address::parse("1.2.3.4"), 1000, 600);
        assert_eq!(t.end(), Some(1600));
        assert!(!t.is_expired(1599));
        assert!(t.is_expired(1600));
    }

    #[test]
    fn test_permanent_ban_never_expires() {
        let t = BanTicket::new(Address::parse("1.2.3.4"), 1000, -1);
        assert!(t.is_permanent());
        assert_eq!(t.end(), None);
        assert!(!t.is_expired(i64::MAX));
    }

    #[test]
    fn test_event_info_tags() {
        let fail = FailTicket::new(Address::parse("10.0.0.1"), 50)
            .with_attempts(3)
            .with_matches(vec!["a".into(), "b".into()]);
        let ban = BanTicket::from_fail(&fail, 60, 600);
        let info = ban.event_info();
        assert_eq!(info.get("ip").as_deref(), Some("10.0.0.1"));
        assert_eq!(info.get("time").as_deref(), Some("60"));
        assert_eq!(info.get("failures").as_deref(), Some("3"));
        assert_eq!(info.get("matches").as_deref(), Some("a\nb"));
        assert_eq!(info.get("other"), None);
    }
}
