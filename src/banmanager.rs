//! Active bans for one jail.
//!
//! Tickets are kept in insertion order so that unbans happen in the order
//! bans were applied. A source appears at most once; a duplicate insert can
//! only push the end of the existing ban further out.

use parking_lot::Mutex;

use crate::net::Address;
use crate::ticket::{BanTicket, FailTicket};

pub const DEFAULT_BAN_TIME: i64 = 600;

/// Result of [`BanManager::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanOutcome {
    /// New ban; the ban commands must run.
    Banned,
    /// The source was already banned and its end moved later.
    Prolonged,
    /// The source was already banned at least as long.
    AlreadyBanned,
}

impl BanOutcome {
    pub fn is_new(self) -> bool {
        self == BanOutcome::Banned
    }
}

#[derive(Debug)]
struct Inner {
    tickets: Vec<BanTicket>,
    total: u64,
    ban_time: i64,
}

#[derive(Debug)]
pub struct BanManager {
    inner: Mutex<Inner>,
}

impl Default for BanManager {
    fn default() -> Self {
        Self::new()
    }
}

impl BanManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tickets: Vec::new(),
                total: 0,
                ban_time: DEFAULT_BAN_TIME,
            }),
        }
    }

    pub fn ban_time(&self) -> i64 {
        self.inner.lock().ban_time
    }

    pub fn set_ban_time(&self, secs: i64) {
        self.inner.lock().ban_time = secs;
    }

    /// Build a ban ticket for `fail` starting at `now`, using the current ban time.
    pub fn create_ban_ticket(&self, fail: &FailTicket, now: i64) -> BanTicket {
        BanTicket::from_fail(fail, now, self.ban_time())
    }

    /// Insert a ticket. Start time of an existing ban never changes; its
    /// end becomes the later of the two, permanent winning over finite.
    pub fn add(&self, ticket: BanTicket) -> BanOutcome {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.tickets.iter_mut().find(|t| t.addr == ticket.addr) {
            if existing.is_permanent() {
                return BanOutcome::AlreadyBanned;
            }
            if ticket.is_permanent() {
                existing.duration = -1;
                return BanOutcome::Prolonged;
            }
            let (Some(old_end), Some(new_end)) = (existing.end(), ticket.end()) else {
                return BanOutcome::AlreadyBanned;
            };
            if new_end > old_end {
                existing.duration = new_end - existing.start;
                return BanOutcome::Prolonged;
            }
            return BanOutcome::AlreadyBanned;
        }
        inner.tickets.push(ticket);
        inner.total += 1;
        BanOutcome::Banned
    }

    /// Remove and return every ticket whose end is at or before `now`,
    /// preserving insertion order.
    pub fn expired(&self, now: i64) -> Vec<BanTicket> {
        let mut inner = self.inner.lock();
        let (gone, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut inner.tickets)
            .into_iter()
            .partition(|t| t.is_expired(now));
        inner.tickets = kept;
        gone
    }

    /// Remove and return every ticket.
    pub fn flush_all(&self) -> Vec<BanTicket> {
        std::mem::take(&mut self.inner.lock().tickets)
    }

    pub fn get(&self, addr: &Address) -> Option<BanTicket> {
        self.inner
            .lock()
            .tickets
            .iter()
            .find(|t| &t.addr == addr)
            .cloned()
    }

    pub fn remove(&self, addr: &Address) -> Option<BanTicket> {
        let mut inner = self.inner.lock();
        let pos = inner.tickets.iter().position(|t| &t.addr == addr)?;
        Some(inner.tickets.remove(pos))
    }

    pub fn contains(&self, addr: &Address) -> bool {
        self.inner.lock().tickets.iter().any(|t| &t.addr == addr)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().tickets.len()
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn banned_addresses(&self) -> Vec<Address> {
        self.inner
            .lock()
            .tickets
            .iter()
            .map(|t| t.addr.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ban(ip: &str, start: i64, duration: i64) -> BanTicket {
        BanTicket::new(Address::parse(ip), start, duration)
    }

    #[test]
    fn test_add_and_contains() {
        let bm = BanManager::new();
        assert_eq!(bm.add(ban("1.2.3.4", 0, 600)), BanOutcome::Banned);
        assert!(bm.contains(&Address::parse("1.2.3.4")));
        assert_eq!(bm.size(), 1);
        assert_eq!(bm.total(), 1);
    }

    #[test]
    fn test_duplicate_is_rejected() {
        let bm = BanManager::new();
        bm.add(ban("1.2.3.4", 0, 600));
        assert_eq!(bm.add(ban("1.2.3.4", 10, 100)), BanOutcome::AlreadyBanned);
        assert_eq!(bm.size(), 1);
        assert_eq!(bm.total(), 1);
        assert_eq!(bm.get(&Address::parse("1.2.3.4")).unwrap().end(), Some(600));
    }

    #[test]
    fn test_prolongation_keeps_start() {
        let bm = BanManager::new();
        bm.add(ban("1.2.3.4", 1000, 600));
        assert_eq!(bm.add(ban("1.2.3.4", 1100, 3600)), BanOutcome::Prolonged);
        let t = bm.get(&Address::parse("1.2.3.4")).unwrap();
        assert_eq!(t.start, 1000);
        assert_eq!(t.end(), Some(4700));
    }

    #[test]
    fn test_permanent_supersedes() {
        let bm = BanManager::new();
        bm.add(ban("1.2.3.4", 0, 600));
        assert_eq!(bm.add(ban("1.2.3.4", 5, -1)), BanOutcome::Prolonged);
        assert!(bm.get(&Address::parse("1.2.3.4")).unwrap().is_permanent());
        assert_eq!(bm.add(ban("1.2.3.4", 9, 99999)), BanOutcome::AlreadyBanned);
        assert!(bm.expired(i64::MAX).is_empty());
    }

    #[test]
    fn test_expired_in_order() {
        let bm = BanManager::new();
        bm.add(ban("1.1.1.1", 0, 100));
        bm.add(ban("2.2.2.2", 0, 50));
        bm.add(ban("3.3.3.3", 0, 500));
        bm.add(ban("4.4.4.4", 0, -1));
        let gone: Vec<String> = bm.expired(100).iter().map(|t| t.addr.to_string()).collect();
        assert_eq!(gone, vec!["1.1.1.1", "2.2.2.2"]);
        assert_eq!(bm.size(), 2);
        assert!(bm.expired(499).is_empty());
    }

    #[test]
    fn test_flush_all() {
        let bm = BanManager::new();
        bm.add(ban("1.1.1.1", 0, 100));
        bm.add(ban("2.2.2.2", 0, -1));
        assert_eq!(bm.flush_all().len(), 2);
        assert_eq!(bm.size(), 0);
        assert_eq!(bm.total(), 2);
    }

    #[test]
    fn test_remove() {
        let bm = BanManager::new();
        bm.add(ban("1.1.1.1", 0, 100));
        assert!(bm.remove(&Address::parse("1.1.1.1")).is_some());
        assert!(bm.remove(&Address::parse("1.1.1.1")).is_none());
    }

    #[test]
    fn test_create_ban_ticket_uses_ban_time() {
        let bm = BanManager::new();
        bm.set_ban_time(3600);
        let fail = FailTicket::new(Address::parse("1.1.1.1"), 10).with_attempts(4);
        let t = bm.create_ban_ticket(&fail, 20);
        assert_eq!(t.start, 20);
        assert_eq!(t.duration, 3600);
        assert_eq!(t.attempts, 4);
    }

    fn end_of(d: i64, start: i64) -> Option<i64> {
        if d < 0 {
            None
        } else {
            Some(start + d)
        }
    }

    proptest! {
        #[test]
        fn prop_duplicate_ban_law(d1 in -1i64..5000, d2 in -1i64..5000, gap in 0i64..1000) {
            let bm = BanManager::new();
            bm.add(ban("5.5.5.5", 1000, d1));
            bm.add(ban("5.5.5.5", 1000 + gap, d2));
            let stored = bm.get(&Address::parse("5.5.5.5")).unwrap();
            prop_assert_eq!(stored.start, 1000);
            let expected = match (end_of(d1, 1000), end_of(d2, 1000 + gap)) {
                (None, _) | (_, None) => None,
                (Some(a), Some(b)) => Some(a.max(b)),
            };
            prop_assert_eq!(stored.end(), expected);
        }
    }
}
