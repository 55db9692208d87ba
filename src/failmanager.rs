//! Sliding-window failure accounting per source address.
//!
//! Each source has at most one entry. The window is anchored at
//! `last_reset`: when a failure arrives more than `find_time` seconds after
//! the anchor, the count restarts from that failure.

use parking_lot::Mutex;
use std::collections::HashMap;

use crate::net::Address;
use crate::ticket::FailTicket;

pub const DEFAULT_MAX_RETRY: u32 = 3;
pub const DEFAULT_FIND_TIME: i64 = 600;

#[derive(Debug, Clone)]
struct FailData {
    attempts: u32,
    first_seen: i64,
    last_seen: i64,
    last_reset: i64,
    matches: Vec<String>,
    seq: u64,
}

#[derive(Debug)]
struct Inner {
    entries: HashMap<Address, FailData>,
    total: u64,
    next_seq: u64,
    max_retry: u32,
    find_time: i64,
}

/// Per-jail fail table.
#[derive(Debug)]
pub struct FailManager {
    inner: Mutex<Inner>,
}

impl Default for FailManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FailManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                total: 0,
                next_seq: 0,
                max_retry: DEFAULT_MAX_RETRY,
                find_time: DEFAULT_FIND_TIME,
            }),
        }
    }

    pub fn max_retry(&self) -> u32 {
        self.inner.lock().max_retry
    }

    pub fn set_max_retry(&self, n: u32) {
        self.inner.lock().max_retry = n;
    }

    pub fn find_time(&self) -> i64 {
        self.inner.lock().find_time
    }

    pub fn set_find_time(&self, secs: i64) {
        self.inner.lock().find_time = secs;
    }

    /// Record a failure.
    pub fn add(&self, ticket: FailTicket) {
        let mut inner = self.inner.lock();
        let window = inner.find_time;
        let seq = inner.next_seq;
        let attempts = ticket.attempts.max(1);

        let mut inserted = false;
        let data = inner.entries.entry(ticket.addr).or_insert_with(|| {
            inserted = true;
            FailData {
                attempts: 0,
                first_seen: ticket.time,
                last_seen: ticket.time,
                last_reset: ticket.time,
                matches: Vec::new(),
                seq,
            }
        });

        if !inserted && data.last_reset < ticket.time - window {
            data.attempts = 0;
            data.last_reset = ticket.time;
            data.first_seen = ticket.time;
            data.matches.clear();
        }
        data.attempts = data.attempts.saturating_add(attempts);
        data.matches.extend(ticket.matches);
        data.last_seen = data.last_seen.max(ticket.time);

        if inserted {
            inner.next_seq += 1;
        }
        inner.total += u64::from(attempts);
    }

    /// Drop entries whose last failure is older than the window.
    pub fn cleanup(&self, now: i64) {
        let mut inner = self.inner.lock();
        let horizon = now - inner.find_time;
        inner.entries.retain(|_, d| d.last_seen >= horizon);
    }

    /// Remove and return the oldest entry that reached the retry threshold.
    /// `None` means nothing is eligible; drain by looping until `None`.
    pub fn to_ban(&self) -> Option<FailTicket> {
        let mut inner = self.inner.lock();
        let max_retry = inner.max_retry;
        let addr = inner
            .entries
            .iter()
            .filter(|(_, d)| d.attempts >= max_retry)
            .min_by_key(|(_, d)| d.seq)
            .map(|(a, _)| a.clone())?;
        let data = inner.entries.remove(&addr)?;
        Some(FailTicket {
            addr,
            time: data.last_seen,
            attempts: data.attempts,
            matches: data.matches,
        })
    }

    /// Attempts currently counted for `addr` in its window.
    pub fn attempts(&self, addr: &Address) -> Option<u32> {
        self.inner.lock().entries.get(addr).map(|d| d.attempts)
    }

    /// First failure time of the current window for `addr`.
    pub fn first_seen(&self, addr: &Address) -> Option<i64> {
        self.inner.lock().entries.get(addr).map(|d| d.first_seen)
    }

    pub fn size(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn total(&self) -> u64 {
        self.inner.lock().total
    }
}
