//! Log filter: reads watched files, extracts failures, feeds the fail manager.
//!
//! Per line:
//! 1. the date detector finds the timestamp and the date text is cut out of
//!    the line, so it cannot take part in a host match;
//! 2. ignore patterns are checked against the rest of the line;
//! 3. fail patterns are tried in order against the multi-line buffer and the
//!    first one to match yields the host, which becomes one fail event per
//!    address (resolved through DNS if it is a name);
//! 4. events older than the find-time window, or from ignored addresses, are
//!    dropped; the rest go to the fail manager.
//!
//! The worker drains fail-to-ban transitions into the jail queue after every
//! wake and blocks when the queue is full.

mod backend;
mod container;
mod notifier;
mod poll;

pub use backend::{create_watcher, Backend, LogWatcher, WatchEvent};
pub use container::FileContainer;
pub use notifier::NotifyWatcher;
pub use poll::PollWatcher;

#[cfg(test)]
pub use backend::mock;

use encoding_rs::{Encoding, UTF_8};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::action::CommandRunner;
use crate::clock::SharedClock;
use crate::datedetector::DateDetector;
use crate::dns::{self, UseDns};
use crate::error::{WardenError, WardenResult};
use crate::failmanager::FailManager;
use crate::failregex::RegexList;
use crate::net::{Address, IgnoreList};
use crate::signal::ShutdownToken;
use crate::ticket::FailTicket;

/// Consecutive stat failures after which the jail goes idle.
pub const MAX_MISSING: u32 = 3;

pub struct Filter {
    jail: String,
    clock: SharedClock,
    fail_manager: Arc<FailManager>,
    date_detector: DateDetector,
    regexes: RwLock<RegexList>,
    ignore_ips: RwLock<IgnoreList>,
    use_dns: RwLock<UseDns>,
    max_lines: AtomicUsize,
    line_buffer: Mutex<VecDeque<String>>,
    containers: Mutex<Vec<FileContainer>>,
    missing: Mutex<HashMap<PathBuf, u32>>,
    encoding: RwLock<&'static Encoding>,
    ignore_command: RwLock<String>,
    runner: Option<CommandRunner>,
    watcher: Arc<dyn LogWatcher>,
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Filter")
            .field("jail", &self.jail)
            .field("backend", &self.watcher.name())
            .finish()
    }
}

impl Filter {
    pub fn new(
        jail: &str,
        clock: SharedClock,
        watcher: Arc<dyn LogWatcher>,
    ) -> WardenResult<Self> {
        Ok(Self {
            jail: jail.to_string(),
            date_detector: DateDetector::with_defaults(clock.clone())?,
            clock,
            fail_manager: Arc::new(FailManager::new()),
            regexes: RwLock::new(RegexList::new()),
            ignore_ips: RwLock::new(IgnoreList::new()),
            use_dns: RwLock::new(UseDns::default()),
            max_lines: AtomicUsize::new(1),
            line_buffer: Mutex::new(VecDeque::new()),
            containers: Mutex::new(Vec::new()),
            missing: Mutex::new(HashMap::new()),
            encoding: RwLock::new(UTF_8),
            ignore_command: RwLock::new(String::new()),
            runner: None,
            watcher,
        })
    }

    /// Runner for the ignore command.
    pub fn with_command_runner(mut self, runner: CommandRunner) -> Self {
        self.runner = Some(runner);
        self
    }

    /// Replace the date detector (tests pin it to UTC).
    pub fn with_date_detector(mut self, detector: DateDetector) -> Self {
        self.date_detector = detector;
        self
    }

    pub fn fail_manager(&self) -> &FailManager {
        &self.fail_manager
    }

    /// Handle to the fail table, for actions that need to hand failures back.
    pub fn shared_fail_manager(&self) -> Arc<FailManager> {
        Arc::clone(&self.fail_manager)
    }

    pub fn date_detector(&self) -> &DateDetector {
        &self.date_detector
    }

    pub fn backend_name(&self) -> &'static str {
        self.watcher.name()
    }

    // --- log paths ---

    pub fn add_log_path(&self, path: &Path, tail: bool) -> WardenResult<()> {
        let mut containers = self.containers.lock();
        if containers.iter().any(|c| c.path() == path) {
            return Err(WardenError::Config(format!(
                "{} already exists",
                path.display()
            )));
        }
        let mut container = FileContainer::new(path, tail)?;
        container.set_encoding(*self.encoding.read());
        self.watcher.watch(path)?;
        containers.push(container);
        info!("[{}] Added logfile = {}", self.jail, path.display());
        Ok(())
    }

    pub fn del_log_path(&self, path: &Path) -> WardenResult<()> {
        let mut containers = self.containers.lock();
        let before = containers.len();
        containers.retain(|c| c.path() != path);
        if containers.len() == before {
            return Err(WardenError::Config(format!(
                "{} is not a log path of this jail",
                path.display()
            )));
        }
        self.watcher.unwatch(path);
        self.missing.lock().remove(path);
        info!("[{}] Removed logfile = {}", self.jail, path.display());
        Ok(())
    }

    pub fn log_paths(&self) -> Vec<PathBuf> {
        self.containers
            .lock()
            .iter()
            .map(|c| c.path().to_path_buf())
            .collect()
    }

    // --- patterns ---

    pub fn add_fail_regex(&self, pattern: &str) -> WardenResult<()> {
        self.regexes.write().add_fail(pattern)
    }

    pub fn del_fail_regex(&self, index: usize) -> WardenResult<String> {
        self.regexes.write().remove_fail(index)
    }

    pub fn fail_regex(&self) -> Vec<String> {
        self.regexes.read().fail_patterns()
    }

    pub fn add_ignore_regex(&self, pattern: &str) -> WardenResult<()> {
        self.regexes.write().add_ignore(pattern)
    }

    pub fn del_ignore_regex(&self, index: usize) -> WardenResult<String> {
        self.regexes.write().remove_ignore(index)
    }

    pub fn ignore_regex(&self) -> Vec<String> {
        self.regexes.read().ignore_patterns()
    }

    // --- ignore addresses ---

    pub fn add_ignore_ip(&self, entry: &str) {
        if self.ignore_ips.write().add(entry) {
            debug!("[{}] Add {} to ignore list", self.jail, entry);
        }
    }

    pub fn del_ignore_ip(&self, entry: &str) -> WardenResult<()> {
        if self.ignore_ips.write().remove(entry) {
            debug!("[{}] Remove {} from ignore list", self.jail, entry);
            Ok(())
        } else {
            Err(WardenError::Config(format!("{} is not in the ignore list", entry)))
        }
    }

    pub fn ignore_ips(&self) -> Vec<String> {
        self.ignore_ips.read().entries()
    }

    /// True when `addr` is in the ignore list or the ignore command exits 0
    /// for it.
    pub fn in_ignore_ip_list(&self, addr: &Address) -> bool {
        if self.ignore_ips.read().is_ignored(addr) {
            return true;
        }
        let template = self.ignore_command.read().clone();
        if template.is_empty() {
            return false;
        }
        match &self.runner {
            Some(runner) => runner.check_status(&template.replace("<ip>", &addr.to_string())),
            None => false,
        }
    }

    pub fn ignore_command(&self) -> String {
        self.ignore_command.read().clone()
    }

    /// Command run for each candidate address; `<ip>` is replaced by the
    /// address. Empty disables it.
    pub fn set_ignore_command(&self, command: &str) {
        *self.ignore_command.write() = command.to_string();
        info!("[{}] Set ignorecommand = {}", self.jail, command);
    }

    // --- settings ---

    pub fn find_time(&self) -> i64 {
        self.fail_manager.find_time()
    }

    pub fn set_find_time(&self, secs: i64) {
        self.fail_manager.set_find_time(secs);
        info!("[{}] Set findtime = {}", self.jail, secs);
    }

    pub fn max_retry(&self) -> u32 {
        self.fail_manager.max_retry()
    }

    pub fn set_max_retry(&self, n: u32) {
        self.fail_manager.set_max_retry(n);
        info!("[{}] Set maxRetry = {}", self.jail, n);
    }

    pub fn use_dns(&self) -> UseDns {
        *self.use_dns.read()
    }

    pub fn set_use_dns(&self, mode: UseDns) {
        *self.use_dns.write() = mode;
    }

    /// Name of the encoding log lines are decoded with.
    pub fn log_encoding(&self) -> &'static str {
        self.encoding.read().name()
    }

    /// Switch every watched file, and files added later, to the encoding
    /// named by `label`. `auto` means UTF-8.
    pub fn set_log_encoding(&self, label: &str) -> WardenResult<()> {
        let encoding = if label.eq_ignore_ascii_case("auto") {
            UTF_8
        } else {
            Encoding::for_label(label.trim().as_bytes())
                .ok_or_else(|| WardenError::Config(format!("unknown encoding '{}'", label)))?
        };
        // lines are split on '\n' bytes before decoding
        if !encoding.is_ascii_compatible() {
            return Err(WardenError::Config(format!(
                "encoding '{}' is not ASCII compatible",
                encoding.name()
            )));
        }
        *self.encoding.write() = encoding;
        for container in self.containers.lock().iter_mut() {
            container.set_encoding(encoding);
        }
        info!("[{}] Set jail log file encoding to {}", self.jail, encoding.name());
        Ok(())
    }

    pub fn date_pattern(&self) -> Option<(String, String)> {
        self.date_detector.pattern()
    }

    pub fn set_date_pattern(&self, pattern: &str) -> WardenResult<()> {
        self.date_detector.set_pattern(pattern)?;
        info!("[{}] Date pattern set to {:?}", self.jail, pattern);
        Ok(())
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines.load(Ordering::Relaxed)
    }

    pub fn set_max_lines(&self, n: usize) -> WardenResult<()> {
        if n == 0 {
            return Err(WardenError::Config("maxlines must be at least 1".to_string()));
        }
        self.max_lines.store(n, Ordering::Relaxed);
        let mut buffer = self.line_buffer.lock();
        while buffer.len() > n {
            buffer.pop_front();
        }
        info!("[{}] Set maxLines = {}", self.jail, n);
        Ok(())
    }

    // --- line processing ---

    /// Extract fail events from one line without touching the fail manager.
    pub fn process_line(&self, line: &str) -> Vec<FailTicket> {
        let (time, log_part) = match self.date_detector.detect(line) {
            Some(m) => {
                let mut rest = String::with_capacity(line.len());
                rest.push_str(&line[..m.start]);
                rest.push_str(&line[m.end..]);
                (m.time, rest)
            }
            None => (None, line.to_string()),
        };

        let regexes = self.regexes.read();
        if regexes.is_ignored(&log_part) {
            return Vec::new();
        }

        let max_lines = self.max_lines();
        let mut buffer = self.line_buffer.lock();
        buffer.push_back(log_part);
        while buffer.len() > max_lines {
            buffer.pop_front();
        }
        let joined = buffer.iter().cloned().collect::<Vec<_>>().join("\n");

        let Some(found) = regexes.find_failure(&joined) else {
            return Vec::new();
        };
        let Some(time) = time else {
            debug!(
                "[{}] Found a match for {:?} but no valid date/time found",
                self.jail, line
            );
            return Vec::new();
        };

        remove_matched_lines(&mut buffer, found.start, found.end);
        drop(buffer);
        drop(regexes);

        dns::text_to_addresses(&found.host, self.use_dns())
            .into_iter()
            .map(|addr| FailTicket::new(addr, time).with_matches(vec![line.to_string()]))
            .collect()
    }

    /// Process one line and record what it yields. Returns how many fail
    /// events were added.
    pub fn process_line_and_add(&self, line: &str) -> usize {
        let horizon = self.clock.now() - self.find_time();
        let mut added = 0;
        for ticket in self.process_line(line) {
            if ticket.time < horizon {
                debug!("[{}] Ignore line since time {} < {}", self.jail, ticket.time, horizon);
                continue;
            }
            if self.in_ignore_ip_list(&ticket.addr) {
                info!("[{}] Ignore {}", self.jail, ticket.addr);
                continue;
            }
            info!("[{}] Found {}", self.jail, ticket.addr);
            self.fail_manager.add(ticket);
            added += 1;
        }
        added
    }

    /// Read new lines from the given files (all files when `paths` is
    /// empty) and process them. Blocking; run off the executor.
    pub fn process_files(&self, paths: &[PathBuf]) -> usize {
        let mut batches = Vec::new();
        {
            let mut containers = self.containers.lock();
            for container in containers.iter_mut() {
                if !paths.is_empty() && !paths.iter().any(|p| p == container.path()) {
                    continue;
                }
                match container.read_new_lines() {
                    Ok(lines) => batches.push(lines),
                    Err(e) => warn!("[{}] {}", self.jail, e),
                }
            }
        }
        batches
            .iter()
            .flatten()
            .map(|line| self.process_line_and_add(line))
            .sum()
    }

    /// Force a ban of `addr` by recording `max_retry` failures at once.
    pub fn add_banned_ip(&self, addr: &Address) -> WardenResult<()> {
        if !addr.is_valid() {
            return Err(WardenError::InvalidAddress(addr.raw().to_string()));
        }
        let ticket = FailTicket::new(addr.clone(), self.clock.now())
            .with_attempts(self.max_retry().max(1));
        self.fail_manager.add(ticket);
        Ok(())
    }

    /// Move every fail-to-ban transition into the jail queue, in order.
    /// Waits while the queue is full.
    pub async fn drain_to(&self, queue: &mpsc::Sender<FailTicket>) -> usize {
        let mut sent = 0;
        while let Some(ticket) = self.fail_manager.to_ban() {
            debug!("[{}] {} reached the retry threshold", self.jail, ticket.addr);
            if queue.send(ticket).await.is_err() {
                error!("[{}] Jail queue closed, dropping ban candidate", self.jail);
                break;
            }
            sent += 1;
        }
        sent
    }

    /// Count consecutive stat failures. Returns true when the threshold
    /// was reached (the counter is reset in that case).
    fn note_missing(&self, event: &WatchEvent) -> bool {
        let paths = self.log_paths();
        let mut missing = self.missing.lock();
        let mut tripped = false;
        for path in paths {
            if event.missing.contains(&path) {
                let count = missing.entry(path.clone()).or_insert(0);
                *count += 1;
                if *count >= MAX_MISSING {
                    warn!(
                        "[{}] Too many read errors on {}; setting the jail idle",
                        self.jail,
                        path.display()
                    );
                    *count = 0;
                    tripped = true;
                }
            } else {
                missing.remove(&path);
            }
        }
        tripped
    }

    pub fn status(&self) -> Value {
        let files: Vec<String> = self
            .log_paths()
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        json!([
            ["Currently failed", self.fail_manager.size()],
            ["Total failed", self.fail_manager.total()],
            ["File list", files],
        ])
    }
}

/// Drop buffered lines that overlap the byte range `[start, end)` of the
/// newline-joined buffer.
fn remove_matched_lines(buffer: &mut VecDeque<String>, start: usize, end: usize) {
    let mut offset = 0;
    let mut keep = VecDeque::with_capacity(buffer.len());
    for line in buffer.drain(..) {
        let line_end = offset + line.len();
        let overlaps = start <= line_end && end > offset;
        offset = line_end + 1;
        if !overlaps {
            keep.push_back(line);
        }
    }
    *buffer = keep;
}

/// Runtime knobs the worker needs from the jail.
#[derive(Clone)]
pub struct WorkerContext {
    pub queue: mpsc::Sender<FailTicket>,
    pub idle: Arc<AtomicBool>,
    pub token: ShutdownToken,
    pub poll_interval: Duration,
}

/// Filter worker: wait for changes, read, drain, clean up, repeat.
pub async fn run(filter: Arc<Filter>, ctx: WorkerContext) {
    debug!("[{}] Filter worker started ({})", filter.jail, filter.backend_name());
    loop {
        let event = tokio::select! {
            ev = filter.watcher.next_event(ctx.poll_interval) => ev,
            _ = ctx.token.cancelled() => break,
        };
        if ctx.token.is_cancelled() {
            break;
        }
        if ctx.idle.load(Ordering::Relaxed) {
            continue;
        }

        if filter.note_missing(&event) {
            ctx.idle.store(true, Ordering::Relaxed);
            continue;
        }

        if !event.modified.is_empty() {
            let worker = filter.clone();
            let paths = event.modified.clone();
            match tokio::task::spawn_blocking(move || worker.process_files(&paths)).await {
                Ok(n) if n > 0 => debug!("[{}] {} new fail event(s)", filter.jail, n),
                Ok(_) => {}
                Err(e) => error!("[{}] Line processing task failed: {}", filter.jail, e),
            }
        }

        tokio::select! {
            _ = filter.drain_to(&ctx.queue) => {}
            _ = ctx.token.cancelled() => break,
        }
        filter.fail_manager.cleanup(filter.clock.now());
        filter.date_detector.sort_by_hits();
    }
    debug!("[{}] Filter worker stopped", filter.jail);
}

#[cfg(test)]
mod tests {
    use super::mock::ScriptedWatcher;
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{FixedOffset, TimeZone, Utc};
    use std::io::Write;
    use tempfile::TempDir;

    const SSH_REGEX: &str = "Authentication failure for .* from <HOST>$";

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> i64 {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap().timestamp()
    }

    fn make_filter(now: i64) -> (Filter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(now));
        let detector = DateDetector::with_defaults(clock.clone())
            .unwrap()
            .with_offset(FixedOffset::east_opt(0).unwrap());
        let filter = Filter::new("ssh", clock.clone(), Arc::new(ScriptedWatcher::default()))
            .unwrap()
            .with_date_detector(detector);
        (filter, clock)
    }

    #[test]
    fn test_process_line_extracts_host() {
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 30, 0));
        f.add_fail_regex(SSH_REGEX).unwrap();
        let events = f.process_line(
            "Aug 14 11:59:59 i60p295 sshd[12365]: Authentication failure for roehl from 193.168.0.128",
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].addr, Address::parse("193.168.0.128"));
        assert_eq!(events[0].time, utc(2005, 8, 14, 11, 59, 59));
        assert_eq!(events[0].matches.len(), 1);
    }

    #[test]
    fn test_line_without_date_yields_nothing() {
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 30, 0));
        f.add_fail_regex(SSH_REGEX).unwrap();
        assert!(f
            .process_line("Authentication failure for roehl from 193.168.0.128")
            .is_empty());
    }

    #[test]
    fn test_date_text_cannot_be_host() {
        let (f, _) = make_filter(utc(2010, 1, 1, 0, 0, 0));
        f.add_fail_regex(r"^\s*<HOST> failed").unwrap();
        // without cutting the date out, "2009" would be captured as host
        let events = f.process_line("2009-12-31 10:00:00 failed");
        assert!(events.is_empty());
    }

    #[test]
    fn test_ignore_regex_drops_line() {
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 30, 0));
        f.add_fail_regex(SSH_REGEX).unwrap();
        f.add_ignore_regex("for nagios").unwrap();
        assert!(f
            .process_line("Aug 14 11:59:59 h sshd: Authentication failure for nagios from 1.2.3.4")
            .is_empty());
    }

    #[test]
    fn test_hostname_not_resolved_when_dns_off() {
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 30, 0));
        f.set_use_dns(UseDns::No);
        f.add_fail_regex(SSH_REGEX).unwrap();
        assert!(f
            .process_line("Aug 14 11:59:59 h sshd: Authentication failure for x from evil.example")
            .is_empty());
    }

    #[test]
    fn test_address_found_inside_host_token() {
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 30, 0));
        f.set_use_dns(UseDns::No);
        f.add_fail_regex(r"Connection from (?P<host>\S+) refused").unwrap();
        let events = f.process_line("Aug 14 11:59:59 h x: Connection from 1.2.3.4:22 refused");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].addr, Address::parse("1.2.3.4"));
    }

    #[test]
    fn test_ignore_command_exit_status() {
        use crate::cmd_abstraction::{CommandLock, CommandOutput, MockCommandExecutor};

        let mut mock = MockCommandExecutor::new();
        mock.expect_run_shell()
            .withf(|c, _| c == "is-friend 10.1.1.1")
            .returning(|_, _| Ok(CommandOutput::ok()));
        mock.expect_run_shell()
            .withf(|c, _| c == "is-friend 10.2.2.2")
            .returning(|_, _| Ok(CommandOutput::failed(1)));
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 30, 0));
        let f = f.with_command_runner(CommandRunner::new(Arc::new(mock), CommandLock::new(), None));

        assert!(!f.in_ignore_ip_list(&Address::parse("10.1.1.1")));
        f.set_ignore_command("is-friend <ip>");
        assert_eq!(f.ignore_command(), "is-friend <ip>");
        assert!(f.in_ignore_ip_list(&Address::parse("10.1.1.1")));
        assert!(!f.in_ignore_ip_list(&Address::parse("10.2.2.2")));
    }

    #[test]
    fn test_log_encoding_applies_to_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        std::fs::write(&path, b"Aug 14 11:59:59 h sshd: Authentication failure for ren\xe9 from 1.2.3.4\n")
            .unwrap();
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 0, 0));
        f.add_fail_regex(SSH_REGEX).unwrap();
        f.add_log_path(&path, false).unwrap();

        assert_eq!(f.log_encoding(), "UTF-8");
        f.set_log_encoding("latin1").unwrap();
        assert_eq!(f.log_encoding(), "windows-1252");
        assert!(f.set_log_encoding("klingon").is_err());
        assert!(f.set_log_encoding("utf-16le").is_err());
        assert_eq!(f.log_encoding(), "windows-1252");
        f.set_log_encoding("auto").unwrap();
        assert_eq!(f.log_encoding(), "UTF-8");
        f.set_log_encoding("iso-8859-15").unwrap();

        assert_eq!(f.process_files(&[]), 1);
        assert_eq!(f.fail_manager().attempts(&Address::parse("1.2.3.4")), Some(1));
    }

    #[test]
    fn test_date_pattern_round_trip() {
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 30, 0));
        assert!(f.date_pattern().is_none());
        f.add_fail_regex(SSH_REGEX).unwrap();
        f.set_date_pattern("^%Y%m%d-%H%M%S").unwrap();
        assert_eq!(f.date_pattern().unwrap().1, "YearMonthDay-24hourMinuteSecond");
        let events = f.process_line("20050814-115959 sshd: Authentication failure for x from 1.2.3.4");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].time, utc(2005, 8, 14, 11, 59, 59));
        assert!(f.set_date_pattern("%Q").is_err());
    }

    #[test]
    fn test_old_events_discarded() {
        let (f, _) = make_filter(utc(2005, 8, 14, 13, 0, 0));
        f.add_fail_regex(SSH_REGEX).unwrap();
        let added = f.process_line_and_add(
            "Aug 14 11:59:59 h sshd: Authentication failure for x from 1.2.3.4",
        );
        assert_eq!(added, 0);
        assert_eq!(f.fail_manager().size(), 0);
    }

    #[test]
    fn test_ignored_address_discarded() {
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 0, 30));
        f.add_fail_regex(SSH_REGEX).unwrap();
        f.add_ignore_ip("10.0.0.0/8");
        for _ in 0..5 {
            f.process_line_and_add("Aug 14 12:00:00 h sshd: Authentication failure for x from 10.0.0.5");
        }
        assert_eq!(f.fail_manager().size(), 0);
        assert!(f.fail_manager().to_ban().is_none());
    }

    #[test]
    fn test_ignore_ip_management() {
        let (f, _) = make_filter(0);
        f.add_ignore_ip("127.0.0.1");
        f.add_ignore_ip("10.0.0.0/8");
        assert_eq!(f.ignore_ips(), vec!["127.0.0.1", "10.0.0.0/8"]);
        f.del_ignore_ip("127.0.0.1").unwrap();
        assert!(f.del_ignore_ip("127.0.0.1").is_err());
        assert_eq!(f.ignore_ips(), vec!["10.0.0.0/8"]);
    }

    #[test]
    fn test_multiline_buffer() {
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 30, 0));
        f.set_max_lines(2).unwrap();
        f.add_fail_regex(r"session opened from <HOST>\n.* auth failed").unwrap();
        assert!(f
            .process_line("Aug 14 12:00:00 h srv: session opened from 5.6.7.8")
            .is_empty());
        let events = f.process_line("Aug 14 12:00:01 h srv: auth failed");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].addr, Address::parse("5.6.7.8"));
        // both lines were consumed by the match
        assert!(f
            .process_line("Aug 14 12:00:02 h srv: auth failed")
            .is_empty());
    }

    #[test]
    fn test_max_lines_zero_rejected() {
        let (f, _) = make_filter(0);
        assert!(f.set_max_lines(0).is_err());
        assert_eq!(f.max_lines(), 1);
    }

    #[test]
    fn test_add_banned_ip() {
        let (f, _) = make_filter(1000);
        f.set_max_retry(5);
        f.add_banned_ip(&Address::parse("9.9.9.9")).unwrap();
        let t = f.fail_manager().to_ban().unwrap();
        assert_eq!(t.attempts, 5);
        assert!(f.add_banned_ip(&Address::parse("not-an-ip")).is_err());
    }

    #[test]
    fn test_log_paths() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        std::fs::write(&path, "").unwrap();
        let (f, _) = make_filter(0);
        f.add_log_path(&path, false).unwrap();
        assert!(f.add_log_path(&path, false).is_err());
        assert_eq!(f.log_paths(), vec![path.clone()]);
        f.del_log_path(&path).unwrap();
        assert!(f.del_log_path(&path).is_err());
        assert!(f.add_log_path(&dir.path().join("missing.log"), false).is_err());
    }

    #[test]
    fn test_process_files_and_status() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let (f, _) = make_filter(utc(2005, 8, 14, 12, 0, 30));
        std::fs::write(&path, "").unwrap();
        f.add_fail_regex(SSH_REGEX).unwrap();
        f.add_log_path(&path, false).unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        for s in [0, 10, 20] {
            writeln!(
                file,
                "Aug 14 12:00:{:02} h sshd: Authentication failure for x from 1.2.3.4",
                s
            )
            .unwrap();
        }
        assert_eq!(f.process_files(&[]), 3);
        let status = f.status();
        assert_eq!(status[0], json!(["Currently failed", 1]));
        assert_eq!(status[1], json!(["Total failed", 3]));
        assert_eq!(status[2][1][0], json!(path.display().to_string()));
    }

    #[test]
    fn test_note_missing_trips_after_three() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        std::fs::write(&path, "").unwrap();
        let (f, _) = make_filter(0);
        f.add_log_path(&path, false).unwrap();
        let ev = WatchEvent {
            modified: vec![],
            missing: vec![path.clone()],
        };
        assert!(!f.note_missing(&ev));
        assert!(!f.note_missing(&ev));
        assert!(f.note_missing(&ev));
        // counter was reset
        assert!(!f.note_missing(&ev));
        // a good stat clears it
        assert!(!f.note_missing(&WatchEvent::default()));
        assert!(!f.note_missing(&ev));
        assert!(!f.note_missing(&ev));
    }

    #[test]
    fn test_remove_matched_lines() {
        let mut buf: VecDeque<String> = ["aaa", "bbb", "ccc"].iter().map(|s| s.to_string()).collect();
        // "bbb" spans bytes 4..7 of "aaa\nbbb\nccc"
        remove_matched_lines(&mut buf, 4, 7);
        assert_eq!(buf, vec!["aaa".to_string(), "ccc".to_string()]);
    }

    #[tokio::test]
    async fn test_drain_to_queue_in_order() {
        let (f, _) = make_filter(0);
        f.set_max_retry(1);
        for ip in ["1.1.1.1", "2.2.2.2"] {
            f.fail_manager().add(FailTicket::new(Address::parse(ip), 0));
        }
        let (tx, mut rx) = mpsc::channel(4);
        assert_eq!(f.drain_to(&tx).await, 2);
        assert_eq!(rx.recv().await.unwrap().addr, Address::parse("1.1.1.1"));
        assert_eq!(rx.recv().await.unwrap().addr, Address::parse("2.2.2.2"));
    }

    #[tokio::test]
    async fn test_worker_feeds_queue_and_stops() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let now = utc(2005, 8, 14, 12, 0, 30);
        let mut lines = String::new();
        for s in [0, 10, 20] {
            lines.push_str(&format!(
                "Aug 14 12:00:{:02} h sshd: Authentication failure for x from 1.2.3.4\n",
                s
            ));
        }
        std::fs::write(&path, lines).unwrap();

        let (f, _) = make_filter(now);
        f.add_fail_regex(SSH_REGEX).unwrap();
        f.add_log_path(&path, false).unwrap();
        let filter = Arc::new(f);

        let (tx, mut rx) = mpsc::channel(4);
        let token = ShutdownToken::new();
        let ctx = WorkerContext {
            queue: tx,
            idle: Arc::new(AtomicBool::new(false)),
            token: token.clone(),
            poll_interval: Duration::from_millis(10),
        };
        let handle = tokio::spawn(run(filter.clone(), ctx));

        let ticket = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ticket.addr, Address::parse("1.2.3.4"));
        assert_eq!(ticket.attempts, 3);

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
