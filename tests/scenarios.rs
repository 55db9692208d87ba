//! End-to-end jail scenarios driven through the public library API with a
//! manual clock. No external commands are spawned: actions go through a
//! recording executor.

use chrono::{FixedOffset, TimeZone, Utc};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use failwarden::action::{Actions, CommandKind, CommandRunner};
use failwarden::banmanager::{BanManager, BanOutcome};
use failwarden::clock::ManualClock;
use failwarden::cmd_abstraction::{CommandExecutor, CommandLock, CommandOutput};
use failwarden::datedetector::DateDetector;
use failwarden::failmanager::FailManager;
use failwarden::filter::{create_watcher, Backend, Filter};
use failwarden::net::Address;
use failwarden::ticket::{BanTicket, FailTicket};

const SSH_REGEX: &str = "Authentication failure for .* from <HOST>$";

#[derive(Default)]
struct Recorder {
    commands: Mutex<Vec<String>>,
}

impl Recorder {
    fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

impl CommandExecutor for Recorder {
    fn run_shell(&self, cmd: &str, _timeout: Option<Duration>) -> anyhow::Result<CommandOutput> {
        self.commands.lock().push(cmd.to_string());
        Ok(CommandOutput::ok())
    }
}

fn utc(h: u32, mi: u32, s: u32) -> i64 {
    Utc.with_ymd_and_hms(2005, 8, 14, h, mi, s).unwrap().timestamp()
}

fn ssh_filter(clock: &Arc<ManualClock>) -> Filter {
    let detector = DateDetector::with_defaults(clock.clone())
        .unwrap()
        .with_offset(FixedOffset::east_opt(0).unwrap());
    let filter = Filter::new("ssh", clock.clone(), create_watcher(Backend::Polling).unwrap())
        .unwrap()
        .with_date_detector(detector);
    filter.add_fail_regex(SSH_REGEX).unwrap();
    filter.set_find_time(600);
    filter.set_max_retry(3);
    filter
}

fn ssh_actions(clock: &Arc<ManualClock>, recorder: &Arc<Recorder>) -> Actions {
    let runner = CommandRunner::new(recorder.clone(), CommandLock::new(), None);
    let actions = Actions::new("ssh", clock.clone(), runner);
    actions.set_ban_time(600);
    actions.add_action("record").unwrap();
    actions
        .with_action("record", |a| {
            a.set_command(CommandKind::Ban, "ban <ip>");
            a.set_command(CommandKind::Unban, "unban <ip>");
        })
        .unwrap();
    actions
}

fn auth_failure(time: &str, host: &str) -> String {
    format!(
        "Aug 14 {} i60p295 sshd[12365]: Authentication failure for roehl from {}",
        time, host
    )
}

#[test]
fn test_syslog_failures_produce_one_ban() {
    let clock = Arc::new(ManualClock::new(utc(12, 0, 30)));
    let recorder = Arc::new(Recorder::default());
    let filter = ssh_filter(&clock);
    let actions = ssh_actions(&clock, &recorder);

    for time in ["11:59:59", "12:00:10", "12:00:20"] {
        assert_eq!(filter.process_line_and_add(&auth_failure(time, "193.168.0.128")), 1);
    }

    let fail = filter.fail_manager().to_ban().expect("threshold reached");
    assert!(filter.fail_manager().to_ban().is_none());
    assert_eq!(fail.time, utc(12, 0, 20));
    assert_eq!(actions.check_ban(fail), BanOutcome::Banned);

    let addr = Address::parse("193.168.0.128");
    let ban = actions.ban_manager().get(&addr).unwrap();
    assert_eq!(ban.start, utc(12, 0, 20));
    assert_eq!(ban.end(), Some(utc(12, 10, 20)));
    assert_eq!(recorder.commands(), vec!["ban 193.168.0.128"]);

    // the unban runs exactly once, at the first poll at or after the end
    assert_eq!(actions.check_unban(utc(12, 10, 19)), 0);
    assert_eq!(actions.check_unban(utc(12, 10, 20)), 1);
    assert_eq!(actions.check_unban(utc(12, 10, 21)), 0);
    assert_eq!(
        recorder.commands(),
        vec!["ban 193.168.0.128", "unban 193.168.0.128"]
    );
}

#[test]
fn test_window_boundary_resets_attempts() {
    let manager = FailManager::new();
    manager.set_find_time(600);
    manager.set_max_retry(3);
    let addr = Address::parse("193.168.0.128");

    manager.add(FailTicket::new(addr.clone(), 0));
    manager.add(FailTicket::new(addr.clone(), 599));
    assert_eq!(manager.attempts(&addr), Some(2));

    manager.add(FailTicket::new(addr.clone(), 1199));
    assert_eq!(manager.attempts(&addr), Some(1));
    assert!(manager.to_ban().is_none());
}

#[test]
fn test_ignored_cidr_never_counts() {
    let clock = Arc::new(ManualClock::new(utc(12, 5, 0)));
    let filter = ssh_filter(&clock);
    filter.add_ignore_ip("10.0.0.0/8");

    for s in 0..5 {
        let time = format!("12:00:0{}", s);
        assert_eq!(filter.process_line_and_add(&auth_failure(&time, "10.0.0.5")), 0);
    }
    assert_eq!(filter.fail_manager().size(), 0);
    assert!(filter.fail_manager().to_ban().is_none());
}

#[test]
fn test_rotation_mid_ban_does_not_duplicate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("auth.log");
    let mut file = std::fs::File::create(&path).unwrap();
    for s in 1..=4 {
        writeln!(file, "{}", auth_failure(&format!("12:00:0{}", s), "192.0.2.7")).unwrap();
    }
    drop(file);

    let clock = Arc::new(ManualClock::new(utc(12, 1, 0)));
    let recorder = Arc::new(Recorder::default());
    let filter = ssh_filter(&clock);
    filter.set_max_retry(4);
    filter.add_log_path(&path, false).unwrap();
    let actions = ssh_actions(&clock, &recorder);

    assert_eq!(filter.process_files(&[]), 4);
    let fail = filter.fail_manager().to_ban().unwrap();
    assert_eq!(actions.check_ban(fail), BanOutcome::Banned);

    // truncate and start over with a different first line
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "Aug 14 12:00:30 i60p295 sshd[1]: Server listening").unwrap();
    writeln!(file, "{}", auth_failure("12:00:31", "192.0.2.7")).unwrap();
    drop(file);

    assert_eq!(filter.process_files(&[]), 1);
    assert!(filter.fail_manager().to_ban().is_none());

    let addr = Address::parse("192.0.2.7");
    assert!(actions.ban_manager().contains(&addr));
    assert_eq!(actions.ban_manager().size(), 1);
    assert_eq!(actions.ban_manager().total(), 1);
    assert_eq!(recorder.commands(), vec!["ban 192.0.2.7"]);
}

#[test]
fn test_ban_extension_keeps_start() {
    let manager = BanManager::new();
    let addr = Address::parse("1.2.3.4");

    assert_eq!(manager.add(BanTicket::new(addr.clone(), 1000, 600)), BanOutcome::Banned);
    // a longer ban requested 100 s later
    assert_eq!(
        manager.add(BanTicket::new(addr.clone(), 1000, 3600)),
        BanOutcome::Prolonged
    );
    let ban = manager.get(&addr).unwrap();
    assert_eq!(ban.start, 1000);
    assert_eq!(ban.end(), Some(4600));
    assert_eq!(manager.size(), 1);
}

#[test]
fn test_ban_extension_does_not_rerun_ban() {
    let clock = Arc::new(ManualClock::new(1000));
    let recorder = Arc::new(Recorder::default());
    let actions = ssh_actions(&clock, &recorder);
    let addr = Address::parse("1.2.3.4");

    assert_eq!(
        actions.check_ban(FailTicket::new(addr.clone(), 1000)),
        BanOutcome::Banned
    );
    clock.advance(100);
    actions.set_ban_time(3600);
    assert_eq!(
        actions.check_ban(FailTicket::new(addr.clone(), 1100)),
        BanOutcome::Prolonged
    );

    let ban = actions.ban_manager().get(&addr).unwrap();
    assert_eq!(ban.start, 1000);
    assert_eq!(ban.end(), Some(4700));
    assert_eq!(recorder.commands(), vec!["ban 1.2.3.4"]);
}
