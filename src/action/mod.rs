//! Actions: shell command templates run when a jail starts, stops, bans or
//! unbans.
//!
//! An [`Action`] is plain data (its static tag map and five templates).
//! Execution goes through a [`CommandRunner`], which owns the executor, the
//! process-wide command lock and the timeout. The per-jail list of actions
//! together with the ban manager lives in [`runner::Actions`].

pub mod runner;
pub mod tags;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::cmd_abstraction::{hint_for, CommandExecutor, CommandLock};
use crate::error::WardenError;
use crate::ticket::EventInfo;

pub use runner::Actions;
pub use tags::{escape_tag, resolve_tags, substitute};

/// The five command templates of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Start,
    Stop,
    Check,
    Ban,
    Unban,
}

impl FromStr for CommandKind {
    type Err = WardenError;

    /// Accepts both the bare name and the control-plane verb
    /// (`ban` or `actionban`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("action").unwrap_or(s) {
            "start" => Ok(CommandKind::Start),
            "stop" => Ok(CommandKind::Stop),
            "check" => Ok(CommandKind::Check),
            "ban" => Ok(CommandKind::Ban),
            "unban" => Ok(CommandKind::Unban),
            other => Err(WardenError::Config(format!(
                "unknown action command: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommandKind::Start => "start",
            CommandKind::Stop => "stop",
            CommandKind::Check => "check",
            CommandKind::Ban => "ban",
            CommandKind::Unban => "unban",
        };
        write!(f, "{}", s)
    }
}

/// Runs substituted commands through the executor, one at a time
/// process-wide.
#[derive(Clone)]
pub struct CommandRunner {
    executor: Arc<dyn CommandExecutor>,
    lock: CommandLock,
    timeout: Option<Duration>,
}

impl CommandRunner {
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        lock: CommandLock,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            executor,
            lock,
            timeout,
        }
    }

    /// Execute `cmd`; returns true on exit status 0. An empty command is a
    /// success.
    pub fn execute(&self, cmd: &str) -> bool {
        debug!("{}", cmd);
        if cmd.trim().is_empty() {
            debug!("Nothing to do");
            return true;
        }
        let unresolved = tags::tags_in(cmd);
        if !unresolved.is_empty() {
            debug!("Unresolved tags in command: {}", unresolved.join(", "));
        }

        match self.lock.run(|| self.executor.run_shell(cmd, self.timeout)) {
            Ok(output) if output.success => {
                debug!("{} returned successfully", cmd);
                true
            }
            Ok(output) => {
                match output.code {
                    Some(code) => error!("{} returned {}", cmd, code),
                    None => error!("{} was killed", cmd),
                }
                if !output.stderr.trim().is_empty() {
                    debug!("stderr: {}", output.stderr.trim_end());
                }
                if let Some(hint) = hint_for(output.code, cmd) {
                    info!("HINT: {}", hint);
                }
                false
            }
            Err(e) => {
                error!("{} failed with {:#}", cmd, e);
                false
            }
        }
    }

    /// Run `cmd` for its exit status alone. A non-zero exit is an answer
    /// here, not a failure, so it is only logged at debug level.
    pub fn check_status(&self, cmd: &str) -> bool {
        match self.lock.run(|| self.executor.run_shell(cmd, self.timeout)) {
            Ok(output) => {
                debug!("{} returned {:?}", cmd, output.code);
                output.success
            }
            Err(e) => {
                error!("{} failed with {:#}", cmd, e);
                false
            }
        }
    }
}

impl fmt::Debug for CommandRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRunner")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// One named action with its static tags and command templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Action {
    name: String,
    cinfo: BTreeMap<String, String>,
    start: String,
    stop: String,
    check: String,
    ban: String,
    unban: String,
}

impl Action {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_cinfo(&mut self, key: &str, value: &str) {
        self.cinfo.insert(key.to_string(), value.to_string());
    }

    pub fn cinfo(&self, key: &str) -> Option<&str> {
        self.cinfo.get(key).map(String::as_str)
    }

    pub fn del_cinfo(&mut self, key: &str) -> bool {
        self.cinfo.remove(key).is_some()
    }

    pub fn cinfo_map(&self) -> &BTreeMap<String, String> {
        &self.cinfo
    }

    pub fn command(&self, kind: CommandKind) -> &str {
        match kind {
            CommandKind::Start => &self.start,
            CommandKind::Stop => &self.stop,
            CommandKind::Check => &self.check,
            CommandKind::Ban => &self.ban,
            CommandKind::Unban => &self.unban,
        }
    }

    pub fn set_command(&mut self, kind: CommandKind, value: &str) {
        let slot = match kind {
            CommandKind::Start => &mut self.start,
            CommandKind::Stop => &mut self.stop,
            CommandKind::Check => &mut self.check,
            CommandKind::Ban => &mut self.ban,
            CommandKind::Unban => &mut self.unban,
        };
        *slot = value.to_string();
        debug!("Set action{} for {} = {}", kind, self.name, value);
    }

    fn render(&self, template: &str, event: Option<&EventInfo>) -> Option<String> {
        match substitute(template, &self.cinfo, event) {
            Ok(cmd) => Some(cmd),
            Err(e) => {
                error!("{}: unable to substitute tags: {}", self.name, e);
                None
            }
        }
    }

    fn run_plain(&self, template: &str, runner: &CommandRunner) -> bool {
        match self.render(template, None) {
            Some(cmd) => runner.execute(&cmd),
            None => false,
        }
    }

    pub fn exec_start(&self, runner: &CommandRunner) -> bool {
        self.run_plain(&self.start, runner)
    }

    pub fn exec_stop(&self, runner: &CommandRunner) -> bool {
        self.run_plain(&self.stop, runner)
    }

    pub fn exec_ban(&self, event: &EventInfo, runner: &CommandRunner) -> bool {
        self.process(&self.ban, event, runner)
    }

    pub fn exec_unban(&self, event: &EventInfo, runner: &CommandRunner) -> bool {
        self.process(&self.unban, event, runner)
    }

    /// Check the environment, rebuild it once if the check fails, then run
    /// the substituted template.
    fn process(&self, template: &str, event: &EventInfo, runner: &CommandRunner) -> bool {
        if template.is_empty() {
            debug!("Nothing to do");
            return true;
        }
        if !self.run_plain(&self.check, runner) {
            error!(
                "{}: invariant check failed. Trying to restore a sane environment",
                self.name
            );
            self.exec_stop(runner);
            self.exec_start(runner);
            if !self.run_plain(&self.check, runner) {
                error!("{}: unable to restore environment", self.name);
                return false;
            }
        }
        match self.render(template, Some(event)) {
            Some(cmd) => runner.execute(&cmd),
            None => false,
        }
    }
}
