//! Shell command execution abstraction for testability.
//!
//! Actions run their templates through a [`CommandExecutor`]; unit tests use
//! the generated mock to assert which commands run and in what order without
//! spawning processes. Every execution happens under the server's
//! [`CommandLock`], so at most one external command runs at any time.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::io::Read;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Time a command gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(1);
const WAIT_STEP: Duration = Duration::from_millis(10);

/// Output from command execution
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Standard output from the command
    pub stdout: String,
    /// Standard error from the command
    pub stderr: String,
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// The exit code, if available (None when killed by a signal)
    pub code: Option<i32>,
    /// Whether the command was killed for exceeding its timeout
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            code: Some(0),
            ..Self::default()
        }
    }

    pub fn failed(code: i32) -> Self {
        Self {
            success: false,
            code: Some(code),
            ..Self::default()
        }
    }
}

/// Trait for command execution, allowing dependency injection for testing.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Run `cmd` through `/bin/sh -c`.
    ///
    /// # Arguments
    /// * `cmd` - The fully substituted command text
    /// * `timeout` - Hard limit after which the command is terminated
    ///
    /// # Returns
    /// A `CommandOutput` with stdout, stderr and exit status; `Err` only
    /// when the shell could not be spawned at all
    fn run_shell(&self, cmd: &str, timeout: Option<Duration>) -> Result<CommandOutput>;
}

/// Process-wide lock serializing external commands.
#[derive(Debug, Clone, Default)]
pub struct CommandLock(Arc<Mutex<()>>);

impl CommandLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _guard = self.0.lock();
        f()
    }
}

/// Real implementation of CommandExecutor that runs actual system commands.
#[derive(Debug, Clone, Default)]
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    /// Create a new RealCommandExecutor
    pub fn new() -> Self {
        Self
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<Receiver<String>> {
    pipe.map(|mut p| {
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = p.read_to_end(&mut buf);
            let _ = tx.send(String::from_utf8_lossy(&buf).into_owned());
        });
        rx
    })
}

/// Collect what a drain thread read. With a deadline, give up on pipes
/// still held open by stray descendants once it passes.
fn collect(rx: Option<Receiver<String>>, deadline: Option<Instant>) -> String {
    let Some(rx) = rx else {
        return String::new();
    };
    match deadline {
        None => rx.recv().unwrap_or_default(),
        Some(d) => rx
            .recv_timeout(d.saturating_duration_since(Instant::now()))
            .unwrap_or_default(),
    }
}

/// Poll `child` until it exits or `deadline` passes.
fn wait_until(child: &mut Child, deadline: Instant) -> Result<Option<std::process::ExitStatus>> {
    loop {
        if let Some(status) = child.try_wait().context("Failed to wait for command")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(WAIT_STEP);
    }
}

/// Send `signal` to every process in the command's process group.
fn signal_group(child: &Child, signal: libc::c_int) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: kill() only sends a signal. The group id is the shell's
        // pid, which is not reused while any member of the group lives.
        unsafe {
            libc::kill(-pgid, signal);
        }
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn run_shell(&self, cmd: &str, timeout: Option<Duration>) -> Result<CommandOutput> {
        // own process group, so a timeout reaches everything the shell started
        let mut child = Command::new("/bin/sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .context("Failed to spawn /bin/sh")?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let mut timed_out = false;
        let (status, pipes_deadline) = match timeout {
            None => (child.wait().context("Failed to wait for command")?, None),
            Some(limit) => {
                let deadline = Instant::now() + limit;
                let status = match wait_until(&mut child, deadline)? {
                    Some(status) => status,
                    None => {
                        timed_out = true;
                        warn!("Command timed out after {:?}, sending SIGTERM: {}", limit, cmd);
                        signal_group(&child, libc::SIGTERM);
                        match wait_until(&mut child, Instant::now() + KILL_GRACE)? {
                            Some(status) => status,
                            None => {
                                warn!("Command ignored SIGTERM, sending SIGKILL: {}", cmd);
                                signal_group(&child, libc::SIGKILL);
                                child.wait().context("Failed to wait for command")?
                            }
                        }
                    }
                };
                if timed_out {
                    // the shell may be gone while its children linger
                    signal_group(&child, libc::SIGKILL);
                }
                (status, Some(deadline.max(Instant::now()) + KILL_GRACE))
            }
        };

        Ok(CommandOutput {
            stdout: collect(stdout, pipes_deadline),
            stderr: collect(stderr, pipes_deadline),
            success: status.success() && !timed_out,
            code: status.code(),
            timed_out,
        })
    }
}

/// Explanation for well-known shell exit codes.
pub fn hint_for(code: Option<i32>, cmd: &str) -> Option<String> {
    match code {
        Some(127) => Some(format!(
            "\"Command not found\". Make sure that every command in {:?} is in the PATH \
             of the server process (PATH={})",
            cmd,
            std::env::var("PATH").unwrap_or_default()
        )),
        Some(126) => Some(format!(
            "\"Permission denied\". A command in {:?} exists but is not executable",
            cmd
        )),
        None => Some("the command was terminated by a signal".to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_default() {
        let output = CommandOutput::default();
        assert!(output.stdout.is_empty());
        assert!(output.stderr.is_empty());
        assert!(!output.success);
        assert!(output.code.is_none());
        assert!(!output.timed_out);
    }

    #[test]
    fn test_command_output_helpers() {
        assert!(CommandOutput::ok().success);
        let failed = CommandOutput::failed(3);
        assert!(!failed.success);
        assert_eq!(failed.code, Some(3));
    }

    #[test]
    fn test_run_shell_echo() {
        let executor = RealCommandExecutor::new();
        let output = executor.run_shell("echo -n hello", None).unwrap();
        assert!(output.success);
        assert_eq!(output.stdout, "hello");
    }

    #[test]
    fn test_run_shell_exit_code() {
        let executor = RealCommandExecutor::new();
        let output = executor.run_shell("exit 3", None).unwrap();
        assert!(!output.success);
        assert_eq!(output.code, Some(3));
    }

    #[test]
    fn test_run_shell_not_found() {
        let executor = RealCommandExecutor::new();
        let output = executor
            .run_shell("definitely-not-a-command-xyz", None)
            .unwrap();
        assert_eq!(output.code, Some(127));
        assert!(hint_for(output.code, "definitely-not-a-command-xyz")
            .unwrap()
            .contains("PATH"));
    }

    #[test]
    fn test_run_shell_stderr() {
        let executor = RealCommandExecutor::new();
        let output = executor.run_shell("echo oops >&2", None).unwrap();
        assert!(output.success);
        assert_eq!(output.stderr.trim(), "oops");
    }

    #[test]
    fn test_run_shell_timeout_terminates() {
        let executor = RealCommandExecutor::new();
        let start = Instant::now();
        let output = executor
            .run_shell("sleep 10", Some(Duration::from_millis(100)))
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_run_shell_timeout_reaches_compound_commands() {
        let executor = RealCommandExecutor::new();
        let start = Instant::now();
        let output = executor
            .run_shell("sleep 6; true", Some(Duration::from_millis(200)))
            .unwrap();
        assert!(output.timed_out);
        assert!(!output.success);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_run_shell_timeout_does_not_wait_for_background_children() {
        let executor = RealCommandExecutor::new();
        let start = Instant::now();
        let output = executor
            .run_shell("sleep 6 & sleep 6", Some(Duration::from_millis(200)))
            .unwrap();
        assert!(output.timed_out);
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_run_shell_within_timeout() {
        let executor = RealCommandExecutor::new();
        let output = executor
            .run_shell("true", Some(Duration::from_secs(5)))
            .unwrap();
        assert!(output.success);
        assert!(!output.timed_out);
    }

    #[test]
    fn test_hint_for() {
        assert!(hint_for(Some(0), "x").is_none());
        assert!(hint_for(Some(1), "x").is_none());
        assert!(hint_for(Some(126), "x").is_some());
        assert!(hint_for(None, "x").is_some());
    }

    #[test]
    fn test_command_lock_serializes() {
        let lock = CommandLock::new();
        let counter = Arc::new(Mutex::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let lock = lock.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    lock.run(|| {
                        let mut c = counter.lock();
                        *c += 1;
                    })
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*counter.lock(), 4);
    }

    #[test]
    fn test_mock_command_executor() {
        let mut mock = MockCommandExecutor::new();

        mock.expect_run_shell()
            .withf(|cmd, _| cmd == "iptables -N f2b-ssh")
            .times(1)
            .returning(|_, _| Ok(CommandOutput::ok()));

        let output = mock.run_shell("iptables -N f2b-ssh", None).unwrap();
        assert!(output.success);
    }
}
