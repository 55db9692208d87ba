//! A jail: one filter and one action runner joined by a bounded queue.
//!
//! ```text
//!   log files ──▶ Filter worker ──▶ [bounded queue] ──▶ Action worker ──▶ shell
//!                  (FailManager)                         (BanManager)
//! ```
//!
//! Both workers share the jail's idle flag and a per-jail shutdown token, so
//! one jail can be suspended or stopped without touching the others.

use chrono::FixedOffset;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::action::runner::{self, RunnerContext};
use crate::action::{Actions, CommandRunner};
use crate::clock::SharedClock;
use crate::cmd_abstraction::{CommandExecutor, CommandLock};
use crate::datedetector::DateDetector;
use crate::error::{WardenError, WardenResult};
use crate::filter::{self, create_watcher, Backend, Filter, WorkerContext};
use crate::signal::ShutdownToken;
use crate::ticket::FailTicket;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Longer names make firewall chain names exceed their limit.
const NAME_WARN_LEN: usize = 20;

/// Shared resources handed to every jail by the server.
#[derive(Clone)]
pub struct JailContext {
    pub clock: SharedClock,
    pub executor: Arc<dyn CommandExecutor>,
    pub command_lock: CommandLock,
    pub command_timeout: Option<Duration>,
    pub poll_interval: Duration,
    pub queue_capacity: usize,
    /// Fixed zone for log timestamps; local time when `None`.
    pub date_offset: Option<FixedOffset>,
}

impl JailContext {
    pub fn new(clock: SharedClock, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            clock,
            executor,
            command_lock: CommandLock::new(),
            command_timeout: Some(DEFAULT_COMMAND_TIMEOUT),
            poll_interval: DEFAULT_POLL_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            date_offset: None,
        }
    }
}

struct Running {
    token: ShutdownToken,
    filter_task: JoinHandle<()>,
    action_task: JoinHandle<()>,
}

pub struct Jail {
    name: String,
    backend: Backend,
    filter: Arc<Filter>,
    actions: Arc<Actions>,
    tx: mpsc::Sender<FailTicket>,
    rx: Arc<Mutex<mpsc::Receiver<FailTicket>>>,
    idle: Arc<AtomicBool>,
    poll_interval: Duration,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for Jail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Jail")
            .field("name", &self.name)
            .field("backend", &self.backend)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl Jail {
    pub fn new(name: &str, backend: Backend, ctx: &JailContext) -> WardenResult<Self> {
        if name.is_empty() {
            return Err(WardenError::Config("jail name must not be empty".to_string()));
        }
        if name.len() >= NAME_WARN_LEN {
            warn!(
                "Jail name {:?} is {} characters long; firewall chain names built from it may be truncated",
                name,
                name.len()
            );
        }
        if ctx.queue_capacity == 0 {
            return Err(WardenError::Config("queue capacity must be positive".to_string()));
        }

        let runner = CommandRunner::new(
            ctx.executor.clone(),
            ctx.command_lock.clone(),
            ctx.command_timeout,
        );
        let watcher = create_watcher(backend)?;
        let mut filter =
            Filter::new(name, ctx.clock.clone(), watcher)?.with_command_runner(runner.clone());
        if let Some(offset) = ctx.date_offset {
            filter = filter
                .with_date_detector(DateDetector::with_defaults(ctx.clock.clone())?.with_offset(offset));
        }
        let actions = Actions::new(name, ctx.clock.clone(), runner)
            .with_fail_manager(filter.shared_fail_manager());
        let (tx, rx) = mpsc::channel(ctx.queue_capacity);

        info!("Creating new jail '{}'", name);
        Ok(Self {
            name: name.to_string(),
            backend,
            filter: Arc::new(filter),
            actions: Arc::new(actions),
            tx,
            rx: Arc::new(Mutex::new(rx)),
            idle: Arc::new(AtomicBool::new(false)),
            poll_interval: ctx.poll_interval,
            running: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    pub fn filter(&self) -> &Arc<Filter> {
        &self.filter
    }

    pub fn actions(&self) -> &Arc<Actions> {
        &self.actions
    }

    /// Spawn the filter and action workers. Must be called inside a Tokio
    /// runtime.
    pub fn start(&self) -> WardenResult<()> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Err(WardenError::Config(format!(
                "jail {} is already running",
                self.name
            )));
        }
        let token = ShutdownToken::new();
        let filter_task = tokio::spawn(filter::run(
            self.filter.clone(),
            WorkerContext {
                queue: self.tx.clone(),
                idle: self.idle.clone(),
                token: token.clone(),
                poll_interval: self.poll_interval,
            },
        ));
        let action_task = tokio::spawn(runner::run(
            self.actions.clone(),
            RunnerContext {
                queue: self.rx.clone(),
                idle: self.idle.clone(),
                token: token.clone(),
                poll_interval: self.poll_interval,
            },
        ));
        *running = Some(Running {
            token,
            filter_task,
            action_task,
        });
        info!("Jail '{}' started", self.name);
        Ok(())
    }

    /// Cancel both workers and wait for them. The action worker unbans
    /// everything before it exits.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            debug!("Jail '{}' is not running", self.name);
            return;
        };
        running.token.cancel();
        if let Err(e) = running.filter_task.await {
            error!("[{}] Filter worker ended abnormally: {}", self.name, e);
        }
        if let Err(e) = running.action_task.await {
            error!("[{}] Action worker ended abnormally: {}", self.name, e);
        }
        info!("Jail '{}' stopped", self.name);
    }

    pub fn is_alive(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .map(|r| !r.filter_task.is_finished() && !r.action_task.is_finished())
            .unwrap_or(false)
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Relaxed);
        info!("[{}] Idle {}", self.name, if idle { "on" } else { "off" });
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }

    /// Queue a ticket for the action worker, waiting while the queue is full.
    pub async fn put_fail_ticket(&self, ticket: FailTicket) -> WardenResult<()> {
        self.tx
            .send(ticket)
            .await
            .map_err(|_| WardenError::Config(format!("jail {} queue is closed", self.name)))
    }

    pub fn get_fail_ticket(&self) -> Option<FailTicket> {
        self.rx.lock().try_recv().ok()
    }

    pub fn status(&self) -> Value {
        json!([
            ["filter", self.filter.status()],
            ["action", self.actions.status()],
        ])
    }
}
