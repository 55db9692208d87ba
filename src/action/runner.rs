//! Per-jail action list, ban bookkeeping and the action worker.

use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{Action, CommandRunner};
use crate::banmanager::{BanManager, BanOutcome};
use crate::clock::SharedClock;
use crate::error::{WardenError, WardenResult};
use crate::failmanager::FailManager;
use crate::net::Address;
use crate::signal::ShutdownToken;
use crate::ticket::{BanTicket, FailTicket};

pub struct Actions {
    jail: String,
    clock: SharedClock,
    runner: CommandRunner,
    actions: RwLock<Vec<Action>>,
    ban_manager: BanManager,
    fail_manager: Option<Arc<FailManager>>,
}

impl std::fmt::Debug for Actions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actions")
            .field("jail", &self.jail)
            .field("actions", &self.names())
            .finish()
    }
}

impl Actions {
    pub fn new(jail: &str, clock: SharedClock, runner: CommandRunner) -> Self {
        Self {
            jail: jail.to_string(),
            clock,
            runner,
            actions: RwLock::new(Vec::new()),
            ban_manager: BanManager::new(),
            fail_manager: None,
        }
    }

    /// Failures whose ban could not be applied go back to `manager`.
    pub fn with_fail_manager(mut self, manager: Arc<FailManager>) -> Self {
        self.fail_manager = Some(manager);
        self
    }

    pub fn ban_manager(&self) -> &BanManager {
        &self.ban_manager
    }

    pub fn add_action(&self, name: &str) -> WardenResult<()> {
        let mut actions = self.actions.write();
        if actions.iter().any(|a| a.name() == name) {
            return Err(WardenError::Config(format!(
                "action {} already exists in jail {}",
                name, self.jail
            )));
        }
        actions.push(Action::new(name));
        debug!("[{}] Added action {}", self.jail, name);
        Ok(())
    }

    pub fn del_action(&self, name: &str) -> WardenResult<()> {
        let mut actions = self.actions.write();
        let pos = actions
            .iter()
            .position(|a| a.name() == name)
            .ok_or_else(|| WardenError::UnknownAction(name.to_string()))?;
        actions.remove(pos);
        Ok(())
    }

    /// Run `f` against the named action.
    pub fn with_action<T>(&self, name: &str, f: impl FnOnce(&mut Action) -> T) -> WardenResult<T> {
        let mut actions = self.actions.write();
        let action = actions
            .iter_mut()
            .find(|a| a.name() == name)
            .ok_or_else(|| WardenError::UnknownAction(name.to_string()))?;
        Ok(f(action))
    }

    pub fn last_action(&self) -> Option<String> {
        self.actions.read().last().map(|a| a.name().to_string())
    }

    pub fn names(&self) -> Vec<String> {
        self.actions
            .read()
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    pub fn ban_time(&self) -> i64 {
        self.ban_manager.ban_time()
    }

    pub fn set_ban_time(&self, secs: i64) {
        self.ban_manager.set_ban_time(secs);
        info!("[{}] Set banTime = {}", self.jail, secs);
    }

    // Commands run on a snapshot so that control-plane edits never wait on
    // a slow shell command.
    fn snapshot(&self) -> Vec<Action> {
        self.actions.read().clone()
    }

    fn ban_all(&self, ticket: &BanTicket) -> bool {
        let actions = self.snapshot();
        if actions.is_empty() {
            return true;
        }
        let event = ticket.event_info();
        let mut any = false;
        for action in &actions {
            if action.exec_ban(&event, &self.runner) {
                any = true;
            } else {
                warn!(
                    "[{}] Action {} failed to ban {}",
                    self.jail,
                    action.name(),
                    ticket.addr
                );
            }
        }
        any
    }

    fn unban_all(&self, ticket: &BanTicket) {
        let event = ticket.event_info();
        for action in &self.snapshot() {
            if !action.exec_unban(&event, &self.runner) {
                error!(
                    "[{}] Action {} failed to unban {}",
                    self.jail,
                    action.name(),
                    ticket.addr
                );
            }
        }
    }

    /// Turn a fail-to-ban transition into a ban. Returns the outcome of the
    /// ban manager insert; ban commands only run for a new ban.
    pub fn check_ban(&self, fail: FailTicket) -> BanOutcome {
        let ticket = self.ban_manager.create_ban_ticket(&fail, fail.time);
        let addr = ticket.addr.clone();
        let outcome = self.ban_manager.add(ticket.clone());
        match outcome {
            BanOutcome::Banned => {
                info!("[{}] Ban {}", self.jail, addr);
                if !self.ban_all(&ticket) {
                    warn!(
                        "[{}] Every ban command failed for {}; it will be retried",
                        self.jail, addr
                    );
                    self.ban_manager.remove(&addr);
                    if let Some(manager) = &self.fail_manager {
                        restore_attempts(manager, fail);
                    }
                }
            }
            BanOutcome::Prolonged => {
                info!("[{}] {} already banned, ban prolonged", self.jail, addr)
            }
            BanOutcome::AlreadyBanned => warn!("[{}] {} already banned", self.jail, addr),
        }
        outcome
    }

    /// Unban every ticket whose end is at or before `now`.
    pub fn check_unban(&self, now: i64) -> usize {
        let expired = self.ban_manager.expired(now);
        for ticket in &expired {
            info!("[{}] Unban {}", self.jail, ticket.addr);
            self.unban_all(ticket);
        }
        expired.len()
    }

    /// Unban everything currently banned.
    pub fn flush_bans(&self) -> usize {
        debug!("[{}] Flush ban list", self.jail);
        let all = self.ban_manager.flush_all();
        for ticket in &all {
            info!("[{}] Unban {}", self.jail, ticket.addr);
            self.unban_all(ticket);
        }
        all.len()
    }

    /// Remove a single ban right away.
    pub fn unban_ip(&self, addr: &Address) -> WardenResult<()> {
        let ticket = self
            .ban_manager
            .remove(addr)
            .ok_or_else(|| WardenError::NotBanned(addr.to_string()))?;
        info!("[{}] Unban {}", self.jail, ticket.addr);
        self.unban_all(&ticket);
        Ok(())
    }

    pub fn start_actions(&self) {
        for action in &self.snapshot() {
            if !action.exec_start(&self.runner) && !action.exec_start(&self.runner) {
                error!(
                    "[{}] Failed to start action {} after one retry",
                    self.jail,
                    action.name()
                );
            }
        }
    }

    pub fn stop_actions(&self) {
        for action in &self.snapshot() {
            if !action.exec_stop(&self.runner) && !action.exec_stop(&self.runner) {
                error!(
                    "[{}] Failed to stop action {} after one retry",
                    self.jail,
                    action.name()
                );
            }
        }
    }

    pub fn status(&self) -> Value {
        let ips: Vec<String> = self
            .ban_manager
            .banned_addresses()
            .iter()
            .map(|a| a.to_string())
            .collect();
        json!([
            ["Currently banned", self.ban_manager.size()],
            ["Total banned", self.ban_manager.total()],
            ["IP list", ips],
        ])
    }
}

/// Runtime knobs the action worker needs from the jail.
#[derive(Clone)]
pub struct RunnerContext {
    pub queue: Arc<Mutex<mpsc::Receiver<FailTicket>>>,
    pub idle: Arc<AtomicBool>,
    pub token: ShutdownToken,
    pub poll_interval: Duration,
}

async fn blocking<T: Send + 'static>(
    actions: &Arc<Actions>,
    f: impl FnOnce(&Actions) -> T + Send + 'static,
) -> Option<T> {
    let worker = actions.clone();
    match tokio::task::spawn_blocking(move || f(&worker)).await {
        Ok(v) => Some(v),
        Err(e) => {
            error!("[{}] Action task failed: {}", actions.jail, e);
            None
        }
    }
}

/// Action worker: start actions, then ban queued tickets and unban expired
/// ones until cancelled, then flush and stop.
pub async fn run(actions: Arc<Actions>, ctx: RunnerContext) {
    debug!("[{}] Action worker started", actions.jail);
    blocking(&actions, |a| a.start_actions()).await;

    while !ctx.token.is_cancelled() {
        if ctx.idle.load(Ordering::Relaxed) {
            tokio::select! {
                _ = tokio::time::sleep(ctx.poll_interval) => {}
                _ = ctx.token.cancelled() => break,
            }
            continue;
        }

        let ticket = ctx.queue.lock().try_recv().ok();
        let popped = ticket.is_some();
        blocking(&actions, move |a| {
            if let Some(t) = ticket {
                a.check_ban(t);
            }
            a.check_unban(a.clock.now());
        })
        .await;

        // keep draining without delay while tickets are queued
        if popped {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(ctx.poll_interval) => {}
            _ = ctx.token.cancelled() => break,
        }
    }

    blocking(&actions, |a| {
        a.flush_bans();
        a.stop_actions();
    })
    .await;
    debug!("[{}] Action worker stopped", actions.jail);
}

/// Hand a failure whose ban failed back to the fail table, one attempt
/// short of the threshold, so the next failure from that source retries the
/// ban instead of every poll.
fn restore_attempts(manager: &FailManager, fail: FailTicket) {
    let keep = fail.attempts.min(manager.max_retry().saturating_sub(1));
    if keep > 0 {
        manager.add(fail.with_attempts(keep));
    }
}
