//! Control-plane dispatcher: one request (an argument list) in, one
//! [`Reply`] out. Errors never escape; they become code-1 replies.

use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::codec::Reply;
use super::Server;
use crate::action::CommandKind;
use crate::config::ServerConfig;
use crate::dns::UseDns;
use crate::error::{WardenError, WardenResult};
use crate::filter::Backend;
use crate::jail::Jail;
use crate::net::Address;

/// Upper bound for the `sleep` verb.
const MAX_SLEEP: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub struct Transmitter {
    server: Arc<Server>,
}

fn arg<'a>(args: &'a [String], index: usize) -> WardenResult<&'a str> {
    args.get(index)
        .map(String::as_str)
        .ok_or_else(|| WardenError::Protocol(format!("missing argument in {:?}", args)))
}

/// Everything from `index` on, joined by spaces (templates and regexes may
/// arrive split by the client's shell).
fn rest(args: &[String], index: usize) -> WardenResult<String> {
    if args.len() <= index {
        return Err(WardenError::Protocol(format!("missing argument in {:?}", args)));
    }
    Ok(args[index..].join(" "))
}

fn parse<T: std::str::FromStr>(text: &str, what: &str) -> WardenResult<T> {
    text.parse()
        .map_err(|_| WardenError::Config(format!("invalid {}: {:?}", what, text)))
}

fn strings(items: Vec<String>) -> Value {
    json!(items)
}

fn paths(jail: &Jail) -> Value {
    json!(jail
        .filter()
        .log_paths()
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>())
}

fn banned(jail: &Jail) -> Value {
    json!(jail
        .actions()
        .ban_manager()
        .banned_addresses()
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>())
}

impl Transmitter {
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Execute one request.
    pub async fn proceed(&self, args: &[String]) -> Reply {
        debug!("Command: {:?}", args);
        match self.dispatch(args).await {
            Ok(value) => Reply::ok(value),
            Err(e) => {
                warn!("Command {:?} has failed. Received {}", args, e);
                Reply::error(e.to_string())
            }
        }
    }

    /// Execute a batch of commands, stopping at the first failure.
    pub async fn apply(&self, commands: &[Vec<String>]) -> WardenResult<()> {
        for command in commands {
            let reply = self.proceed(command).await;
            if !reply.is_ok() {
                return Err(WardenError::Config(format!(
                    "{:?} failed: {}",
                    command,
                    reply.value.as_str().unwrap_or_default()
                )));
            }
        }
        Ok(())
    }

    async fn dispatch(&self, args: &[String]) -> WardenResult<Value> {
        let verb = arg(args, 0)?;
        match verb {
            "ping" => Ok(json!("pong")),
            "add" => {
                let name = arg(args, 1)?;
                let backend = args
                    .get(2)
                    .map(|b| b.parse::<Backend>())
                    .transpose()?
                    .unwrap_or_default();
                self.server.add_jail(name, backend)?;
                Ok(json!(name))
            }
            "start" => {
                self.server.start_jail(arg(args, 1)?)?;
                Ok(Value::Null)
            }
            "stop" => match args.get(1).map(String::as_str) {
                None => {
                    info!("Shutdown requested over the control socket");
                    self.server.quit().await;
                    Ok(Value::Null)
                }
                Some(super::RESERVED_JAIL_NAME) => {
                    self.server.stop_all_jails().await;
                    Ok(Value::Null)
                }
                Some(name) => {
                    self.server.stop_jail(name).await?;
                    Ok(Value::Null)
                }
            },
            "reload" => self.reload().await,
            "status" => match args.get(1) {
                None => Ok(self.server.status()),
                Some(name) => self.server.status_jail(name),
            },
            "sleep" => {
                let secs: f64 = parse(arg(args, 1)?, "duration")?;
                if !secs.is_finite() || secs < 0.0 {
                    return Err(WardenError::Config(format!("invalid duration: {}", secs)));
                }
                tokio::time::sleep(Duration::from_secs_f64(secs).min(MAX_SLEEP)).await;
                Ok(Value::Null)
            }
            "set" => self.set(args).await,
            "get" => self.get(args),
            other => Err(WardenError::Protocol(format!("invalid command: {}", other))),
        }
    }

    async fn reload(&self) -> WardenResult<Value> {
        let Some(path) = self.server.config_path().map(Path::to_path_buf) else {
            debug!("No configuration file to reload");
            return Ok(Value::Null);
        };
        let config = ServerConfig::load(&path)
            .map_err(|e| WardenError::Config(format!("{:#}", e)))?;
        info!("Reloading jails from {}", path.display());
        self.server.stop_all_jails().await;
        // apply() dispatches back into reload(), so the future is boxed
        Box::pin(self.apply(&config.jail_commands())).await?;
        Ok(Value::Null)
    }

    async fn set(&self, args: &[String]) -> WardenResult<Value> {
        let name = arg(args, 1)?;
        match name {
            "loglevel" => {
                let level: u8 = parse(arg(args, 2)?, "log level")?;
                self.server.log().set_level(level)?;
                return Ok(json!(self.server.log().level()));
            }
            "logtarget" => {
                self.server.log().set_target(&rest(args, 2)?)?;
                return Ok(json!(self.server.log().target()));
            }
            _ => {}
        }

        let jail = self.server.jail(name)?;
        let filter = jail.filter();
        let actions = jail.actions();
        let command = arg(args, 2)?;
        match command {
            "idle" => {
                match arg(args, 3)? {
                    "on" => jail.set_idle(true),
                    "off" => jail.set_idle(false),
                    other => {
                        return Err(WardenError::Config(format!(
                            "idle expects on or off, got {}",
                            other
                        )))
                    }
                }
                Ok(Value::Null)
            }
            "addignoreip" => {
                filter.add_ignore_ip(arg(args, 3)?);
                Ok(strings(filter.ignore_ips()))
            }
            "delignoreip" => {
                filter.del_ignore_ip(arg(args, 3)?)?;
                Ok(strings(filter.ignore_ips()))
            }
            "addlogpath" => {
                let path = arg(args, 3)?;
                let tail = match args.get(4).map(String::as_str) {
                    None | Some("head") => false,
                    Some("tail") => true,
                    Some(other) => {
                        return Err(WardenError::Config(format!(
                            "addlogpath expects head or tail, got {}",
                            other
                        )))
                    }
                };
                filter.add_log_path(Path::new(path), tail)?;
                Ok(paths(&jail))
            }
            "dellogpath" => {
                filter.del_log_path(Path::new(arg(args, 3)?))?;
                Ok(paths(&jail))
            }
            "addfailregex" => {
                filter.add_fail_regex(&rest(args, 3)?)?;
                Ok(strings(filter.fail_regex()))
            }
            "delfailregex" => {
                filter.del_fail_regex(parse(arg(args, 3)?, "index")?)?;
                Ok(strings(filter.fail_regex()))
            }
            "addignoreregex" => {
                filter.add_ignore_regex(&rest(args, 3)?)?;
                Ok(strings(filter.ignore_regex()))
            }
            "delignoreregex" => {
                filter.del_ignore_regex(parse(arg(args, 3)?, "index")?)?;
                Ok(strings(filter.ignore_regex()))
            }
            "findtime" => {
                let secs: i64 = parse(arg(args, 3)?, "find time")?;
                if secs <= 0 {
                    return Err(WardenError::Config("findtime must be positive".to_string()));
                }
                filter.set_find_time(secs);
                Ok(json!(filter.find_time()))
            }
            "maxretry" => {
                let n: u32 = parse(arg(args, 3)?, "retry count")?;
                if n == 0 {
                    return Err(WardenError::Config("maxretry must be positive".to_string()));
                }
                filter.set_max_retry(n);
                Ok(json!(filter.max_retry()))
            }
            "bantime" => {
                let secs: i64 = parse(arg(args, 3)?, "ban time")?;
                actions.set_ban_time(secs);
                Ok(json!(actions.ban_time()))
            }
            "usedns" => {
                let mode: UseDns = parse(arg(args, 3)?, "usedns value")?;
                filter.set_use_dns(mode);
                Ok(json!(filter.use_dns().to_string()))
            }
            "maxlines" => {
                filter.set_max_lines(parse(arg(args, 3)?, "line count")?)?;
                Ok(json!(filter.max_lines()))
            }
            "ignorecommand" => {
                filter.set_ignore_command(&rest(args, 3)?);
                Ok(json!(filter.ignore_command()))
            }
            "logencoding" => {
                filter.set_log_encoding(arg(args, 3)?)?;
                Ok(json!(filter.log_encoding()))
            }
            "datepattern" => {
                filter.set_date_pattern(&rest(args, 3)?)?;
                Ok(json!(filter.date_pattern()))
            }
            "banip" => {
                let text = arg(args, 3)?;
                let addr = Address::parse(text);
                filter.add_banned_ip(&addr)?;
                Ok(json!(addr.to_string()))
            }
            "unbanip" => {
                let addr = Address::parse(arg(args, 3)?);
                if !addr.is_valid() {
                    return Err(WardenError::InvalidAddress(addr.raw().to_string()));
                }
                let worker = actions.clone();
                let target = addr.clone();
                tokio::task::spawn_blocking(move || worker.unban_ip(&target))
                    .await
                    .map_err(|e| WardenError::Command(e.to_string()))??;
                Ok(json!(addr.to_string()))
            }
            "addaction" => {
                let action = arg(args, 3)?;
                actions.add_action(action)?;
                Ok(json!(action))
            }
            "delaction" => {
                actions.del_action(arg(args, 3)?)?;
                Ok(Value::Null)
            }
            "setcinfo" => {
                let action = arg(args, 3)?;
                let key = arg(args, 4)?.to_string();
                let value = rest(args, 5)?;
                actions.with_action(action, |a| a.set_cinfo(&key, &value))?;
                Ok(json!(value))
            }
            "delcinfo" => {
                let action = arg(args, 3)?;
                let key = arg(args, 4)?.to_string();
                actions.with_action(action, |a| a.del_cinfo(&key))?;
                Ok(Value::Null)
            }
            "actionstart" | "actionstop" | "actioncheck" | "actionban" | "actionunban" => {
                let kind: CommandKind = command.parse()?;
                let action = arg(args, 3)?;
                let template = rest(args, 4)?;
                actions.with_action(action, |a| a.set_command(kind, &template))?;
                Ok(json!(template))
            }
            other => Err(WardenError::Protocol(format!(
                "invalid set command: {}",
                other
            ))),
        }
    }

    fn get(&self, args: &[String]) -> WardenResult<Value> {
        let name = arg(args, 1)?;
        match name {
            "loglevel" => return Ok(json!(self.server.log().level())),
            "logtarget" => return Ok(json!(self.server.log().target())),
            _ => {}
        }

        let jail = self.server.jail(name)?;
        let filter = jail.filter();
        let actions = jail.actions();
        let command = arg(args, 2)?;
        match command {
            "idle" => Ok(json!(jail.is_idle())),
            "logpath" => Ok(paths(&jail)),
            "ignoreip" => Ok(strings(filter.ignore_ips())),
            "failregex" => Ok(strings(filter.fail_regex())),
            "ignoreregex" => Ok(strings(filter.ignore_regex())),
            "findtime" => Ok(json!(filter.find_time())),
            "maxretry" => Ok(json!(filter.max_retry())),
            "bantime" => Ok(json!(actions.ban_time())),
            "usedns" => Ok(json!(filter.use_dns().to_string())),
            "maxlines" => Ok(json!(filter.max_lines())),
            "ignorecommand" => Ok(json!(filter.ignore_command())),
            "logencoding" => Ok(json!(filter.log_encoding())),
            "datepattern" => Ok(json!(filter.date_pattern())),
            "banned" => Ok(banned(&jail)),
            "addaction" => Ok(json!(actions.last_action())),
            "cinfo" => {
                let action = arg(args, 3)?;
                let key = arg(args, 4)?;
                let value = actions.with_action(action, |a| a.cinfo(key).map(str::to_string))?;
                value
                    .map(|v| json!(v))
                    .ok_or_else(|| WardenError::Config(format!("no cinfo key {} in {}", key, action)))
            }
            "actionstart" | "actionstop" | "actioncheck" | "actionban" | "actionunban" => {
                let kind: CommandKind = command.parse()?;
                let action = arg(args, 3)?;
                Ok(json!(
                    actions.with_action(action, |a| a.command(kind).to_string())?
                ))
            }
            other => Err(WardenError::Protocol(format!(
                "invalid get command: {}",
                other
            ))),
        }
    }
}
