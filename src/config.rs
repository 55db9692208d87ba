//! Daemon configuration.
//!
//! The YAML file describes server settings plus a list of jails. Jails are
//! not built directly from the file: [`ServerConfig::jail_commands`] turns
//! them into the same control-plane command stream a client would send, so
//! start-up and runtime reconfiguration share one dispatcher.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::logging::{DEFAULT_LOG_LEVEL, DEFAULT_LOG_TARGET};
use crate::pidfile::DEFAULT_PID_FILE;
use crate::server::transport::DEFAULT_SOCKET;
use crate::server::RESERVED_JAIL_NAME;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/failwarden/config.yaml";

/// Server settings and startup jails.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Control socket path
    pub socket: PathBuf,

    /// PID file path
    pub pidfile: PathBuf,

    /// Log level (0 fatal .. 4 debug)
    pub loglevel: u8,

    /// STDOUT, STDERR, SYSLOG or a file path
    pub logtarget: String,

    /// Action command timeout in seconds, 0 disables it
    pub command_timeout_secs: u64,

    /// Polling period of the jail workers
    pub poll_interval_ms: u64,

    /// Capacity of each jail's fail-ticket queue
    pub queue_capacity: usize,

    pub jails: Vec<JailConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket: PathBuf::from(DEFAULT_SOCKET),
            pidfile: PathBuf::from(DEFAULT_PID_FILE),
            loglevel: DEFAULT_LOG_LEVEL,
            logtarget: DEFAULT_LOG_TARGET.to_string(),
            command_timeout_secs: 60,
            poll_interval_ms: 1000,
            queue_capacity: 1024,
            jails: Vec::new(),
        }
    }
}

/// One jail as declared in the file. Unset numeric options keep the
/// jail's built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JailConfig {
    pub name: String,

    /// auto, polling or notify
    pub backend: String,

    pub enabled: bool,

    pub logpath: Vec<String>,

    /// Start reading new log files at their end
    pub tail: bool,

    pub failregex: Vec<String>,
    pub ignoreregex: Vec<String>,
    pub ignoreip: Vec<String>,

    pub findtime: Option<i64>,
    pub maxretry: Option<u32>,
    pub bantime: Option<i64>,

    /// yes, warn or no
    pub usedns: Option<String>,

    pub maxlines: Option<usize>,

    /// Charset of the log files, `auto` for UTF-8
    pub logencoding: Option<String>,

    /// `%`-field date pattern tried before the built-in formats
    pub datepattern: Option<String>,

    /// Exit status 0 ignores the address; `<ip>` is substituted
    pub ignorecommand: Option<String>,

    pub actions: Vec<ActionConfig>,
}

impl Default for JailConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            backend: "auto".to_string(),
            enabled: true,
            logpath: Vec::new(),
            tail: false,
            failregex: Vec::new(),
            ignoreregex: Vec::new(),
            ignoreip: Vec::new(),
            findtime: None,
            maxretry: None,
            bantime: None,
            usedns: None,
            maxlines: None,
            logencoding: None,
            datepattern: None,
            ignorecommand: None,
            actions: Vec::new(),
        }
    }
}

/// A shell action and its tag definitions.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ActionConfig {
    pub name: String,
    pub cinfo: BTreeMap<String, String>,
    pub start: String,
    pub stop: String,
    pub check: String,
    pub ban: String,
    pub unban: String,
}

impl ServerConfig {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: ServerConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.socket.as_os_str().is_empty() {
            anyhow::bail!("socket path must not be empty");
        }

        if self.loglevel > 4 {
            anyhow::bail!("Invalid loglevel {}. Valid values: 0..4", self.loglevel);
        }

        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be greater than zero");
        }

        let mut seen = HashSet::new();
        for jail in &self.jails {
            if jail.name.is_empty() {
                anyhow::bail!("Every jail needs a name");
            }
            if jail.name == RESERVED_JAIL_NAME {
                anyhow::bail!("'{}' is reserved and cannot name a jail", RESERVED_JAIL_NAME);
            }
            if !seen.insert(jail.name.as_str()) {
                anyhow::bail!("Jail '{}' is defined twice", jail.name);
            }
            if jail.backend.parse::<crate::filter::Backend>().is_err() {
                anyhow::bail!(
                    "Jail '{}': invalid backend '{}'. Valid values: auto, polling, notify",
                    jail.name,
                    jail.backend
                );
            }
            let mut actions = HashSet::new();
            for action in &jail.actions {
                if action.name.is_empty() || !actions.insert(action.name.as_str()) {
                    anyhow::bail!(
                        "Jail '{}': action names must be unique and non-empty",
                        jail.name
                    );
                }
            }
        }

        Ok(())
    }

    /// `None` means commands may run forever.
    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Control-plane commands that build and start every enabled jail.
    pub fn jail_commands(&self) -> Vec<Vec<String>> {
        let mut stream = Vec::new();
        for jail in self.jails.iter().filter(|j| j.enabled) {
            jail.push_commands(&mut stream);
        }
        stream
    }
}

fn command<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

impl JailConfig {
    fn push_commands(&self, out: &mut Vec<Vec<String>>) {
        let name = self.name.as_str();
        let set = |option: &str, value: &str| command(["set", name, option, value]);

        out.push(command(["add", name, self.backend.as_str()]));

        if let Some(v) = &self.logencoding {
            out.push(set("logencoding", v));
        }
        let position = if self.tail { "tail" } else { "head" };
        for path in &self.logpath {
            out.push(command(["set", name, "addlogpath", path.as_str(), position]));
        }
        for pattern in &self.failregex {
            out.push(set("addfailregex", pattern));
        }
        for pattern in &self.ignoreregex {
            out.push(set("addignoreregex", pattern));
        }
        for entry in &self.ignoreip {
            out.push(set("addignoreip", entry));
        }
        if let Some(v) = self.findtime {
            out.push(set("findtime", &v.to_string()));
        }
        if let Some(v) = self.maxretry {
            out.push(set("maxretry", &v.to_string()));
        }
        if let Some(v) = self.bantime {
            out.push(set("bantime", &v.to_string()));
        }
        if let Some(v) = &self.usedns {
            out.push(set("usedns", v));
        }
        if let Some(v) = self.maxlines {
            out.push(set("maxlines", &v.to_string()));
        }
        if let Some(v) = &self.datepattern {
            out.push(set("datepattern", v));
        }
        if let Some(v) = &self.ignorecommand {
            out.push(set("ignorecommand", v));
        }

        for action in &self.actions {
            let a = action.name.as_str();
            out.push(set("addaction", a));
            for (key, value) in &action.cinfo {
                out.push(command(["set", name, "setcinfo", a, key.as_str(), value.as_str()]));
            }
            for (option, template) in [
                ("actionstart", &action.start),
                ("actionstop", &action.stop),
                ("actioncheck", &action.check),
                ("actionban", &action.ban),
                ("actionunban", &action.unban),
            ] {
                if !template.is_empty() {
                    out.push(command(["set", name, option, a, template.as_str()]));
                }
            }
        }

        out.push(command(["start", name]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const SAMPLE: &str = r#"
socket: /tmp/fw.sock
loglevel: 4
jails:
  - name: ssh
    backend: polling
    logpath: [/var/log/auth.log]
    tail: true
    failregex:
      - "Failed password for .* from <HOST>"
    ignoreip: [127.0.0.1/8]
    maxretry: 3
    bantime: 600
    logencoding: latin1
    datepattern: "%Y-%m-%d %H:%M:%S"
    actions:
      - name: iptables
        cinfo:
          chain: INPUT
        ban: "iptables -I <chain> -s <ip> -j DROP"
  - name: web
    enabled: false
"#;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.socket, PathBuf::from(DEFAULT_SOCKET));
        assert_eq!(config.loglevel, 3);
        assert_eq!(config.command_timeout(), Some(Duration::from_secs(60)));
        assert_eq!(config.poll_interval(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_sample() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!(config.socket, PathBuf::from("/tmp/fw.sock"));
        assert_eq!(config.loglevel, 4);
        assert_eq!(config.queue_capacity, 1024);
        assert_eq!(config.jails.len(), 2);
        assert_eq!(config.jails[0].maxretry, Some(3));
        assert_eq!(config.jails[1].backend, "auto");
        assert!(!config.jails[1].enabled);
    }

    #[test]
    fn test_load_reports_path() {
        let err = ServerConfig::load("/nonexistent/failwarden.yaml").unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }

    #[test]
    fn test_validate_rejections() {
        let mut config = ServerConfig {
            loglevel: 5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        config.loglevel = 3;
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        config.queue_capacity = 8;
        config.socket = PathBuf::new();
        assert!(config.validate().is_err());

        config.socket = PathBuf::from("/tmp/x.sock");
        config.jails = vec![JailConfig {
            name: "all".to_string(),
            ..Default::default()
        }];
        assert!(config.validate().is_err());

        let ssh = JailConfig {
            name: "ssh".to_string(),
            ..Default::default()
        };
        config.jails = vec![ssh.clone(), ssh.clone()];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("defined twice"));

        config.jails = vec![JailConfig {
            backend: "gamin".to_string(),
            ..ssh
        }];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_is_unlimited() {
        let config = ServerConfig {
            command_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.command_timeout(), None);
    }

    #[test]
    fn test_jail_commands_stream() {
        let config: ServerConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let stream = config.jail_commands();
        let first = &stream[0];
        assert_eq!(first, &vec!["add", "ssh", "polling"]);
        assert!(stream.contains(&command(["set", "ssh", "addlogpath", "/var/log/auth.log", "tail"])));
        assert!(stream.contains(&command(["set", "ssh", "maxretry", "3"])));
        assert_eq!(stream[1], command(["set", "ssh", "logencoding", "latin1"]));
        assert!(stream.contains(&command(["set", "ssh", "datepattern", "%Y-%m-%d %H:%M:%S"])));
        assert!(!stream.iter().any(|c| c.get(2).map(String::as_str) == Some("ignorecommand")));
        assert!(stream.contains(&command(["set", "ssh", "setcinfo", "iptables", "chain", "INPUT"])));
        assert!(stream.contains(&command([
            "set",
            "ssh",
            "actionban",
            "iptables",
            "iptables -I <chain> -s <ip> -j DROP"
        ])));
        // empty templates are not sent
        assert!(!stream.iter().any(|c| c.get(2).map(String::as_str) == Some("actionunban")));
        assert_eq!(stream.last().unwrap(), &vec!["start", "ssh"]);
        // disabled jails are skipped
        assert!(!stream.iter().any(|c| c.get(1).map(String::as_str) == Some("web")));
    }

    #[test]
    fn test_serialize_deserialize() {
        let config: ServerConfig = serde_yaml::from_str(SAMPLE).unwrap();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: ServerConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, config);
    }
}
