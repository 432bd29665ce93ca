//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Command-line flags**: `revdial agent --key/--server-url/--target`
//! 2. **Environment variables**: `REVDIAL_TOKEN`, `REVDIAL_LISTEN`,
//!    `REVDIAL_SERVER_URL`, `REVDIAL_AGENT_KEY`
//! 3. **Config file**: path via `--config <path>`, or `revdial.toml` in CWD
//! 4. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//!
//! [auth]
//! token = "your-secret-token"
//!
//! [dialer]
//! dial_timeout_secs = 30
//! keepalive_interval_secs = 15
//! read_timeout_secs = 45
//!
//! [manager]
//! grace_period_secs = 30
//! max_queued_dials = 16
//! sweep_interval_secs = 5
//!
//! # Only read by `revdial agent`
//! [agent]
//! server_url = "wss://tunnel.example.com"
//! key = "agent-0001"
//! target = "127.0.0.1:5900"        # or "unix:/run/app.sock"
//! reconnect_delay_secs = 1
//! reconnect_max_delay_secs = 30
//!
//! [logging]
//! level = "info"
//!
//! # Zero or more local TCP ports that dial through to an agent
//! [[forward]]
//! listen = "127.0.0.1:9000"
//! key = "agent-0001"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::dialer::DialerConfig;
use crate::error::ConfigError;
use crate::listener::{AgentConfig, Target};
use crate::manager::ManagerConfig;
use crate::protocol::is_valid_key;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "revdial.toml";

/// Token value that triggers a startup warning.
pub const DEFAULT_TOKEN: &str = "change-me";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub dialer: DialerSection,
    #[serde(default)]
    pub manager: ManagerSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Local TCP forwards served by `revdial serve`.
    #[serde(default)]
    pub forward: Vec<ForwardConfig>,
}

/// HTTP server settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared bearer token. Override with `REVDIAL_TOKEN`.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_token")]
    pub token: String,
}

/// Per-control-connection timeouts on the server.
#[derive(Debug, Clone, Deserialize)]
pub struct DialerSection {
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

/// Grace-period settings for the connection manager.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerSection {
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
    #[serde(default = "default_max_queued_dials")]
    pub max_queued_dials: usize,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Agent-side settings for `revdial agent`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentSection {
    /// Server base URL, `ws://`, `wss://`, `http://` or `https://`.
    /// Override with `REVDIAL_SERVER_URL`.
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Key this agent registers under. Override with `REVDIAL_AGENT_KEY`.
    pub key: Option<String>,
    /// Local endpoint every data connection is spliced to.
    pub target: Option<String>,
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: u64,
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// Initial reconnect backoff (default 1).
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
    /// Backoff ceiling (default 30).
    #[serde(default = "default_reconnect_max_delay")]
    pub reconnect_max_delay_secs: u64,
    /// How long shutdown waits for in-flight data connections (default 10).
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A local TCP listener whose connections are dialed through to `key`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ForwardConfig {
    pub listen: String,
    pub key: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_token() -> String {
    DEFAULT_TOKEN.to_string()
}
fn default_dial_timeout() -> u64 {
    30
}
fn default_keepalive_interval() -> u64 {
    15
}
fn default_read_timeout() -> u64 {
    45
}
fn default_grace_period() -> u64 {
    30
}
fn default_max_queued_dials() -> usize {
    16
}
fn default_sweep_interval() -> u64 {
    5
}
fn default_server_url() -> String {
    "ws://127.0.0.1:8080".to_string()
}
fn default_reconnect_delay() -> u64 {
    1
}
fn default_reconnect_max_delay() -> u64 {
    30
}
fn default_shutdown_timeout() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token: default_token(),
        }
    }
}

impl Default for DialerSection {
    fn default() -> Self {
        Self {
            dial_timeout_secs: default_dial_timeout(),
            keepalive_interval_secs: default_keepalive_interval(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl Default for ManagerSection {
    fn default() -> Self {
        Self {
            grace_period_secs: default_grace_period(),
            max_queued_dials: default_max_queued_dials(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            key: None,
            target: None,
            keepalive_interval_secs: default_keepalive_interval(),
            read_timeout_secs: default_read_timeout(),
            reconnect_delay_secs: default_reconnect_delay(),
            reconnect_max_delay_secs: default_reconnect_max_delay(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `revdial.toml` in
    /// the current directory is used when present.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Config::default(),
        };
        config.apply_env(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Parse and validate TOML text. `origin` names the source in error
    /// messages.
    pub fn parse(origin: &str, content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check every timing setting, including the agent's. Key and target are
    /// only required by [`Config::agent_config`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.dialer_config()?;
        self.manager_config()?;
        self.agent_timings()?;
        Ok(())
    }

    /// Apply environment overrides through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(token) = lookup("REVDIAL_TOKEN") {
            self.auth.token = token;
        }
        if let Some(listen) = lookup("REVDIAL_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(url) = lookup("REVDIAL_SERVER_URL") {
            self.agent.server_url = url;
        }
        if let Some(key) = lookup("REVDIAL_AGENT_KEY") {
            self.agent.key = Some(key);
        }
    }

    pub fn dialer_config(&self) -> Result<DialerConfig, ConfigError> {
        let dialer = &self.dialer;
        let (keepalive_interval, read_timeout) = keepalive_window(
            "dialer.keepalive_interval_secs",
            dialer.keepalive_interval_secs,
            dialer.read_timeout_secs,
        )?;
        Ok(DialerConfig {
            dial_timeout: positive_secs("dialer.dial_timeout_secs", dialer.dial_timeout_secs)?,
            keepalive_interval,
            read_timeout,
        })
    }

    /// A zero grace period is allowed: abrupt disconnects then fail queued
    /// dials at once.
    pub fn manager_config(&self) -> Result<ManagerConfig, ConfigError> {
        Ok(ManagerConfig {
            grace_period: Duration::from_secs(self.manager.grace_period_secs),
            max_queued_dials: self.manager.max_queued_dials,
            sweep_interval: positive_secs(
                "manager.sweep_interval_secs",
                self.manager.sweep_interval_secs,
            )?,
        })
    }

    /// Keep-alive, read timeout and reconnect backoff of the `[agent]` section.
    fn agent_timings(&self) -> Result<(Duration, Duration, Duration, Duration), ConfigError> {
        let agent = &self.agent;
        let (keepalive, read) = keepalive_window(
            "agent.keepalive_interval_secs",
            agent.keepalive_interval_secs,
            agent.read_timeout_secs,
        )?;
        let delay = positive_secs("agent.reconnect_delay_secs", agent.reconnect_delay_secs)?;
        if agent.reconnect_max_delay_secs < agent.reconnect_delay_secs {
            return Err(ConfigError::Invalid {
                setting: "agent.reconnect_max_delay_secs",
                reason: "must not be below reconnect_delay_secs",
            });
        }
        let max_delay = Duration::from_secs(agent.reconnect_max_delay_secs);
        Ok((keepalive, read, delay, max_delay))
    }

    /// Resolve the `[agent]` section into a runnable [`AgentConfig`].
    pub fn agent_config(&self) -> Result<AgentConfig, ConfigError> {
        let agent = &self.agent;
        let key = agent.key.clone().ok_or(ConfigError::Missing("agent.key"))?;
        if !is_valid_key(&key) {
            return Err(ConfigError::InvalidKey(key));
        }
        let target: Target = agent
            .target
            .as_deref()
            .ok_or(ConfigError::Missing("agent.target"))?
            .parse()?;
        let (keepalive_interval, read_timeout, reconnect_delay, reconnect_max_delay) =
            self.agent_timings()?;

        Ok(AgentConfig {
            server_url: agent.server_url.clone(),
            key,
            token: self.auth.token.clone(),
            target,
            keepalive_interval,
            read_timeout,
            reconnect_delay,
            reconnect_max_delay,
            shutdown_timeout: Duration::from_secs(agent.shutdown_timeout_secs),
        })
    }
}

fn positive_secs(setting: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    if secs == 0 {
        return Err(ConfigError::Invalid {
            setting,
            reason: "must be at least 1",
        });
    }
    Ok(Duration::from_secs(secs))
}

/// The keep-alive must fire at least once before the peer's read timeout.
fn keepalive_window(
    setting: &'static str,
    keepalive_secs: u64,
    read_timeout_secs: u64,
) -> Result<(Duration, Duration), ConfigError> {
    let keepalive = positive_secs(setting, keepalive_secs)?;
    if read_timeout_secs <= keepalive_secs {
        return Err(ConfigError::Invalid {
            setting,
            reason: "must be shorter than read_timeout_secs",
        });
    }
    Ok((keepalive, Duration::from_secs(read_timeout_secs)))
}
