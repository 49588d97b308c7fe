//! Client configuration.
//!
//! Durations are carried as integer milliseconds so the struct round-trips
//! through any serde format unchanged.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use shardmc_common::{McError, McResult};

use crate::pool::PoolConfig;

pub const DEFAULT_MAX_IDLE_CONNS: usize = 10;
pub const DEFAULT_MAX_ACTIVE_CONNS: usize = 20;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(100);

/// Wire protocol spoken to every server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    #[default]
    Text,
    Binary,
}

impl ProtocolKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolKind::Text => "text",
            ProtocolKind::Binary => "binary",
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolKind {
    type Err = McError;

    fn from_str(s: &str) -> McResult<Self> {
        match s {
            "text" => Ok(ProtocolKind::Text),
            "binary" => Ok(ProtocolKind::Binary),
            other => Err(McError::InvalidConfig(format!(
                "unknown protocol {other:?}, expected \"text\" or \"binary\""
            ))),
        }
    }
}

/// Configuration for the client and its per-shard pools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Server addresses in shard order, e.g. "127.0.0.1:11211".
    #[serde(default)]
    pub servers: Vec<String>,

    /// Idle connections kept per shard.
    #[serde(default = "default_max_idle_conns")]
    pub max_idle_conns: usize,

    /// Connections checked out at once per shard.
    #[serde(default = "default_max_active_conns")]
    pub max_active_conns: usize,

    /// Idle connections older than this are closed instead of reused.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// Read/write deadline applied on every checkout.
    #[serde(default = "default_socket_timeout_ms")]
    pub socket_timeout_ms: u64,

    /// Dial deadline. Unset means the OS default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connect_timeout_ms: Option<u64>,

    /// Send `set` and `delete` as quiet commands.
    #[serde(default = "default_noreply")]
    pub noreply: bool,

    #[serde(default)]
    pub protocol: ProtocolKind,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            max_idle_conns: default_max_idle_conns(),
            max_active_conns: default_max_active_conns(),
            idle_timeout_ms: default_idle_timeout_ms(),
            socket_timeout_ms: default_socket_timeout_ms(),
            connect_timeout_ms: None,
            noreply: default_noreply(),
            protocol: ProtocolKind::default(),
        }
    }
}

impl ClientConfig {
    /// Default configuration for `servers`.
    pub fn new<I, S>(servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ClientConfig {
            servers: servers.into_iter().map(Into::into).collect(),
            ..ClientConfig::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_millis(self.socket_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_ms.map(Duration::from_millis)
    }

    /// Rejects configurations no pool can run with.
    pub fn validate(&self) -> McResult<()> {
        if self.servers.is_empty() {
            return Err(McError::InvalidConfig("at least one server is required".into()));
        }
        if let Some(addr) = self.servers.iter().find(|addr| addr.trim().is_empty()) {
            return Err(McError::InvalidConfig(format!("empty server address {addr:?}")));
        }
        if self.max_active_conns == 0 {
            return Err(McError::InvalidConfig("max_active_conns must be positive".into()));
        }
        if self.connect_timeout_ms == Some(0) {
            return Err(McError::InvalidConfig("connect_timeout_ms must be positive".into()));
        }
        Ok(())
    }

    /// Per-shard pool settings, with the idle timeout floored at the socket timeout.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_conns: self.max_idle_conns,
            max_active_conns: self.max_active_conns,
            idle_timeout: self.idle_timeout(),
            socket_timeout: self.socket_timeout(),
        }
        .normalized()
    }
}

fn default_max_idle_conns() -> usize {
    DEFAULT_MAX_IDLE_CONNS
}

fn default_max_active_conns() -> usize {
    DEFAULT_MAX_ACTIVE_CONNS
}

fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT.as_millis() as u64
}

fn default_socket_timeout_ms() -> u64 {
    DEFAULT_SOCKET_TIMEOUT.as_millis() as u64
}

fn default_noreply() -> bool {
    true
}
