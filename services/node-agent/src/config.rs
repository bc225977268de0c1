//! Configuration for the node bootstrap agent.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix for every absolute path the agent writes. `/` on real hosts.
    pub root: PathBuf,

    /// etcd working directory (data dir and certificates live below it).
    pub etcd_home: PathBuf,

    /// Path to the etcdctl binary.
    pub etcdctl: PathBuf,

    /// Overrides the detected node IP.
    pub node_ip: Option<String>,

    /// Overrides the node id (defaults to the hostname).
    pub node_id: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log format (json or text).
    pub log_format: String,

    /// Per-call timeout for external commands.
    pub command_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/"),
            etcd_home: PathBuf::from("/var/lib/plinth/etcd"),
            etcdctl: PathBuf::from("/usr/local/bin/etcdctl"),
            node_ip: None,
            node_id: None,
            log_level: "info".to_string(),
            log_format: "json".to_string(),
            command_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        let command_timeout = match lookup("PLINTH_COMMAND_TIMEOUT_SECS") {
            Some(raw) => Duration::from_secs(
                raw.parse()
                    .with_context(|| format!("invalid PLINTH_COMMAND_TIMEOUT_SECS: {}", raw))?,
            ),
            None => defaults.command_timeout,
        };

        Ok(Self {
            root: lookup("PLINTH_ROOT").map(PathBuf::from).unwrap_or(defaults.root),
            etcd_home: lookup("PLINTH_ETCD_HOME")
                .map(PathBuf::from)
                .unwrap_or(defaults.etcd_home),
            etcdctl: lookup("PLINTH_ETCDCTL")
                .map(PathBuf::from)
                .unwrap_or(defaults.etcdctl),
            node_ip: lookup("PLINTH_NODE_IP").filter(|s| !s.is_empty()),
            node_id: lookup("PLINTH_NODE_ID").filter(|s| !s.is_empty()),
            log_level: lookup("PLINTH_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format: lookup("PLINTH_LOG_FORMAT").unwrap_or(defaults.log_format),
            command_timeout,
        })
    }
}
