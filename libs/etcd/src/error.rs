use std::time::Duration;

use thiserror::Error;

/// Errors from etcd membership operations.
#[derive(Debug, Error)]
pub enum EtcdError {
    /// Every peer was tried (two attempts each) and none answered.
    #[error("no more endpoints to try after {attempts} attempts: {source}")]
    NoMoreEndpoints {
        attempts: usize,
        #[source]
        source: Box<EtcdError>,
    },

    /// More than one member appeared during our join window. We have
    /// already removed ourselves when this is returned.
    #[error("concurrent etcd member join detected: before={before} members, after={after} members")]
    ConcurrentJoin { before: usize, after: usize },

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    /// Missing peers, CA material or other input. Never retried.
    #[error("etcd configuration error: {0}")]
    Config(String),

    #[error("{command} failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("endpoint unhealthy: {0}")]
    Unhealthy(String),

    #[error("failed to parse etcdctl output: {0}")]
    Parse(String),

    #[error("malformed peer url [{url}]: {reason}")]
    MalformedPeerUrl { url: String, reason: &'static str },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pki(#[from] plinth_pki::PkiError),
}

impl EtcdError {
    /// Configuration errors are fatal and are not retried by the join loop.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::Pki(plinth_pki::PkiError::MissingCa(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, EtcdError>;
