//! Administrative client for a running etcd cluster.
//!
//! [`EtcdCtl`] is the only path to the cluster. [`CommandEtcdCtl`] drives the
//! `etcdctl` binary with mutual TLS; membership and status come back as JSON,
//! health is the exit status.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::certs::CertLayout;
use crate::error::{EtcdError, Result};
use crate::member::{MemberId, MemberSnapshot};

/// `etcdctl -w json endpoint status` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointStatus {
    #[serde(rename = "Endpoint")]
    pub endpoint: String,
    #[serde(rename = "Status")]
    pub status: StatusBody,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusBody {
    #[serde(default)]
    pub header: StatusHeader,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "dbSize", default)]
    pub db_size: u64,
    #[serde(default)]
    pub leader: MemberId,
    #[serde(rename = "raftIndex", default)]
    pub raft_index: u64,
    #[serde(rename = "raftTerm", default)]
    pub raft_term: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusHeader {
    #[serde(default)]
    pub cluster_id: MemberId,
    #[serde(default)]
    pub member_id: MemberId,
    #[serde(default)]
    pub revision: i64,
}

impl EndpointStatus {
    pub fn is_leader(&self) -> bool {
        !self.status.leader.is_absent() && self.status.leader == self.status.header.member_id
    }
}

/// Input for `etcdctl snapshot restore`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreRequest {
    pub snapshot: PathBuf,
    pub data_dir: PathBuf,
    pub name: String,
    pub initial_cluster: String,
    pub initial_cluster_token: String,
    pub initial_advertise_peer_urls: String,
}

/// Administrative operations against a running cluster.
#[async_trait]
pub trait EtcdCtl: Send + Sync {
    /// Members as seen by `endpoint`.
    async fn member_list(&self, endpoint: &str) -> Result<MemberSnapshot>;

    /// Register a new, not yet started member.
    async fn member_add(&self, endpoint: &str, name: &str, peer_url: &str) -> Result<()>;

    async fn member_remove(&self, endpoint: &str, id: &MemberId) -> Result<()>;

    /// Succeeds only when every endpoint reports healthy.
    async fn endpoint_health(&self, endpoints: &[String]) -> Result<()>;

    async fn endpoint_status(&self, endpoints: &[String]) -> Result<Vec<EndpointStatus>>;

    async fn snapshot_save(&self, endpoint: &str, path: &Path) -> Result<()>;

    async fn snapshot_restore(&self, request: &RestoreRequest) -> Result<()>;
}

/// [`EtcdCtl`] backed by the `etcdctl` binary.
#[derive(Debug, Clone)]
pub struct CommandEtcdCtl {
    binary: PathBuf,
    certs: CertLayout,
    timeout: Duration,
}

impl CommandEtcdCtl {
    pub fn new(binary: impl Into<PathBuf>, certs: CertLayout, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            certs,
            timeout,
        }
    }

    fn tls_args(&self, endpoints: &str) -> Vec<String> {
        vec![
            "--endpoints".to_string(),
            endpoints.to_string(),
            "--cacert".to_string(),
            self.certs.server_ca().display().to_string(),
            "--cert".to_string(),
            self.certs.client_cert().display().to_string(),
            "--key".to_string(),
            self.certs.client_key().display().to_string(),
        ]
    }

    async fn run(&self, args: Vec<String>) -> Result<Vec<u8>> {
        let command = format!("etcdctl {}", args.join(" "));
        debug!(command = %command, "running etcdctl");

        let child = Command::new(&self.binary)
            .args(&args)
            .env("ETCDCTL_API", "3")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(command = %command, timeout = ?self.timeout, "etcdctl timed out");
                return Err(EtcdError::Timeout {
                    what: command,
                    after: self.timeout,
                });
            }
        };

        if !output.status.success() {
            return Err(EtcdError::Command {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }

    fn with_tail(mut head: Vec<String>, tail: &[&str]) -> Vec<String> {
        head.extend(tail.iter().map(|s| s.to_string()));
        head
    }
}

#[async_trait]
impl EtcdCtl for CommandEtcdCtl {
    async fn member_list(&self, endpoint: &str) -> Result<MemberSnapshot> {
        let args = Self::with_tail(self.tls_args(endpoint), &["-w", "json", "member", "list"]);
        let stdout = self.run(args).await?;
        MemberSnapshot::from_json(&stdout)
    }

    async fn member_add(&self, endpoint: &str, name: &str, peer_url: &str) -> Result<()> {
        let args = Self::with_tail(
            self.tls_args(endpoint),
            &["member", "add", name, "--peer-urls", peer_url],
        );
        self.run(args).await.map(|_| ())
    }

    async fn member_remove(&self, endpoint: &str, id: &MemberId) -> Result<()> {
        let hex = format!("{:x}", id);
        let args = Self::with_tail(self.tls_args(endpoint), &["member", "remove", &hex]);
        self.run(args).await.map(|_| ())
    }

    async fn endpoint_health(&self, endpoints: &[String]) -> Result<()> {
        if endpoints.is_empty() {
            return Err(EtcdError::Unhealthy("no endpoints to probe".to_string()));
        }
        let args = Self::with_tail(self.tls_args(&endpoints.join(",")), &["endpoint", "health"]);
        self.run(args)
            .await
            .map(|_| ())
            .map_err(|e| EtcdError::Unhealthy(e.to_string()))
    }

    async fn endpoint_status(&self, endpoints: &[String]) -> Result<Vec<EndpointStatus>> {
        let args = Self::with_tail(
            self.tls_args(&endpoints.join(",")),
            &["-w", "json", "endpoint", "status"],
        );
        let stdout = self.run(args).await?;
        serde_json::from_slice(&stdout).map_err(|e| EtcdError::Parse(e.to_string()))
    }

    async fn snapshot_save(&self, endpoint: &str, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let target = path.display().to_string();
        let args = Self::with_tail(self.tls_args(endpoint), &["snapshot", "save", &target]);
        self.run(args).await.map(|_| ())
    }

    async fn snapshot_restore(&self, request: &RestoreRequest) -> Result<()> {
        let snapshot = request.snapshot.display().to_string();
        let data_dir = request.data_dir.display().to_string();
        let args = vec![
            "snapshot".to_string(),
            "restore".to_string(),
            snapshot,
            "--data-dir".to_string(),
            data_dir,
            "--skip-hash-check=true".to_string(),
            "--name".to_string(),
            request.name.clone(),
            "--initial-cluster".to_string(),
            request.initial_cluster.clone(),
            "--initial-cluster-token".to_string(),
            request.initial_cluster_token.clone(),
            "--initial-advertise-peer-urls".to_string(),
            request.initial_advertise_peer_urls.clone(),
        ];
        self.run(args).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_endpoint_status() {
        let json = r#"[{
            "Endpoint": "https://10.0.0.1:2379",
            "Status": {
                "header": {"cluster_id": 14841639068965178418, "member_id": 10276657743932975437, "revision": 42, "raft_term": 3},
                "version": "3.5.9",
                "dbSize": 20480,
                "leader": 10276657743932975437,
                "raftIndex": 77,
                "raftTerm": 3
            }
        }]"#;

        let status: Vec<EndpointStatus> = serde_json::from_str(json).unwrap();

        assert_eq!(status.len(), 1);
        assert_eq!(status[0].status.version, "3.5.9");
        assert_eq!(status[0].status.db_size, 20480);
        assert!(status[0].is_leader());
    }

    #[test]
    fn test_tls_args_point_at_cert_layout() {
        let ctl = CommandEtcdCtl::new(
            "/usr/local/bin/etcdctl",
            CertLayout::new("/var/lib/plinth/etcd"),
            Duration::from_secs(5),
        );
        let args = ctl.tls_args("https://10.0.0.1:2379");
        assert_eq!(
            args,
            vec![
                "--endpoints",
                "https://10.0.0.1:2379",
                "--cacert",
                "/var/lib/plinth/etcd/cert/server-ca.crt",
                "--cert",
                "/var/lib/plinth/etcd/cert/client.crt",
                "--key",
                "/var/lib/plinth/etcd/cert/client.key",
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_binary_surfaces_io_error() {
        let ctl = CommandEtcdCtl::new(
            "/nonexistent/etcdctl",
            CertLayout::new("/tmp/etcd"),
            Duration::from_secs(1),
        );
        let err = ctl.member_list("https://10.0.0.1:2379").await.unwrap_err();
        assert!(matches!(err, EtcdError::Io(_)));
    }
}
