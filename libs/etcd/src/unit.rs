//! systemd unit for the local etcd member.

use std::fmt;
use std::path::PathBuf;

use crate::certs::CertLayout;
use crate::member::{advertise, member_name, CLIENT_PORT, PEER_PORT};

/// Data directory, relative to the unit's working directory.
pub const DATA_DIR: &str = "data.etcd";

/// Value of `--initial-cluster-state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterState {
    /// Cluster genesis. Only the initializing node ever uses it.
    New,
    Existing,
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("new"),
            Self::Existing => f.write_str("existing"),
        }
    }
}

/// Everything needed to render `etcd.service`.
#[derive(Debug, Clone)]
pub struct EtcdUnit {
    pub ip: String,
    pub arch: String,
    pub state: ClusterState,
    pub initial_cluster: String,
    pub initial_cluster_token: String,
    pub certs: CertLayout,
    pub binary: PathBuf,
}

impl EtcdUnit {
    /// `--flag=value` pairs in the order they appear on `ExecStart`.
    pub fn flags(&self) -> Vec<(&'static str, String)> {
        let cert = |name: &str| self.certs.file(name).display().to_string();
        vec![
            ("--name", member_name(&self.ip)),
            ("--data-dir", DATA_DIR.to_string()),
            ("--initial-cluster-token", self.initial_cluster_token.clone()),
            ("--initial-cluster", self.initial_cluster.clone()),
            ("--initial-cluster-state", self.state.to_string()),
            ("--initial-advertise-peer-urls", advertise(&self.ip, PEER_PORT)),
            ("--listen-peer-urls", advertise(&self.ip, PEER_PORT)),
            ("--advertise-client-urls", advertise(&self.ip, CLIENT_PORT)),
            ("--listen-client-urls", advertise(&self.ip, CLIENT_PORT)),
            ("--election-timeout", "3000".to_string()),
            ("--heartbeat-interval", "500".to_string()),
            ("--snapshot-count", "50000".to_string()),
            ("--client-cert-auth", "true".to_string()),
            ("--trusted-ca-file", cert("server-ca.crt")),
            ("--cert-file", cert("server.crt")),
            ("--key-file", cert("server.key")),
            ("--peer-client-cert-auth", "true".to_string()),
            ("--peer-trusted-ca-file", cert("peer-ca.crt")),
            ("--peer-cert-file", cert("peer.crt")),
            ("--peer-key-file", cert("peer.key")),
        ]
    }

    pub fn render(&self) -> String {
        let mut lines = vec![
            "[Unit]".to_string(),
            "Description=etcd service".to_string(),
            "After=network.target".to_string(),
            String::new(),
            "[Service]".to_string(),
            format!("WorkingDirectory={}", self.certs.home().display()),
            "User=etcd".to_string(),
        ];
        if self.arch != "amd64" {
            lines.push(format!("Environment=\"ETCD_UNSUPPORTED_ARCH={}\"", self.arch));
        }

        let flags: Vec<String> = self
            .flags()
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        lines.push(format!(
            "ExecStart={} {}",
            self.binary.display(),
            flags.join(" ")
        ));
        lines.extend(
            [
                "LimitNOFILE=65536",
                "Restart=always",
                "RestartSec=15s",
                "OOMScoreAdjust=-999",
                "",
                "[Install]",
                "WantedBy=multi-user.target",
            ]
            .map(String::from),
        );
        let mut text = lines.join("\n");
        text.push('\n');
        text
    }
}

/// Read a flag value back out of a rendered unit.
pub fn flag_value<'a>(unit: &'a str, flag: &str) -> Option<&'a str> {
    let prefix = format!("{}=", flag);
    unit.lines()
        .find(|line| line.starts_with("ExecStart="))?
        .split_whitespace()
        .find_map(|word| word.strip_prefix(prefix.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(arch: &str, state: ClusterState) -> EtcdUnit {
        EtcdUnit {
            ip: "10.0.0.1".to_string(),
            arch: arch.to_string(),
            state,
            initial_cluster: "etcd-10.0.0.1.member=https://10.0.0.1:2380".to_string(),
            initial_cluster_token: "tok".to_string(),
            certs: CertLayout::new("/var/lib/plinth/etcd"),
            binary: PathBuf::from("/usr/local/bin/etcd"),
        }
    }

    #[test]
    fn test_render_genesis_unit() {
        let text = unit("amd64", ClusterState::New).render();

        assert!(text.starts_with("[Unit]\n"));
        assert!(!text.contains("ETCD_UNSUPPORTED_ARCH"));
        assert_eq!(flag_value(&text, "--initial-cluster-state"), Some("new"));
        assert_eq!(
            flag_value(&text, "--initial-cluster"),
            Some("etcd-10.0.0.1.member=https://10.0.0.1:2380")
        );
        assert_eq!(
            flag_value(&text, "--listen-client-urls"),
            Some("https://10.0.0.1:2379")
        );
        assert_eq!(
            flag_value(&text, "--peer-cert-file"),
            Some("/var/lib/plinth/etcd/cert/peer.crt")
        );
        assert!(text.contains("WorkingDirectory=/var/lib/plinth/etcd\n"));
    }

    #[test]
    fn test_non_amd64_sets_unsupported_arch() {
        let text = unit("arm64", ClusterState::Existing).render();
        assert!(text.contains("Environment=\"ETCD_UNSUPPORTED_ARCH=arm64\""));
        assert_eq!(flag_value(&text, "--initial-cluster-state"), Some("existing"));
    }

    #[test]
    fn test_render_is_stable() {
        let a = unit("amd64", ClusterState::Existing).render();
        let b = unit("amd64", ClusterState::Existing).render();
        assert_eq!(a, b);
    }
}
