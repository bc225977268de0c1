//! Kubelet configuration.
//!
//! Writes the kubelet unit and, on control plane nodes, the cluster CA
//! material kubeadm expects in `/etc/kubernetes/pki`. kubelet is left
//! stopped; kubeadm starts it during init or join.

use anyhow::Context as _;
use async_trait::async_trait;
use plinth_block::{Block, BlockError, Context};
use plinth_pki::{FRONT_PROXY_CA, ROOT_CA, SERVICE_ACCOUNT};
use tracing::{debug, info};

use super::NodeSpec;
use crate::layout::{remove_path, write_file};
use crate::orchestrator::Role;
use crate::request::cidr_ip;

const UNIT: &str = "kubelet";
const CLUSTER_DOMAIN: &str = "cluster.local";

/// Certificates kubeadm regenerates from the CAs on every init.
const STALE: [&str; 6] = [
    "apiserver.crt",
    "apiserver.key",
    "apiserver-kubelet-client.crt",
    "apiserver-kubelet-client.key",
    "front-proxy-client.crt",
    "front-proxy-client.key",
];

/// CA files for `/etc/kubernetes/pki`, `(file name, contents, mode)`.
fn ca_files(node: &NodeSpec) -> Result<Vec<(&'static str, String, u32)>, BlockError> {
    let tls = &node.request.tls;
    let root = tls
        .require(ROOT_CA)
        .map_err(|e| BlockError::config(e.to_string()))?;

    let mut files = vec![
        ("ca.crt", root.cert_pem.clone(), 0o644),
        ("ca.key", root.key_pem.clone(), 0o600),
    ];
    if let Some(front) = tls.get(FRONT_PROXY_CA) {
        files.push(("front-proxy-ca.crt", front.cert_pem.clone(), 0o644));
        files.push(("front-proxy-ca.key", front.key_pem.clone(), 0o600));
    }
    if let Some(sa) = tls.get(SERVICE_ACCOUNT) {
        files.push(("sa.key", sa.key_pem.clone(), 0o600));
        files.push(("sa.pub", sa.cert_pem.clone(), 0o644));
    }
    Ok(files)
}

/// Write the cluster CAs kubeadm signs from and drop the leaf
/// certificates it must regenerate. Shared with control plane init.
pub(super) async fn install_ca(node: &NodeSpec) -> Result<(), BlockError> {
    let pki = node.layout.pki_dir();
    for (name, contents, mode) in ca_files(node)? {
        let path = pki.join(name);
        write_file(&path, contents, mode)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
    }
    for name in STALE {
        let path = pki.join(name);
        remove_path(&path)
            .await
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    debug!(dir = %pki.display(), "installed cluster CA material");
    Ok(())
}

pub struct KubeletBlock {
    node: NodeSpec,
}

impl KubeletBlock {
    pub fn new(node: NodeSpec) -> Self {
        Self { node }
    }

    pub fn render_unit(&self, cluster_dns: &str) -> String {
        let host = &self.node.host;
        let flags = [
            "--bootstrap-kubeconfig=/etc/kubernetes/bootstrap-kubelet.conf".to_string(),
            "--kubeconfig=/etc/kubernetes/kubelet.conf".to_string(),
            "--config=/var/lib/kubelet/config.yaml".to_string(),
            "--container-runtime-endpoint=unix:///run/containerd/containerd.sock".to_string(),
            format!("--node-ip={}", host.node_ip()),
            format!("--hostname-override={}", host.node_id()),
            format!("--cluster-dns={}", cluster_dns),
            format!("--cluster-domain={}", CLUSTER_DOMAIN),
            format!("--node-labels=plinth.dev/role={}", self.node.role),
        ];
        format!(
            "[Unit]
Description=kubelet: The Kubernetes Node Agent
Documentation=https://kubernetes.io/docs/
After=containerd.service
Wants=containerd.service

[Service]
EnvironmentFile=-/var/lib/kubelet/kubeadm-flags.env
ExecStart=/usr/local/bin/kubelet {} $KUBELET_KUBEADM_ARGS
StartLimitInterval=0
Restart=always
RestartSec=10

[Install]
WantedBy=multi-user.target
",
            flags.join(" ")
        )
    }
}

#[async_trait]
impl Block for KubeletBlock {
    fn name(&self) -> String {
        self.node.block_name("kubelet")
    }

    async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
        match self.node.role {
            Role::ControlPlane => install_ca(&self.node).await?,
            Role::Worker => debug!("worker node, kubeadm join fetches the CA"),
        }

        let service_cidr = &self.node.request.kubernetes.service_cidr;
        let cluster_dns = cidr_ip(service_cidr, 10)
            .map_err(|e| BlockError::config(format!("cluster dns from {}: {}", service_cidr, e)))?;

        let unit = self.node.layout.kubelet_unit();
        write_file(&unit, self.render_unit(&cluster_dns.to_string()), 0o644)
            .await
            .with_context(|| format!("failed to write {}", unit.display()))?;

        let service = self.node.host.service();
        service.daemon_reload().await.context("systemctl daemon-reload")?;
        service.stop(UNIT).await.context("systemctl stop kubelet")?;
        info!(cluster_dns = %cluster_dns, role = %self.node.role, "kubelet configured");
        Ok(())
    }

    async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
        let service = self.node.host.service();
        service.disable(UNIT).await.context("systemctl disable kubelet")?;
        service.stop(UNIT).await.context("systemctl stop kubelet")?;

        let layout = &self.node.layout;
        for path in [
            layout.kubelet_unit(),
            layout.kubelet_state(),
            layout.kubernetes_dir(),
            layout.kubeadm_dir(),
        ] {
            info!(path = %path.display(), "removing kubelet file");
            remove_path(&path)
                .await
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing;
    use plinth_etcd::flag_value;

    #[tokio::test]
    async fn test_control_plane_installs_ca() {
        let dir = tempfile::tempdir().unwrap();
        let (node, host) = testing::node(dir.path(), Role::ControlPlane, "10.0.0.1", &[]);
        let stale = node.layout.pki_dir().join("apiserver.crt");
        std::fs::create_dir_all(node.layout.pki_dir()).unwrap();
        std::fs::write(&stale, "old").unwrap();

        KubeletBlock::new(node.clone())
            .ensure(&Context::background())
            .await
            .unwrap();

        let pki = node.layout.pki_dir();
        for name in ["ca.crt", "ca.key", "front-proxy-ca.crt", "sa.key", "sa.pub"] {
            assert!(pki.join(name).exists(), "{} missing", name);
        }
        assert!(!stale.exists());
        assert_eq!(host.calls(), vec!["daemon-reload", "stop kubelet"]);
    }

    #[tokio::test]
    async fn test_unit_uses_tenth_service_address() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _host) = testing::node(dir.path(), Role::Worker, "10.0.0.7", &[]);

        KubeletBlock::new(node.clone())
            .ensure(&Context::background())
            .await
            .unwrap();

        let unit = std::fs::read_to_string(node.layout.kubelet_unit()).unwrap();
        assert_eq!(flag_value(&unit, "--cluster-dns"), Some("10.96.0.10"));
        assert_eq!(flag_value(&unit, "--node-ip"), Some("10.0.0.7"));
        assert_eq!(flag_value(&unit, "--node-labels"), Some("plinth.dev/role=worker"));
        assert!(!node.layout.pki_dir().exists());
    }

    #[tokio::test]
    async fn test_control_plane_without_root_ca_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (mut node, _host) = testing::node(dir.path(), Role::ControlPlane, "10.0.0.1", &[]);
        let mut request = (*node.request).clone();
        request.tls = plinth_pki::CaMaterial::new();
        node.request = std::sync::Arc::new(request);

        let err = KubeletBlock::new(node)
            .ensure(&Context::background())
            .await
            .unwrap_err();
        assert!(err.is_config());
    }
}
