//! Cluster credentials signed from the root CA.
//!
//! [`KubeAuthBlock`] writes the admin kubeconfigs and the RBAC that lets
//! bootstrap tokens request node credentials. [`CcmConfigBlock`] stores
//! cloud-controller-manager credentials as a `kube-system` secret.

use anyhow::Context as _;
use async_trait::async_trait;
use plinth_block::{Block, BlockError, Context};
use plinth_pki::{CertPair, CertRequest, ROOT_CA};
use serde_json::{json, Value};
use tracing::info;

use super::NodeSpec;
use crate::bootstrap::ORGANIZATION;
use crate::kubeconfig::{Credentials, Kubeconfig};
use crate::layout::{remove_path, write_file};
use crate::request::API_PORT;

const ADMIN: &str = "kubernetes-admin";
const CCM: &str = "system:cloud-controller-manager";
const CCM_SECRET: &str = "ccm-kubeconfig";
const RBAC_MANIFEST: &str = "plinth-bootstrap-rbac";

/// Sign a client certificate from the root CA and wrap it in a kubeconfig.
fn client_kubeconfig(
    node: &NodeSpec,
    server: String,
    common_name: &str,
    organizations: &[&str],
) -> Result<Kubeconfig, BlockError> {
    let root = node
        .request
        .tls
        .require(ROOT_CA)
        .map_err(|e| BlockError::config(e.to_string()))?;
    let CertPair { key_pem, cert_pem } = node
        .signer
        .sign(root, &CertRequest::client(common_name, organizations))
        .with_context(|| format!("failed to sign {} certificate", common_name))?;

    Ok(Kubeconfig::new(
        server,
        Some(root.cert_pem.clone()),
        Credentials::Certificate { cert_pem, key_pem },
    ))
}

fn binding(name: &str, role: &str, group: &str) -> Value {
    json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": { "name": name },
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "ClusterRole",
            "name": role,
        },
        "subjects": [{
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "Group",
            "name": group,
        }],
    })
}

/// Bootstrap tokens may create and auto-approve node client CSRs; nodes
/// holding a plinth client certificate may read bootstrap requests.
pub fn bootstrap_rbac() -> Value {
    let reader = json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRole",
        "metadata": { "name": "plinth:request-reader" },
        "rules": [{
            "apiGroups": ["plinth.dev"],
            "resources": ["requests"],
            "verbs": ["get"],
        }],
    });
    json!({
        "apiVersion": "v1",
        "kind": "List",
        "items": [
            binding(
                "plinth:kubelet-bootstrap",
                "system:node-bootstrapper",
                "system:bootstrappers",
            ),
            binding(
                "plinth:node-autoapprove-bootstrap",
                "system:certificates.k8s.io:certificatesigningrequests:nodeclient",
                "system:bootstrappers",
            ),
            binding(
                "plinth:node-autoapprove-certificate-rotation",
                "system:certificates.k8s.io:certificatesigningrequests:selfnodeclient",
                "system:nodes",
            ),
            reader,
            binding("plinth:request-reader", "plinth:request-reader", ORGANIZATION),
        ],
    })
}

/// Admin kubeconfigs and bootstrap RBAC.
pub struct KubeAuthBlock {
    node: NodeSpec,
}

impl KubeAuthBlock {
    pub fn new(node: NodeSpec) -> Self {
        Self { node }
    }
}

#[async_trait]
impl Block for KubeAuthBlock {
    fn name(&self) -> String {
        self.node.block_name("kube-auth")
    }

    async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
        let server = format!("https://{}:{}", self.node.host.node_ip(), API_PORT);
        let config = client_kubeconfig(&self.node, server, ADMIN, &["system:masters"])?
            .with_names(&self.node.request.cluster_name, ADMIN);
        let rendered = config.render();

        let layout = &self.node.layout;
        for path in [layout.admin_kubeconfig(), layout.home_kubeconfig()] {
            write_file(&path, &rendered, 0o600)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let manifest = serde_json::to_string_pretty(&bootstrap_rbac())
            .context("failed to render bootstrap RBAC")?;
        self.node
            .kubectl_apply(&layout.admin_kubeconfig(), RBAC_MANIFEST, &manifest)
            .await
            .map_err(|e| BlockError::transient(format!("{:#}", e)))?;

        info!(server = %config.server, "admin credentials written");
        Ok(())
    }

    async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
        let layout = &self.node.layout;
        for path in [
            layout.admin_kubeconfig(),
            layout.home_kubeconfig(),
            layout.manifests_dir().join(format!("{}.yaml", RBAC_MANIFEST)),
        ] {
            remove_path(&path)
                .await
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}

/// cloud-controller-manager credentials as a secret.
pub struct CcmConfigBlock {
    node: NodeSpec,
}

impl CcmConfigBlock {
    pub fn new(node: NodeSpec) -> Self {
        Self { node }
    }

    fn secret(kubeconfig: &str) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "type": "Opaque",
            "metadata": {
                "name": CCM_SECRET,
                "namespace": "kube-system",
            },
            "stringData": { "kubeconfig": kubeconfig },
        })
    }
}

#[async_trait]
impl Block for CcmConfigBlock {
    fn name(&self) -> String {
        self.node.block_name("ccm-config")
    }

    async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
        // The controller manager runs on the control plane host network.
        let server = format!("https://127.0.0.1:{}", API_PORT);
        let kubeconfig = client_kubeconfig(&self.node, server, CCM, &[])?
            .with_names(&self.node.request.cluster_name, CCM)
            .render();

        let manifest = serde_json::to_string_pretty(&Self::secret(&kubeconfig))
            .context("failed to render ccm secret")?;
        self.node
            .kubectl_apply(&self.node.layout.admin_kubeconfig(), CCM_SECRET, &manifest)
            .await
            .map_err(|e| BlockError::transient(format!("{:#}", e)))?;
        info!(secret = CCM_SECRET, "cloud controller credentials stored");
        Ok(())
    }

    async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
        let path = self
            .node
            .layout
            .manifests_dir()
            .join(format!("{}.yaml", CCM_SECRET));
        remove_path(&path)
            .await
            .with_context(|| format!("failed to remove {}", path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing;
    use crate::orchestrator::Role;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;

    fn read_json(path: &std::path::Path) -> Value {
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_admin_kubeconfig_written_twice() {
        let dir = tempfile::tempdir().unwrap();
        let (node, host) = testing::node(dir.path(), Role::ControlPlane, "10.0.0.1", &[]);

        KubeAuthBlock::new(node.clone())
            .ensure(&Context::background())
            .await
            .unwrap();

        let admin = read_json(&node.layout.admin_kubeconfig());
        let home = read_json(&node.layout.home_kubeconfig());
        assert_eq!(admin, home);
        assert_eq!(admin["clusters"][0]["cluster"]["server"], "https://10.0.0.1:6443");
        assert_eq!(admin["current-context"], "kubernetes-admin@kubernetes");

        let cert = admin["users"][0]["user"]["client-certificate-data"]
            .as_str()
            .unwrap();
        let pem = String::from_utf8(STANDARD.decode(cert).unwrap()).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let applies = host.calls_starting_with("run kubectl");
        assert_eq!(applies.len(), 1);
        assert!(applies[0].ends_with("plinth-bootstrap-rbac.yaml"));
    }

    #[tokio::test]
    async fn test_apply_failure_is_transient() {
        let dir = tempfile::tempdir().unwrap();
        let (node, host) = testing::node(dir.path(), Role::ControlPlane, "10.0.0.1", &[]);
        host.script_command("kubectl", vec![Err("connection refused")]);

        let err = KubeAuthBlock::new(node)
            .ensure(&Context::background())
            .await
            .unwrap_err();
        assert!(matches!(err, BlockError::Transient(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn test_purge_removes_kubeconfigs() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _host) = testing::node(dir.path(), Role::ControlPlane, "10.0.0.1", &[]);
        let block = KubeAuthBlock::new(node.clone());
        let ctx = Context::background();

        block.ensure(&ctx).await.unwrap();
        block.purge(&ctx).await.unwrap();
        block.purge(&ctx).await.unwrap();

        assert!(!node.layout.admin_kubeconfig().exists());
        assert!(!node.layout.home_kubeconfig().exists());
    }

    #[test]
    fn test_rbac_binds_bootstrappers() {
        let rbac = bootstrap_rbac();
        let items = rbac["items"].as_array().unwrap();
        let bootstrappers: Vec<&Value> = items
            .iter()
            .filter(|item| item["subjects"][0]["name"] == "system:bootstrappers")
            .collect();
        assert_eq!(bootstrappers.len(), 2);
        assert!(items
            .iter()
            .any(|item| item["subjects"][0]["name"] == ORGANIZATION));
    }

    #[tokio::test]
    async fn test_ccm_secret_points_at_loopback() {
        let dir = tempfile::tempdir().unwrap();
        let (node, _host) = testing::node(dir.path(), Role::ControlPlane, "10.0.0.1", &[]);

        CcmConfigBlock::new(node.clone())
            .ensure(&Context::background())
            .await
            .unwrap();

        let path = node.layout.manifests_dir().join("ccm-kubeconfig.yaml");
        let secret = read_json(&path);
        assert_eq!(secret["metadata"]["namespace"], "kube-system");
        let kubeconfig: Value =
            serde_json::from_str(secret["stringData"]["kubeconfig"].as_str().unwrap()).unwrap();
        assert_eq!(
            kubeconfig["clusters"][0]["cluster"]["server"],
            "https://127.0.0.1:6443"
        );
        assert_eq!(kubeconfig["users"][0]["name"], CCM);
    }
}
