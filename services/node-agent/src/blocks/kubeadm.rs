//! kubeadm init and join.
//!
//! Control plane components are bootstrapped by kubeadm itself; these
//! blocks only prepare its input and run it. Init points the apiserver at
//! the node's own etcd member. Join registers a worker through the
//! bootstrap token and waits until the kubelet can list nodes.

use anyhow::Context as _;
use async_trait::async_trait;
use plinth_block::{Block, BlockError, Context};
use plinth_etcd::{advertise, CertLayout, CLIENT_PORT};
use serde_json::{json, Value};
use tracing::{info, warn};

use super::kubelet::install_ca;
use super::{NodeSpec, Poll, APISERVER_WAIT};
use crate::layout::write_file;
use crate::request::API_PORT;

const KUBELET: &str = "kubelet";
const KUBEADM_API: &str = "kubeadm.k8s.io/v1beta3";
const CRI_SOCKET: &str = "unix:///run/containerd/containerd.sock";

/// `v1.31.1` from either `1.31.1` or `v1.31.1`.
fn kubernetes_version(version: &str) -> String {
    if version.starts_with('v') {
        version.to_string()
    } else {
        format!("v{}", version)
    }
}

/// daemon-reload, enable and restart kubelet. kubeadm expects it running.
async fn start_kubelet(node: &NodeSpec) -> Result<(), BlockError> {
    let service = node.host.service();
    service.daemon_reload().await.context("systemctl daemon-reload")?;
    service.enable(KUBELET).await.context("systemctl enable kubelet")?;
    service.restart(KUBELET).await.context("systemctl restart kubelet")?;
    Ok(())
}

/// `kubeadm reset --force`. Failures are logged; a node that never ran
/// kubeadm has nothing to reset.
async fn reset(node: &NodeSpec) {
    if let Err(e) = node.run("kubeadm", &["reset", "--force"]).await {
        warn!(error = %e, "kubeadm reset failed");
    }
}

/// First control plane node: `kubeadm init` against external etcd.
pub struct InitBlock {
    node: NodeSpec,
}

impl InitBlock {
    pub fn new(node: NodeSpec) -> Self {
        Self { node }
    }

    fn init_configuration(&self) -> Value {
        let host = &self.node.host;
        json!({
            "apiVersion": KUBEADM_API,
            "kind": "InitConfiguration",
            "bootstrapTokens": [{
                "token": self.node.request.token,
                "ttl": "0s",
                "usages": ["signing", "authentication"],
                "groups": ["system:bootstrappers:kubeadm:default-node-token"],
            }],
            "localAPIEndpoint": {
                "advertiseAddress": host.node_ip(),
                "bindPort": API_PORT,
            },
            "nodeRegistration": {
                "name": host.node_id(),
                "criSocket": CRI_SOCKET,
            },
        })
    }

    fn cluster_configuration(&self) -> Value {
        let request = &self.node.request;
        let certs = CertLayout::new(self.node.layout.etcd_home());
        let mut config = json!({
            "apiVersion": KUBEADM_API,
            "kind": "ClusterConfiguration",
            "clusterName": request.cluster_name,
            "kubernetesVersion": kubernetes_version(&request.kubernetes.version),
            "controlPlaneEndpoint": request.access_point.endpoint(),
            "networking": {
                "dnsDomain": "cluster.local",
                "podSubnet": request.kubernetes.pod_cidr,
                "serviceSubnet": request.kubernetes.service_cidr,
            },
            "apiServer": {
                "certSANs": request.sans,
            },
            "etcd": {
                "external": {
                    "endpoints": [advertise(self.node.host.node_ip(), CLIENT_PORT)],
                    "caFile": certs.server_ca().display().to_string(),
                    "certFile": certs.client_cert().display().to_string(),
                    "keyFile": certs.client_key().display().to_string(),
                },
            },
        });
        if !request.registry.is_empty() {
            config["imageRepository"] = json!(request.registry);
        }
        config
    }

    /// Both documents, `---` separated. kubeadm reads JSON documents.
    pub fn render_config(&self) -> String {
        [self.init_configuration(), self.cluster_configuration()]
            .iter()
            .map(|doc| serde_json::to_string_pretty(doc).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\n---\n")
    }

    async fn initialized(&self) -> bool {
        let admin = self.node.layout.kubernetes_dir().join("admin.conf");
        tokio::fs::try_exists(admin).await.unwrap_or(false)
    }
}

#[async_trait]
impl Block for InitBlock {
    fn name(&self) -> String {
        self.node.block_name("kubeadm-init")
    }

    async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
        let path = self.node.layout.kubeadm_config();
        write_file(&path, self.render_config(), 0o600)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        if self.initialized().await {
            info!("control plane already initialized");
            return Ok(());
        }

        install_ca(&self.node).await?;
        start_kubelet(&self.node).await?;

        let config = format!("--config={}", path.display());
        self.node
            .run(
                "kubeadm",
                &[
                    "init",
                    "--ignore-preflight-errors=all",
                    &config,
                    "--skip-token-print",
                    "--v=6",
                ],
            )
            .await
            .context("kubeadm init")?;
        info!(endpoint = %self.node.request.access_point.endpoint(), "control plane initialized");
        Ok(())
    }

    async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
        reset(&self.node).await;
        Ok(())
    }
}

/// Worker registration through `kubeadm join`.
pub struct JoinBlock {
    node: NodeSpec,
    wait: Poll,
}

impl JoinBlock {
    pub fn new(node: NodeSpec) -> Self {
        Self {
            node,
            wait: APISERVER_WAIT,
        }
    }

    pub fn with_wait(mut self, wait: Poll) -> Self {
        self.wait = wait;
        self
    }

    async fn joined(&self) -> bool {
        tokio::fs::try_exists(self.node.layout.kubelet_kubeconfig())
            .await
            .unwrap_or(false)
    }

    async fn kubeadm_join(&self) -> Result<(), BlockError> {
        let request = &self.node.request;
        let endpoint = request.access_point.endpoint();
        self.node
            .run(
                "kubeadm",
                &[
                    "join",
                    "--v=6",
                    "--ignore-preflight-errors=all",
                    "--node-name",
                    self.node.host.node_id(),
                    "--token",
                    &request.token,
                    "--discovery-token-unsafe-skip-ca-verification",
                    &endpoint,
                ],
            )
            .await
            .map_err(|e| BlockError::transient(format!("kubeadm join {}: {:#}", endpoint, e)))?;
        Ok(())
    }

    /// Poll until the kubelet credentials can list nodes.
    async fn wait_join(&self) -> Result<(), BlockError> {
        let kubeconfig = self.node.layout.kubelet_kubeconfig().display().to_string();
        let kubeconfig = kubeconfig.as_str();
        let node = &self.node;
        self.wait
            .until("node registration", move || async move {
                node.run("kubectl", &["--kubeconfig", kubeconfig, "get", "nodes"])
                    .await
                    .map(|_| ())
            })
            .await
            .map_err(|e| BlockError::transient(format!("{:#}", e)))
    }
}

#[async_trait]
impl Block for JoinBlock {
    fn name(&self) -> String {
        self.node.block_name("kubeadm-join")
    }

    async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
        if self.node.request.token.is_empty() {
            return Err(BlockError::config("kubeadm join needs a bootstrap token"));
        }

        start_kubelet(&self.node).await?;
        if self.joined().await {
            info!("kubelet credentials present, skipping kubeadm join");
        } else {
            self.kubeadm_join().await?;
        }
        self.wait_join().await?;
        info!(endpoint = %self.node.request.access_point.endpoint(), "node joined");
        Ok(())
    }

    async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
        reset(&self.node).await;
        Ok(())
    }
}
