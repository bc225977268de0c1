//! Leaf provisioners.
//!
//! Each block drives one piece of the node (etcd, container runtime,
//! kubelet, ...) toward its installed state through the [`Host`]
//! abstraction, writing files under the node [`Layout`].

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use plinth_pki::Signer;
use tokio::time::Instant;
use tracing::debug;

use crate::host::Host;
use crate::layout::{write_file, Layout};
use crate::orchestrator::Role;
use crate::request::BootstrapRequest;

mod accelerator;
mod addons;
mod auth;
mod containerd;
mod etcd;
mod kubeadm;
mod kubelet;

pub use accelerator::AcceleratorBlock;
pub use addons::PostAddonBlock;
pub use auth::{CcmConfigBlock, KubeAuthBlock};
pub use containerd::ContainerdBlock;
pub use etcd::EtcdBlock;
pub use kubeadm::{InitBlock, JoinBlock};
pub use kubelet::KubeletBlock;

/// Interval and deadline for waiting on the kubeadm join and the apiserver.
pub const APISERVER_WAIT: Poll = Poll::new(Duration::from_secs(2), Duration::from_secs(5 * 60));

/// Everything a provisioner knows about the node it runs on.
#[derive(Clone)]
pub struct NodeSpec {
    pub request: Arc<BootstrapRequest>,
    pub host: Arc<dyn Host>,
    pub layout: Layout,
    pub role: Role,
    pub signer: Arc<dyn Signer>,
}

impl NodeSpec {
    /// `name [node-id]`, the naming used for every block.
    pub fn block_name(&self, name: &str) -> String {
        format!("{} [{}]", name, self.host.node_id())
    }

    /// Run a command on the host, `args` given as string slices.
    pub async fn run(&self, program: &str, args: &[&str]) -> Result<String> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.host.command(program, &args).await
    }

    /// Write `manifest` to the manifests directory and `kubectl apply` it.
    pub async fn kubectl_apply(&self, kubeconfig: &Path, name: &str, manifest: &str) -> Result<()> {
        let file = self.layout.manifests_dir().join(format!("{}.yaml", name));
        write_file(&file, manifest, 0o600)
            .await
            .with_context(|| format!("failed to write manifest {}", file.display()))?;

        let kubeconfig = kubeconfig.display().to_string();
        let file = file.display().to_string();
        self.run("kubectl", &["--kubeconfig", &kubeconfig, "apply", "-f", &file])
            .await
            .with_context(|| format!("failed to apply {}", name))?;
        Ok(())
    }
}

/// Fixed-interval polling with a deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Poll {
    pub interval: Duration,
    pub deadline: Duration,
}

impl Poll {
    pub const fn new(interval: Duration, deadline: Duration) -> Self {
        Self { interval, deadline }
    }

    /// Call `check` until it succeeds. Past the deadline the last error is
    /// returned with `what` attached.
    pub async fn until<F, Fut>(&self, what: &str, mut check: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let started = Instant::now();
        loop {
            let err = match check().await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            if started.elapsed() + self.interval > self.deadline {
                return Err(err.context(format!("timed out after {:?} waiting for {}", self.deadline, what)));
            }
            debug!(error = %err, "waiting for {}", what);
            tokio::time::sleep(self.interval).await;
        }
    }
}
