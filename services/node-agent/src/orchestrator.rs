//! Plan assembly and execution.
//!
//! The orchestrator turns an (action, role) pair into a flat list of
//! blocks and drives it through [`run_blocks`]:
//!
//! ```text
//! control plane: prepare{etcd, containerd, kubelet} -> accelerator -> kubeadm-init
//!                -> kube-auth -> addons{ccm-config, post-addon}
//! worker:        prepare{containerd, kubelet} -> accelerator -> kubeadm-join
//! ```
//!
//! The action only changes how the etcd member comes up: `initialize`
//! starts a new cluster, `join` enters the existing one. A worker has no
//! etcd member, so `initialize` on a worker is rejected.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::ValueEnum;
use plinth_block::{
    purge_blocks, run_blocks, with_default_retry, Block, BlockError, ConcurrentBlock, Context,
};
use plinth_etcd::{EtcdCtl, MembershipPolicy};
use tracing::info;

use crate::blocks::{
    AcceleratorBlock, CcmConfigBlock, ContainerdBlock, EtcdBlock, InitBlock, JoinBlock,
    KubeAuthBlock, KubeletBlock, NodeSpec, PostAddonBlock,
};
use crate::layout::write_file;
use crate::request::BootstrapRequest;

/// What the node does with etcd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Start a new cluster.
    #[value(alias = "init")]
    Initialize,
    /// Enter an existing cluster.
    Join,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialize => f.write_str("initialize"),
            Self::Join => f.write_str("join"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    #[value(alias = "master")]
    ControlPlane,
    Worker,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlPlane => f.write_str("control-plane"),
            Self::Worker => f.write_str("worker"),
        }
    }
}

/// Every provisioner the orchestrator may schedule, constructed up front.
///
/// Fields are public so callers can substitute their own blocks.
#[derive(Clone)]
pub struct Provisioners {
    pub etcd: Arc<dyn Block>,
    pub containerd: Arc<dyn Block>,
    pub kubelet: Arc<dyn Block>,
    pub accelerator: Arc<dyn Block>,
    pub init: Arc<dyn Block>,
    pub join: Arc<dyn Block>,
    pub kube_auth: Arc<dyn Block>,
    pub ccm: Arc<dyn Block>,
    pub addons: Arc<dyn Block>,
}

impl Provisioners {
    /// The standard provisioners for `node`. Blocks that wait on the
    /// apiserver are wrapped in the default retry.
    pub fn new(
        node: &NodeSpec,
        action: Action,
        ctl: Arc<dyn EtcdCtl>,
        policy: MembershipPolicy,
    ) -> Self {
        Self {
            etcd: Arc::new(EtcdBlock::new(node.clone(), action, ctl, policy)),
            containerd: Arc::new(ContainerdBlock::new(node.clone())),
            kubelet: Arc::new(KubeletBlock::new(node.clone())),
            accelerator: Arc::new(AcceleratorBlock::new(node.clone())),
            init: Arc::new(InitBlock::new(node.clone())),
            join: with_default_retry(Arc::new(JoinBlock::new(node.clone()))),
            kube_auth: with_default_retry(Arc::new(KubeAuthBlock::new(node.clone()))),
            ccm: with_default_retry(Arc::new(CcmConfigBlock::new(node.clone()))),
            addons: with_default_retry(Arc::new(PostAddonBlock::new(node.clone()))),
        }
    }
}

pub struct Orchestrator {
    action: Action,
    role: Role,
    provisioners: Provisioners,
    request: Arc<BootstrapRequest>,
    request_file: PathBuf,
}

impl Orchestrator {
    pub fn new(action: Action, node: &NodeSpec, provisioners: Provisioners) -> Self {
        Self {
            action,
            role: node.role,
            provisioners,
            request: node.request.clone(),
            request_file: node.layout.request_file(),
        }
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// The ordered stages for this node.
    pub fn plan(&self) -> Result<Vec<Arc<dyn Block>>, BlockError> {
        let p = &self.provisioners;
        match (self.role, self.action) {
            (Role::ControlPlane, _) => Ok(vec![
                Arc::new(ConcurrentBlock::new(
                    "prepare",
                    vec![p.etcd.clone(), p.containerd.clone(), p.kubelet.clone()],
                )),
                p.accelerator.clone(),
                p.init.clone(),
                p.kube_auth.clone(),
                Arc::new(ConcurrentBlock::new(
                    "addons",
                    vec![p.ccm.clone(), p.addons.clone()],
                )),
            ]),
            (Role::Worker, Action::Join) => Ok(vec![
                Arc::new(ConcurrentBlock::new(
                    "prepare",
                    vec![p.containerd.clone(), p.kubelet.clone()],
                )),
                p.accelerator.clone(),
                p.join.clone(),
            ]),
            (Role::Worker, Action::Initialize) => Err(BlockError::config(
                "a worker cannot initialize a cluster, use join",
            )),
        }
    }

    /// Teardown order. etcd goes last so the other blocks can still reach
    /// it while unwinding.
    pub fn purge_plan(&self) -> Vec<Arc<dyn Block>> {
        let p = &self.provisioners;
        let kubeadm = match self.role {
            Role::ControlPlane => p.init.clone(),
            Role::Worker => p.join.clone(),
        };
        vec![
            kubeadm,
            p.kube_auth.clone(),
            p.kubelet.clone(),
            p.accelerator.clone(),
            p.containerd.clone(),
            p.etcd.clone(),
        ]
    }

    /// Run the plan, then record the request the node was built from.
    pub async fn ensure_node(&self, ctx: &Context) -> Result<(), BlockError> {
        let plan = self.plan()?;
        info!(
            action = %self.action,
            role = %self.role,
            stages = plan.len(),
            "ensuring node"
        );
        run_blocks(&plan, ctx).await?;
        self.save_request().await?;
        info!(action = %self.action, role = %self.role, "node ready");
        Ok(())
    }

    pub async fn destroy_node(&self, ctx: &Context) -> Result<(), BlockError> {
        info!(role = %self.role, "destroying node");
        purge_blocks(&self.purge_plan(), ctx).await?;
        info!(role = %self.role, "node destroyed");
        Ok(())
    }

    async fn save_request(&self) -> Result<(), BlockError> {
        let json = self.request.to_json()?;
        write_file(&self.request_file, json, 0o600)
            .await
            .with_context(|| format!("failed to save request to {}", self.request_file.display()))?;
        Ok(())
    }
}
