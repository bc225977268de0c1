//! Post-install addon manifests.

use std::time::Duration;

use anyhow::Context as _;
use async_trait::async_trait;
use plinth_block::{AggregateError, Block, BlockError, Context};
use tracing::{info, warn};

use super::{NodeSpec, Poll};
use crate::layout::remove_path;

/// A single attempt waits this long for the apiserver; the retry wrapper
/// around the block supplies further attempts.
pub const APISERVER_READY: Poll = Poll::new(Duration::from_secs(2), Duration::from_secs(60));

/// Applies every addon carried by the request once the apiserver answers.
pub struct PostAddonBlock {
    node: NodeSpec,
    wait: Poll,
}

impl PostAddonBlock {
    pub fn new(node: NodeSpec) -> Self {
        Self {
            node,
            wait: APISERVER_READY,
        }
    }

    pub fn with_wait(mut self, wait: Poll) -> Self {
        self.wait = wait;
        self
    }

    async fn wait_apiserver(&self) -> Result<(), BlockError> {
        let kubeconfig = self.node.layout.admin_kubeconfig().display().to_string();
        let kubeconfig = kubeconfig.as_str();
        let node = &self.node;
        self.wait
            .until("apiserver", move || async move {
                node.run("kubectl", &["--kubeconfig", kubeconfig, "get", "--raw", "/healthz"])
                    .await
                    .map(|_| ())
            })
            .await
            .map_err(|e| BlockError::transient(format!("{:#}", e)))
    }
}

#[async_trait]
impl Block for PostAddonBlock {
    fn name(&self) -> String {
        self.node.block_name("post-addon")
    }

    async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
        let addons = &self.node.request.addons;
        if addons.is_empty() {
            info!("no addons requested");
            return Ok(());
        }
        self.wait_apiserver().await?;

        let kubeconfig = self.node.layout.admin_kubeconfig();
        let mut errors = AggregateError::default();
        for addon in addons {
            match self
                .node
                .kubectl_apply(&kubeconfig, &addon.name, &addon.manifest)
                .await
            {
                Ok(()) => info!(addon = %addon.name, "addon applied"),
                Err(e) => {
                    warn!(addon = %addon.name, error = %e, "addon failed");
                    errors.push(BlockError::transient(format!("addon {}: {:#}", addon.name, e)));
                }
            }
        }
        errors.into_result()
    }

    async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
        for addon in &self.node.request.addons {
            let path = self
                .node
                .layout
                .manifests_dir()
                .join(format!("{}.yaml", addon.name));
            remove_path(&path)
                .await
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
