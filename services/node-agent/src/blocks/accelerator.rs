//! NVIDIA container runtime setup. A no-op on nodes without a GPU.

use anyhow::Context as _;
use async_trait::async_trait;
use plinth_block::{Block, BlockError, Context};
use tracing::info;

use super::NodeSpec;
use crate::layout::remove_path;

pub struct AcceleratorBlock {
    node: NodeSpec,
}

impl AcceleratorBlock {
    pub fn new(node: NodeSpec) -> Self {
        Self { node }
    }

    async fn has_device(&self) -> bool {
        tokio::fs::try_exists(self.node.layout.nvidia_device())
            .await
            .unwrap_or(false)
    }
}

#[async_trait]
impl Block for AcceleratorBlock {
    fn name(&self) -> String {
        self.node.block_name("accelerator")
    }

    async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
        if !self.has_device().await {
            info!("no nvidia device, skipping accelerator setup");
            return Ok(());
        }

        self.node
            .run(
                "nvidia-ctk",
                &["runtime", "configure", "--runtime=containerd", "--set-as-default"],
            )
            .await
            .context("configure nvidia containerd runtime")?;
        self.node
            .host
            .service()
            .restart("containerd")
            .await
            .context("systemctl restart containerd")?;
        info!("nvidia runtime set as containerd default");
        Ok(())
    }

    async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
        let dir = self.node.layout.path("/etc/nvidia-container-runtime");
        remove_path(&dir)
            .await
            .with_context(|| format!("failed to remove {}", dir.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::testing;
    use crate::orchestrator::Role;

    #[tokio::test]
    async fn test_without_device_does_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (node, host) = testing::node(dir.path(), Role::Worker, "10.0.0.5", &[]);

        AcceleratorBlock::new(node)
            .ensure(&Context::background())
            .await
            .unwrap();

        assert!(host.calls().is_empty());
    }

    #[tokio::test]
    async fn test_with_device_configures_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let (node, host) = testing::node(dir.path(), Role::Worker, "10.0.0.5", &[]);
        std::fs::create_dir_all(node.layout.path("/dev")).unwrap();
        std::fs::write(node.layout.nvidia_device(), "").unwrap();

        AcceleratorBlock::new(node)
            .ensure(&Context::background())
            .await
            .unwrap();

        assert_eq!(
            host.calls(),
            vec![
                "run nvidia-ctk runtime configure --runtime=containerd --set-as-default",
                "restart containerd",
            ]
        );
    }
}
