//! Container runtime provisioner.

use anyhow::Context as _;
use async_trait::async_trait;
use plinth_block::{Block, BlockError, Context};
use tracing::info;

use super::NodeSpec;
use crate::layout::{remove_path, write_file};

const UNIT: &str = "containerd";
const UPSTREAM_REGISTRY: &str = "registry.k8s.io";
const PAUSE_IMAGE: &str = "pause:3.10";

pub struct ContainerdBlock {
    node: NodeSpec,
}

impl ContainerdBlock {
    pub fn new(node: NodeSpec) -> Self {
        Self { node }
    }

    fn registry(&self) -> &str {
        let mirror = self.node.request.registry.trim_end_matches('/');
        if mirror.is_empty() {
            UPSTREAM_REGISTRY
        } else {
            mirror
        }
    }

    /// `/etc/containerd/config.toml`.
    pub fn render_config(&self) -> String {
        let mut config = format!(
            r#"version = 2
root = "/var/lib/containerd"
state = "/run/containerd"
required_plugins = ["io.containerd.grpc.v1.cri"]
oom_score = -999

[grpc]
  address = "/run/containerd/containerd.sock"
  max_recv_message_size = 16777216
  max_send_message_size = 16777216

[plugins."io.containerd.grpc.v1.cri"]
  sandbox_image = "{registry}/{pause}"

  [plugins."io.containerd.grpc.v1.cri".containerd]
    snapshotter = "overlayfs"
    default_runtime_name = "runc"

    [plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc]
      runtime_type = "io.containerd.runc.v2"

      [plugins."io.containerd.grpc.v1.cri".containerd.runtimes.runc.options]
        SystemdCgroup = true
"#,
            registry = self.registry(),
            pause = PAUSE_IMAGE,
        );

        if !self.node.request.registry.is_empty() {
            config.push_str(&format!(
                r#"
[plugins."io.containerd.grpc.v1.cri".registry.mirrors."{upstream}"]
  endpoint = ["https://{mirror}"]
"#,
                upstream = UPSTREAM_REGISTRY,
                mirror = self.registry(),
            ));
        }
        config
    }
}

const CRICTL: &str = "runtime-endpoint: unix:///run/containerd/containerd.sock
image-endpoint: unix:///run/containerd/containerd.sock
timeout: 2
debug: false
pull-image-on-create: false
";

#[async_trait]
impl Block for ContainerdBlock {
    fn name(&self) -> String {
        self.node.block_name("containerd")
    }

    async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
        let layout = &self.node.layout;
        let config = layout.containerd_dir().join("config.toml");
        write_file(&config, self.render_config(), 0o644)
            .await
            .with_context(|| format!("failed to write {}", config.display()))?;
        write_file(&layout.crictl_config(), CRICTL, 0o644)
            .await
            .context("failed to write crictl config")?;

        let service = self.node.host.service();
        service.daemon_reload().await.context("systemctl daemon-reload")?;
        service.enable(UNIT).await.context("systemctl enable containerd")?;
        service.restart(UNIT).await.context("systemctl restart containerd")?;
        info!(registry = %self.registry(), "containerd configured");
        Ok(())
    }

    async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
        let service = self.node.host.service();
        service.disable(UNIT).await.context("systemctl disable containerd")?;
        service.stop(UNIT).await.context("systemctl stop containerd")?;

        for path in [self.node.layout.containerd_dir(), self.node.layout.crictl_config()] {
            info!(path = %path.display(), "removing containerd file");
            remove_path(&path)
                .await
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
