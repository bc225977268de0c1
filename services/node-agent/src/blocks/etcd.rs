//! etcd provisioner.
//!
//! Signs member certificates, then either bootstraps a brand new cluster
//! (initialize) or joins the existing one through the membership actor
//! (join). A node recovering from a snapshot restores its data dir and comes
//! back as a single member cluster. Every path finishes the same way: the unit
//! is rewritten with `--initial-cluster-state=existing` and the current member
//! set, etcd is restarted, and the local endpoint must pass the health gate.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use async_trait::async_trait;
use plinth_block::{Block, BlockError, Context};
use plinth_etcd::{
    flag_value, CertLayout, ClusterState, EtcdActor, EtcdCtl, EtcdError, EtcdUnit, MemberSnapshot,
    MembershipPolicy, DATA_DIR,
};
use tracing::{info, warn};

use super::NodeSpec;
use crate::layout::{remove_path, write_file};
use crate::orchestrator::Action;

const UNIT: &str = "etcd";
const USER: &str = "etcd";
const BINARY: &str = "/usr/local/bin/etcd";

pub struct EtcdBlock {
    node: NodeSpec,
    action: Action,
    ctl: Arc<dyn EtcdCtl>,
    policy: MembershipPolicy,
    restore: Option<PathBuf>,
}

impl EtcdBlock {
    pub fn new(
        node: NodeSpec,
        action: Action,
        ctl: Arc<dyn EtcdCtl>,
        policy: MembershipPolicy,
    ) -> Self {
        Self {
            node,
            action,
            ctl,
            policy,
            restore: None,
        }
    }

    /// Recover from `snapshot` instead of bootstrapping or joining.
    pub fn with_restore(mut self, snapshot: impl Into<PathBuf>) -> Self {
        self.restore = Some(snapshot.into());
        self
    }

    fn me(&self) -> &str {
        self.node.host.node_ip()
    }

    fn certs(&self) -> CertLayout {
        CertLayout::new(self.node.layout.etcd_home())
    }

    /// The genesis node owns the cluster and asks nobody, and so does a
    /// restored one. A joining node talks to every listed peer except itself.
    fn actor(&self) -> EtcdActor {
        let peers = match (self.action, &self.restore) {
            (_, Some(_)) | (Action::Initialize, None) => Vec::new(),
            (Action::Join, None) => self.node.request.etcd_peers_except(self.me()),
        };
        EtcdActor::new(self.me(), peers, self.ctl.clone(), self.policy.clone())
    }

    fn unit(&self, state: ClusterState, initial_cluster: String) -> EtcdUnit {
        EtcdUnit {
            ip: self.me().to_string(),
            arch: self.node.host.arch().to_string(),
            state,
            initial_cluster,
            initial_cluster_token: self.node.request.etcd.init_token.clone(),
            certs: self.certs(),
            binary: PathBuf::from(BINARY),
        }
    }

    /// `--initial-cluster-state` of the unit currently on disk.
    async fn installed_state(&self) -> Option<ClusterState> {
        let text = tokio::fs::read_to_string(self.node.layout.etcd_unit()).await.ok()?;
        match flag_value(&text, "--initial-cluster-state")? {
            "new" => Some(ClusterState::New),
            "existing" => Some(ClusterState::Existing),
            _ => None,
        }
    }

    async fn write_unit(&self, unit: &EtcdUnit) -> Result<(), BlockError> {
        let path = self.node.layout.etcd_unit();
        write_file(&path, unit.render(), 0o644)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(state = %unit.state, initial_cluster = %unit.initial_cluster, "wrote etcd unit");
        Ok(())
    }

    async fn start(&self) -> Result<(), BlockError> {
        let service = self.node.host.service();
        service.daemon_reload().await.context("systemctl daemon-reload")?;
        service.enable(UNIT).await.context("systemctl enable etcd")?;
        service.restart(UNIT).await.context("systemctl restart etcd")?;
        Ok(())
    }

    /// Create the etcd system user and hand it the home directory. Failures
    /// are logged; the user usually exists already.
    async fn ensure_user(&self) {
        let home = self.node.layout.etcd_home().display().to_string();
        let steps: [(&str, Vec<&str>); 3] = [
            ("groupadd", vec!["-f", "-r", USER]),
            (
                "useradd",
                vec!["-r", "-g", USER, "-d", &home, "-s", "/sbin/nologin", USER],
            ),
            ("chown", vec!["-R", "etcd:etcd", &home]),
        ];
        for (program, args) in steps {
            if let Err(e) = self.node.run(program, &args).await {
                warn!(program = %program, error = %e, "etcd user setup step failed");
            }
        }
    }

    /// Start a single member cluster with `--initial-cluster-state=new`.
    async fn bootstrap_cluster(&self, actor: &EtcdActor) -> Result<(), BlockError> {
        if self.installed_state().await == Some(ClusterState::Existing) {
            info!(me = %self.me(), "etcd cluster already bootstrapped");
            return Ok(());
        }

        let initial_cluster = MemberSnapshot::empty().initial_cluster(self.me());
        self.write_unit(&self.unit(ClusterState::New, initial_cluster))
            .await?;
        self.start().await?;
        actor.wait_self_healthy().await.map_err(etcd_error)?;
        info!(me = %self.me(), "bootstrapped new etcd cluster");
        Ok(())
    }

    /// Stop etcd and replace its data dir with the snapshot's contents.
    async fn restore_cluster(&self, actor: &EtcdActor, snapshot: &Path) -> Result<(), BlockError> {
        if !tokio::fs::try_exists(snapshot).await.unwrap_or(false) {
            return Err(BlockError::config(format!(
                "snapshot {} does not exist",
                snapshot.display()
            )));
        }

        self.node
            .host
            .service()
            .stop(UNIT)
            .await
            .context("systemctl stop etcd")?;
        let data_dir = self.node.layout.etcd_home().join(DATA_DIR);
        remove_path(&data_dir)
            .await
            .with_context(|| format!("failed to remove {}", data_dir.display()))?;

        actor
            .snapshot_restore(snapshot, &data_dir, &self.node.request.etcd.init_token)
            .await
            .map_err(etcd_error)?;
        // The restored data dir belongs to whoever ran the restore.
        self.ensure_user().await;
        info!(me = %self.me(), snapshot = %snapshot.display(), "restored etcd snapshot");
        Ok(())
    }

    /// Write the final unit and restart etcd, then wait for the health gate.
    /// An unchanged unit on a member that already answers is left running.
    async fn settle(
        &self,
        actor: &EtcdActor,
        unit: &EtcdUnit,
        force_restart: bool,
    ) -> Result<(), BlockError> {
        let installed = tokio::fs::read_to_string(self.node.layout.etcd_unit())
            .await
            .ok();
        let unchanged = installed.as_deref() == Some(unit.render().as_str());
        if !force_restart && unchanged && self.ctl.endpoint_health(&[actor.endpoint()]).await.is_ok() {
            info!(me = %self.me(), "etcd unit unchanged and member healthy, not restarting");
        } else {
            self.write_unit(unit).await?;
            self.start().await?;
        }
        actor.wait_self_healthy().await.map_err(etcd_error)
    }
}

/// Map membership failures onto the block taxonomy.
fn etcd_error(err: EtcdError) -> BlockError {
    if err.is_config() {
        return BlockError::Config(err.to_string());
    }
    match err {
        EtcdError::ConcurrentJoin { .. } => BlockError::Structural(err.to_string()),
        other => BlockError::Failed(anyhow::Error::new(other)),
    }
}

#[async_trait]
impl Block for EtcdBlock {
    fn name(&self) -> String {
        self.node.block_name("etcd")
    }

    async fn ensure(&self, _ctx: &Context) -> Result<(), BlockError> {
        let ip: IpAddr = self
            .me()
            .parse()
            .map_err(|_| BlockError::config(format!("node ip {} is not an address", self.me())))?;

        self.certs()
            .load_or_sign(
                &self.node.request.tls,
                self.node.signer.as_ref(),
                self.node.host.node_id(),
                ip,
            )
            .await
            .map_err(etcd_error)?;
        self.ensure_user().await;

        let actor = self.actor();
        match (&self.restore, self.action) {
            (Some(snapshot), _) => self.restore_cluster(&actor, snapshot).await?,
            (None, Action::Initialize) => self.bootstrap_cluster(&actor).await?,
            (None, Action::Join) => {
                let outcome = actor.backoff_join().await.map_err(etcd_error)?;
                info!(me = %self.me(), ?outcome, "etcd membership settled");
            }
        }

        let initial_cluster = actor.initial_cluster().await.map_err(etcd_error)?;
        let unit = self.unit(ClusterState::Existing, initial_cluster);
        self.settle(&actor, &unit, self.restore.is_some()).await?;

        info!(me = %self.me(), endpoint = %actor.endpoint(), "etcd is healthy");
        Ok(())
    }

    async fn purge(&self, _ctx: &Context) -> Result<(), BlockError> {
        let peers = self.node.request.etcd_peers_except(self.me());
        if !peers.is_empty() {
            let actor = EtcdActor::new(self.me(), peers, self.ctl.clone(), self.policy.clone());
            let leave = async {
                let members = actor.member_list().await?;
                actor.remove_member(&members.id_of(self.me())).await
            };
            if let Err(e) = leave.await {
                warn!(me = %self.me(), error = %e, "could not leave etcd cluster, purging anyway");
            }
        }

        let service = self.node.host.service();
        service.disable(UNIT).await.context("systemctl disable etcd")?;
        service.stop(UNIT).await.context("systemctl stop etcd")?;

        for path in [
            self.node.layout.etcd_home().to_path_buf(),
            self.node.layout.etcd_unit(),
        ] {
            info!(path = %path.display(), "removing etcd file");
            remove_path(&path)
                .await
                .with_context(|| format!("failed to remove {}", path.display()))?;
        }
        Ok(())
    }
}
