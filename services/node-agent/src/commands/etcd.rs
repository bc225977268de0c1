//! etcd inspection and recovery commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::{Args, Subcommand};
use plinth_block::Block;
use plinth_etcd::{CertLayout, CommandEtcdCtl, EtcdActor, MembershipPolicy};
use plinth_node::blocks::EtcdBlock;
use plinth_node::{Action, BootstrapRequest, Config, Host, Layout, Role};
use serde::Serialize;

use super::node::{local_host, node_spec, shutdown_context};

#[derive(Debug, Args)]
pub struct EtcdCommand {
    /// Request listing the etcd peers. Defaults to the saved request.
    #[arg(long, global = true)]
    request: Option<PathBuf>,

    #[command(subcommand)]
    command: EtcdSubcommand,
}

#[derive(Debug, Subcommand)]
enum EtcdSubcommand {
    /// Endpoint status of the local member.
    Status,

    /// Current member list.
    Members,

    /// Save a snapshot to a file.
    Snapshot {
        /// Destination file.
        path: PathBuf,
    },

    /// Replace the local data dir with a snapshot and restart etcd as a
    /// single member cluster.
    Restore {
        /// Snapshot file written by `plinth etcd snapshot`.
        snapshot: PathBuf,
    },
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

impl EtcdCommand {
    pub async fn run(self, config: &Config) -> Result<()> {
        let layout = Layout::new(&config.root, &config.etcd_home);
        let path = self.request.unwrap_or_else(|| layout.request_file());
        let request = BootstrapRequest::load(&path)
            .await
            .context("no saved request, pass --request")?;

        match self.command {
            EtcdSubcommand::Status => {
                print_json(&inspector(config, &layout, &request).await?.endpoint_status().await?)
            }
            EtcdSubcommand::Members => {
                print_json(&inspector(config, &layout, &request).await?.member_list().await?)
            }
            EtcdSubcommand::Snapshot { path } => {
                inspector(config, &layout, &request)
                    .await?
                    .snapshot_save(&path)
                    .await?;
                println!("snapshot saved to {}", path.display());
                Ok(())
            }
            EtcdSubcommand::Restore { snapshot } => restore(config, request, snapshot).await,
        }
    }
}

/// An actor that asks the local member first, then every other peer.
async fn inspector(config: &Config, layout: &Layout, request: &BootstrapRequest) -> Result<EtcdActor> {
    let me = match &config.node_ip {
        Some(ip) => ip.clone(),
        None => local_host(config).await?.node_ip().to_string(),
    };
    let mut peers = request.etcd_peers_except(&me);
    peers.insert(0, me.clone());

    let ctl = CommandEtcdCtl::new(
        &config.etcdctl,
        CertLayout::new(layout.etcd_home()),
        config.command_timeout,
    );
    Ok(EtcdActor::new(me, peers, Arc::new(ctl), MembershipPolicy::default()))
}

async fn restore(config: &Config, request: BootstrapRequest, snapshot: PathBuf) -> Result<()> {
    let host = local_host(config).await?;
    let node = node_spec(config, host, Role::ControlPlane, request);
    let ctl = CommandEtcdCtl::new(
        &config.etcdctl,
        CertLayout::new(node.layout.etcd_home()),
        config.command_timeout,
    );
    let block = EtcdBlock::new(
        node.clone(),
        Action::Initialize,
        Arc::new(ctl),
        MembershipPolicy::default(),
    )
    .with_restore(&snapshot);
    block.ensure(&shutdown_context()).await?;

    println!(
        "etcd on {} restored from {}",
        node.host.node_id(),
        snapshot.display()
    );
    Ok(())
}
