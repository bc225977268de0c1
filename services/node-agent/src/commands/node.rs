//! Node provisioning commands.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Args;
use plinth_block::Context;
use plinth_etcd::{CertLayout, CommandEtcdCtl, MembershipPolicy};
use plinth_node::{
    Action, BootstrapClient, BootstrapPolicy, BootstrapRequest, Config, Host, Layout, LocalHost,
    NodeSpec, Orchestrator, Provisioners, Role,
};
use plinth_pki::RcgenSigner;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Args)]
pub struct NodeArgs {
    /// Node role. Defaults to control-plane for init and worker for join.
    #[arg(long, short = 'r', value_enum)]
    role: Option<Role>,

    /// Apiserver address (host:port) used for the bootstrap exchange.
    #[arg(long, env = "PLINTH_APISERVER")]
    apiserver: Option<String>,

    /// Bootstrap token.
    #[arg(long, env = "PLINTH_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Read the bootstrap request from this file instead of the apiserver.
    #[arg(long)]
    request: Option<PathBuf>,

    /// Name of the cluster's request object.
    #[arg(long, default_value = "kubernetes")]
    cluster: String,
}

#[derive(Debug, Args)]
pub struct DestroyArgs {
    #[arg(long, short = 'r', value_enum, default_value = "control-plane")]
    role: Role,

    /// Request to tear down. Defaults to the one saved by init or join.
    #[arg(long)]
    request: Option<PathBuf>,
}

/// A context cancelled on Ctrl-C. Running blocks finish, later stages
/// are skipped.
pub(super) fn shutdown_context() -> Context {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping after the current stage");
            let _ = tx.send(true);
        }
    });
    Context::new(rx)
}

pub(super) async fn local_host(config: &Config) -> Result<Arc<LocalHost>> {
    let host = LocalHost::detect(
        config.node_id.clone(),
        config.node_ip.clone(),
        config.command_timeout,
    )
    .await?;
    Ok(Arc::new(host))
}

pub(super) fn node_spec(
    config: &Config,
    host: Arc<LocalHost>,
    role: Role,
    request: BootstrapRequest,
) -> NodeSpec {
    NodeSpec {
        request: Arc::new(request),
        host,
        layout: Layout::new(&config.root, &config.etcd_home),
        role,
        signer: Arc::new(RcgenSigner),
    }
}

fn provisioners(config: &Config, node: &NodeSpec, action: Action) -> Provisioners {
    let ctl = CommandEtcdCtl::new(
        &config.etcdctl,
        CertLayout::new(node.layout.etcd_home()),
        config.command_timeout,
    );
    Provisioners::new(node, action, Arc::new(ctl), MembershipPolicy::default())
}

/// Read `--request`, or run the bootstrap exchange against the apiserver.
async fn load_request(args: &NodeArgs, node_id: &str, layout: &Layout) -> Result<BootstrapRequest> {
    if let Some(path) = &args.request {
        let mut request = BootstrapRequest::load(path).await?;
        if let Some(token) = &args.token {
            request.token = token.clone();
        }
        return Ok(request);
    }

    let (Some(apiserver), Some(token)) = (&args.apiserver, &args.token) else {
        bail!("either --request or both --apiserver and --token are required");
    };
    let client = BootstrapClient::new(apiserver, token, BootstrapPolicy::default())?;
    let mut request = client
        .bootstrap(node_id, &args.cluster, &layout.bootstrap_kubeconfig())
        .await
        .with_context(|| format!("bootstrap exchange with {} failed", client.base_url()))?;
    if request.token.is_empty() {
        request.token = token.clone();
    }
    Ok(request)
}

pub async fn provision(config: &Config, action: Action, args: NodeArgs) -> Result<()> {
    let role = args.role.unwrap_or(match action {
        Action::Initialize => Role::ControlPlane,
        Action::Join => Role::Worker,
    });
    let host = local_host(config).await?;
    let layout = Layout::new(&config.root, &config.etcd_home);

    let request = load_request(&args, host.node_id(), &layout)
        .await?
        .with_node_defaults(host.node_ip());
    match role {
        Role::ControlPlane => request.validate_control_plane()?,
        Role::Worker => request.validate()?,
    }

    info!(%action, %role, node_id = %host.node_id(), node_ip = %host.node_ip(), "provisioning node");
    let node = node_spec(config, host, role, request);
    let orchestrator = Orchestrator::new(action, &node, provisioners(config, &node, action));
    orchestrator.ensure_node(&shutdown_context()).await?;

    println!("node {} is ready as {}", node.host.node_id(), role);
    Ok(())
}

pub async fn destroy(config: &Config, args: DestroyArgs) -> Result<()> {
    let host = local_host(config).await?;
    let layout = Layout::new(&config.root, &config.etcd_home);
    let path = args.request.unwrap_or_else(|| layout.request_file());
    let request = BootstrapRequest::load(&path)
        .await
        .context("no saved request, pass --request")?;

    let node = node_spec(config, host, args.role, request);
    let orchestrator = Orchestrator::new(Action::Join, &node, provisioners(config, &node, Action::Join));
    orchestrator.destroy_node(&shutdown_context()).await?;

    println!("node {} destroyed", node.host.node_id());
    Ok(())
}
