//! CLI commands.

mod etcd;
mod node;

use anyhow::Result;
use clap::{Parser, Subcommand};
use plinth_node::{logging, Action, Config};

/// plinth - bootstrap a Kubernetes node.
#[derive(Debug, Parser)]
#[command(name = "plinth")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, env = "PLINTH_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log format (json or text).
    #[arg(long, global = true, env = "PLINTH_LOG_FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Initialize a new cluster on this node.
    Init(node::NodeArgs),

    /// Join this node to an existing cluster.
    Join(node::NodeArgs),

    /// Tear down everything plinth installed on this node.
    Destroy(node::DestroyArgs),

    /// Inspect the local etcd member.
    Etcd(etcd::EtcdCommand),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let mut config = Config::from_env()?;
        if let Some(level) = self.log_level {
            config.log_level = level;
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        logging::init(&config.log_level, &config.log_format);

        match self.command {
            Commands::Init(args) => node::provision(&config, Action::Initialize, args).await,
            Commands::Join(args) => node::provision(&config, Action::Join, args).await,
            Commands::Destroy(args) => node::destroy(&config, args).await,
            Commands::Etcd(cmd) => cmd.run(&config).await,
        }
    }
}
