//! cacp - peer-replicated coordination agent
//!
//! Negotiates interface contracts between repositories and keeps every
//! agent's copy of the shared state converging.

use std::path::PathBuf;

use cacp::commands;
use cacp::config::CacpPaths;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cacp")]
#[command(author, version, about = "Peer-replicated coordination agent for cross-repository contracts")]
struct Cli {
    /// Override the cacp home directory (default: ~/.cacp)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize cacp (first-time setup)
    Init,

    /// Serve JSON-RPC over HTTP
    Serve {
        /// Address to bind, e.g. 127.0.0.1:8080
        #[arg(short, long)]
        bind: Option<String>,

        /// Agent identifier
        #[arg(long)]
        agent_id: Option<String>,

        /// Name of the repository this agent owns
        #[arg(short, long)]
        repo: Option<String>,

        /// Peer to broadcast to, as <agent-id>=<endpoint> (repeatable)
        #[arg(short, long)]
        peer: Vec<String>,
    },

    /// Serve JSON-RPC over stdin/stdout
    Stdio,

    /// Print the configuration
    Config,

    /// List projects in the saved snapshot
    Projects,
}

fn init_tracing() {
    // stdout carries protocol traffic in stdio mode
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,cacp=debug".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = match cli.home {
        Some(home) => CacpPaths::at(home),
        None => CacpPaths::new()?,
    };

    match cli.command {
        Commands::Init => {
            commands::init(&paths)?;
        }
        Commands::Serve {
            bind,
            agent_id,
            repo,
            peer,
        } => {
            init_tracing();
            let overrides = commands::ServeOverrides {
                bind,
                agent_id,
                repo,
                peers: peer,
            };
            commands::serve(&paths, &overrides).await?;
        }
        Commands::Stdio => {
            init_tracing();
            commands::stdio(&paths).await?;
        }
        Commands::Config => {
            commands::show_config(&paths)?;
        }
        Commands::Projects => {
            commands::projects(&paths)?;
        }
    }

    Ok(())
}
