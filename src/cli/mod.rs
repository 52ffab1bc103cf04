//! CLI module: command parsing and dispatch
//!
//! All CLI logic lives here. `main.rs` calls `cli::run()`.

pub mod agent;
pub mod common;
pub mod gateway;
pub mod serve;
pub mod status;

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "picoclaw")]
#[command(version)]
#[command(about = "Ultra-lightweight personal AI assistant", long_about = None)]
struct Cli {
    /// Path to an alternative config file
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent engine with the network bus server and heartbeat
    Serve,
    /// Interactive chat; attaches to a running engine when one is reachable
    Gateway,
    /// Process one message and print the reply
    Agent {
        /// Message to process
        #[arg(short, long)]
        message: String,
        /// Session key (`channel:chat_id`)
        #[arg(short, long, default_value = "cli:direct")]
        session: String,
    },
    /// Show configuration and engine connectivity
    Status,
    /// Show version information
    Version,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = common::load_config(cli.config.as_deref())?;
    picoclaw::utils::logging::init_logging(&config.logging);

    match cli.command {
        None => {
            let mut cmd = Cli::command();
            cmd.print_help()?;
            println!();
        }
        Some(Commands::Serve) => {
            serve::cmd_serve(config).await?;
        }
        Some(Commands::Gateway) => {
            gateway::cmd_gateway(config).await?;
        }
        Some(Commands::Agent { message, session }) => {
            agent::cmd_agent(config, message, session).await?;
        }
        Some(Commands::Status) => {
            status::cmd_status(config).await?;
        }
        Some(Commands::Version) => {
            cmd_version();
        }
    }

    Ok(())
}

fn cmd_version() {
    println!("picoclaw {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Ultra-lightweight personal AI assistant");
}
