use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use blitz::{cli, config, server};

#[derive(Parser)]
#[command(name = "blitz", version, about = "Conversation task engine for a sports-analytics assistant")]
struct Cli {
    /// Config file (default: ~/.blitz/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP API
    Serve,
    /// Start the MCP server (stdio transport)
    Mcp,
    /// Manage the embedding model
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },
    /// Check database health and configuration
    Doctor,
    /// Look up the closest previously answered question
    Recall {
        question: String,
    },
    /// Seed the recall corpus from a JSON array of {question, query} pairs
    Learn {
        file: PathBuf,
    },
    /// Ask a running server a question and wait for the answer
    Ask {
        question: String,
        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<String>,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Download the embedding model to ~/.blitz/models/
    Download,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::BlitzConfig::load_from(path)?,
        None => config::BlitzConfig::load()?,
    };

    // Log to stderr so stdout stays clean for MCP JSON-RPC and command output.
    // RUST_LOG wins over the configured level when set.
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.server.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => server::serve_http(config).await?,
        Command::Mcp => server::serve_mcp_stdio(config).await?,
        Command::Model { action } => match action {
            ModelAction::Download => cli::model_download(&config.embedding).await?,
        },
        Command::Doctor => cli::doctor::doctor(&config)?,
        Command::Recall { question } => cli::recall::recall(&config, &question).await?,
        Command::Learn { file } => cli::learn::learn(&config, &file).await?,
        Command::Ask { question, conversation } => {
            cli::ask::ask(&config, &question, conversation.as_deref()).await?
        }
    }

    Ok(())
}
