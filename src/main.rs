mod api;
mod client;
mod commands;
mod config;
mod domain;
mod error;
mod server;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "meshmon",
    version,
    about = "Mesh network node monitor: polls topology feeds, tracks node state, announces changes"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the meshmon daemon (feed polling + REST API)
    Daemon {
        /// HTTP listen address (overrides config)
        #[arg(long)]
        http_addr: Option<String>,

        /// Log level (overrides config)
        #[arg(long)]
        log_level: Option<String>,

        /// Path to config file (default: ~/.config/meshmon/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Registry database path (overrides config)
        #[arg(long)]
        db_path: Option<String>,
    },

    /// Query a meshmon daemon's REST API
    Query {
        /// Daemon base URL (defaults to http://127.0.0.1:9280)
        #[arg(long, global = true)]
        url: Option<String>,

        /// Output format (text or json)
        #[arg(long, global = true, default_value = "text")]
        format: String,

        #[command(subcommand)]
        command: commands::query::QueryCommands,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon {
            http_addr,
            log_level,
            config,
            db_path,
        } => commands::daemon::run(http_addr, log_level, config, db_path),
        Commands::Query {
            url,
            format,
            command,
        } => commands::query::run(url.as_deref(), &format, &command),
    }
}
