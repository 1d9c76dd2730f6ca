use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use spaghettihub::config::{AppConfig, DEFAULT_CONFIG_FILE};

mod cmd;

#[derive(Parser)]
#[command(name = "spaghettihub")]
#[command(version, about = "Self-hosted runner and Launchpad porting orchestrator for GitHub")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,

    /// SQLite database path. Overrides the config file and environment.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the webhook server and the workflow engine
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Permissive CORS for a locally served UI
        #[arg(long)]
        dev: bool,
    },
    /// Create the database schema
    InitDb,
    /// Show the state of a porting request
    WorkStatus {
        /// Request UUID returned when the porting was requested
        request_uuid: String,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration with secrets redacted
    Show,
    /// Validate configuration and list problems
    Validate,
}

impl Cli {
    /// Config file, then environment, then flags.
    pub fn load_config(&self) -> Result<AppConfig> {
        let mut config = AppConfig::resolve(&self.config)?;
        if let Some(db_path) = &self.db_path {
            config.database.path = db_path.clone();
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = cli.load_config()?;

    match &cli.command {
        Commands::Serve { host, port, dev } => {
            if let Some(host) = host {
                config.server.host = host.clone();
            }
            if let Some(port) = port {
                config.server.port = *port;
            }
            config.server.dev_mode |= *dev;
            let _guard = spaghettihub::logging::init_logging(&config.logging, cli.verbose);
            cmd::cmd_serve(config).await?;
        }
        Commands::InitDb => cmd::cmd_init_db(&config)?,
        Commands::WorkStatus { request_uuid } => {
            cmd::cmd_work_status(&config, request_uuid).await?
        }
        Commands::Config { command } => cmd::cmd_config(&cli.config, &config, command.clone())?,
    }

    Ok(())
}
