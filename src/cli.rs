//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Core lifecycle API behind an OIDC login gateway
#[derive(Parser, Debug)]
#[command(name = "coreapi-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "COREAPI_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "COREAPI_HOST")]
    pub host: Option<String>,

    /// Dotenv file loaded before configuration is read
    #[arg(long, default_value = ".env", global = true)]
    pub env_file: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "COREAPI_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "COREAPI_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load and validate configuration, then print the effective settings
    CheckConfig,
}
