//! Core API Gateway - OIDC-protected lifecycle API for mobile-network Cores

use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error, info};

use coreapi_gateway::{
    auth::policy::PolicyEnforcer,
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // A missing .env file is normal; anything else is worth reporting later
    let dotenv = dotenvy::from_path(&cli.env_file);

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match dotenv {
        Ok(()) => info!(path = %cli.env_file.display(), "Loaded env file"),
        Err(e) if e.not_found() => debug!(path = %cli.env_file.display(), "No env file"),
        Err(e) => error!(path = %cli.env_file.display(), error = %e, "Failed to load env file"),
    }

    match cli.command {
        Some(Command::CheckConfig) => check_config(&cli).await,
        Some(Command::Serve) | None => run_server(&cli).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }
    Ok(config)
}

/// Validate configuration and policy files, then print the effective settings
async fn check_config(cli: &Cli) -> ExitCode {
    match render_checked_config(cli).await {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Configuration invalid: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn render_checked_config(cli: &Cli) -> anyhow::Result<String> {
    let config = load_config(cli)?;
    let enforcer = PolicyEnforcer::from_files(&config.rbac.model, &config.rbac.policy).await?;
    let yaml = serde_yaml::to_string(&config)?;
    Ok(format!("{yaml}# rbac rules loaded: {}", enforcer.rule_count()))
}

async fn run_server(cli: &Cli) -> ExitCode {
    let config = match load_config(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        "Starting Core API gateway"
    );

    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
