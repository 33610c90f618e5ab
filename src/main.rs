mod cli;
mod config;
mod database;
mod deploy;
mod error;
mod nginx;
mod output;
mod secrets;
mod ssh;
mod stage;
mod system;
mod systemd;
mod tls;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};
use error::DeployError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .without_time()
        .init();

    // Ctrl-C drops the operation future, which deletes local temporary files.
    // A host lock held at that point stays until `deckhand unlock`.
    let result = tokio::select! {
        result = dispatch(cli) => result,
        _ = tokio::signal::ctrl_c() => Err(DeployError::Interrupted.into()),
    };

    if let Err(e) = result {
        output::error(&format!("{:#}", e));
        let code = match e.downcast_ref::<DeployError>() {
            Some(DeployError::Interrupted) => 130,
            _ => 1,
        };
        std::process::exit(code);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    let dry_run = cli.dry_run;

    match &cli.command {
        Command::Init => {
            cli::init::run(&cli.config)?;
        }

        Command::Provision { cn } => {
            let config = cli.load_config()?;
            cli::provision::run(config, cn.clone(), dry_run).await?;
        }

        Command::Secrets => {
            let config = cli.load_config()?;
            cli::secrets_cmd::run(config, dry_run).await?;
        }

        Command::BootstrapDatabase => {
            let config = cli.load_config()?;
            cli::database::run(config, dry_run).await?;
        }

        Command::Deploy { mode } => {
            let config = cli.load_config()?;
            cli::deploy::run(config, *mode, dry_run).await?;
        }

        Command::UpgradeCertificate { domain } => {
            let config = cli.load_config()?;
            cli::certificate::run(config, domain.clone(), dry_run).await?;
        }

        Command::Status => {
            let config = cli.load_config()?;
            cli::status::run(config).await?;
        }

        Command::Logs { lines, job } => {
            let config = cli.load_config()?;
            cli::logs::run(config, job.as_deref(), *lines).await?;
        }

        Command::Unlock => {
            let config = cli.load_config()?;
            cli::unlock::run(config).await?;
        }
    }

    Ok(())
}
