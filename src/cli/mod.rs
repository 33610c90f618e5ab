use clap::{Parser, Subcommand};
use std::path::PathBuf;

use anyhow::Result;

use crate::config::{DeckhandConfig, DeployMode, HostOverrides};
use crate::output;
use crate::ssh::SshSession;
use crate::stage::executor::Report;
use crate::stage::{Context, Executor, Plan, StageOutcome};

pub mod certificate;
pub mod database;
pub mod deploy;
pub mod init;
pub mod logs;
pub mod provision;
pub mod secrets_cmd;
pub mod status;
pub mod unlock;

#[derive(Parser)]
#[command(
    name = "deckhand",
    version,
    about = "Provision a host and deploy a Django/ASGI app behind nginx and systemd"
)]
pub struct Cli {
    /// Path to deckhand.toml
    #[arg(short, long, default_value = "deckhand.toml", global = true)]
    pub config: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Host address, overriding [host] address
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// SSH user, overriding [host] user
    #[arg(long, global = true)]
    pub user: Option<String>,

    /// SSH port, overriding [host] port
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// SSH private key, overriding [host] identity
    #[arg(long, global = true)]
    pub identity: Option<String>,

    /// Report what would change without changing anything
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    pub fn overrides(&self) -> HostOverrides {
        HostOverrides {
            address: self.host.clone(),
            user: self.user.clone(),
            port: self.port,
            identity: self.identity.clone(),
        }
    }

    pub fn load_config(&self) -> Result<DeckhandConfig> {
        DeckhandConfig::load(&self.config, &self.overrides())
    }
}

#[derive(Subcommand)]
pub enum Command {
    /// Scaffold deckhand.toml in the current directory
    Init,

    /// Prepare the host: packages, service account, TLS, nginx, systemd, jobs
    Provision {
        /// Common name for the bootstrap certificate
        #[arg(long)]
        cn: Option<String>,
    },

    /// Generate and install the application's secret bundle
    Secrets,

    /// Create the local PostgreSQL role and database
    BootstrapDatabase,

    /// Push code, migrate, collect static files, and restart
    Deploy {
        /// How code reaches the host (defaults to [deploy] mode)
        #[arg(long, value_enum)]
        mode: Option<DeployMode>,
    },

    /// Switch nginx to a CA-issued certificate for a domain
    UpgradeCertificate {
        /// Domain the certificate was issued for
        #[arg(long)]
        domain: String,
    },

    /// Show what is in place on the host
    Status,

    /// Show application logs from the journal
    Logs {
        /// Number of lines
        #[arg(short = 'n', long, default_value = "100")]
        lines: usize,
        /// Scheduled job name instead of the application
        #[arg(long)]
        job: Option<String>,
    },

    /// Remove a lock left behind by an interrupted operation
    Unlock,
}

/// Connect, run the plan, and print a summary
pub async fn execute(config: DeckhandConfig, plan: Plan, dry_run: bool) -> Result<Report> {
    output::header(&format!(
        "{} {} on {}{}",
        plan.operation,
        config.app.name,
        config.host.address,
        if dry_run { " (dry run)" } else { "" }
    ));

    let session = SshSession::connect(&config.host).await?;
    let result = {
        let ctx = Context::new(config, &session);
        Executor::new(&ctx, dry_run).run(&plan).await
    };
    let closed = session.close().await;

    let report = result?;
    closed?;

    summarize(&report, dry_run);
    Ok(report)
}

fn summarize(report: &Report, dry_run: bool) {
    let count = |f: fn(&StageOutcome) -> bool| report.iter().filter(|(_, o)| f(o)).count();
    let applied = count(|o| matches!(o, StageOutcome::Applied));
    let would = count(|o| matches!(o, StageOutcome::WouldApply));
    let satisfied = count(|o| matches!(o, StageOutcome::AlreadySatisfied));
    let skipped = count(|o| matches!(o, StageOutcome::NotApplicable(_)));

    println!();
    if dry_run {
        output::info(&format!(
            "{} would change, {} in place, {} not applicable",
            would, satisfied, skipped
        ));
    } else {
        output::success(&format!(
            "{} applied, {} already in place, {} not applicable",
            applied, satisfied, skipped
        ));
    }
}
