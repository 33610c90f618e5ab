use anyhow::{Context, Result};

use crate::config::DeckhandConfig;
use crate::ssh::{Remote, SshSession};

pub fn journal_command(config: &DeckhandConfig, job: Option<&str>, lines: usize) -> String {
    let unit = match job {
        Some(job) => format!("{}-{}.service", config.app.name, job),
        None => format!("{}.service", config.app.name),
    };
    format!("journalctl -u {} -n {} --no-pager", unit, lines)
}

pub async fn run(config: DeckhandConfig, job: Option<&str>, lines: usize) -> Result<()> {
    let session = SshSession::connect(&config.host).await?;

    let result = session
        .sudo_exec(&journal_command(&config, job, lines))
        .await
        .context("Failed to read the journal");
    let closed = session.close().await;

    print!("{}", result?);
    closed?;
    Ok(())
}
