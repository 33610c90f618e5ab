use anyhow::Result;

use crate::config::{DeckhandConfig, DeployMode};
use crate::deploy::Deploy;
use crate::error::DeployError;
use crate::stage::Plan;

pub fn plan(mode: DeployMode) -> Plan {
    Plan::new("deploy").stage(Deploy { mode })
}

pub async fn run(config: DeckhandConfig, mode: Option<DeployMode>, dry_run: bool) -> Result<()> {
    let mode = mode.unwrap_or(config.deploy.mode);
    if mode == DeployMode::Git && config.deploy.repository.is_none() {
        return Err(DeployError::missing(
            "git repository for `--mode git`",
            "set `repository` under [deploy] in deckhand.toml",
        )
        .into());
    }

    super::execute(config, plan(mode), dry_run).await?;
    Ok(())
}
