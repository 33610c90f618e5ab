use anyhow::Result;

use crate::config::DeckhandConfig;
use crate::database::DatabaseBootstrap;
use crate::stage::Plan;

pub fn plan() -> Plan {
    Plan::new("bootstrap-database").stage(DatabaseBootstrap)
}

pub async fn run(config: DeckhandConfig, dry_run: bool) -> Result<()> {
    super::execute(config, plan(), dry_run).await?;
    Ok(())
}
