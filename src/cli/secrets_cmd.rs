use anyhow::Result;

use crate::config::DeckhandConfig;
use crate::output;
use crate::secrets::{Secrets, Terminal};
use crate::stage::Plan;

pub fn plan() -> Plan {
    Plan::new("secrets").stage(Secrets::new(Terminal))
}

pub async fn run(config: DeckhandConfig, dry_run: bool) -> Result<()> {
    let env_file = config.layout().env_file;
    super::execute(config, plan(), dry_run).await?;
    if !dry_run {
        output::info(&format!(
            "Secrets live only in {} on the host; keep a copy somewhere safe",
            env_file
        ));
    }
    Ok(())
}
