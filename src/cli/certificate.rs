use anyhow::Result;

use crate::config::DeckhandConfig;
use crate::stage::Plan;
use crate::tls::UpgradeCertificate;

pub fn plan(domain: String) -> Plan {
    Plan::new("upgrade-certificate").stage(UpgradeCertificate { domain })
}

pub async fn run(config: DeckhandConfig, domain: String, dry_run: bool) -> Result<()> {
    super::execute(config, plan(domain), dry_run).await?;
    Ok(())
}
