use anyhow::Result;

use crate::config::DeckhandConfig;
use crate::database::DatabaseBootstrap;
use crate::deploy::record::DeployRecord;
use crate::nginx::Proxy;
use crate::output;
use crate::secrets::{Secrets, Terminal};
use crate::ssh::{Remote, SshSession};
use crate::stage::lock::HostLock;
use crate::stage::{Context, Executor, Plan};
use crate::system::{Identity, Packages};
use crate::systemd::{Jobs, Supervision};
use crate::tls::BootstrapCertificate;

/// Every stage that has a state on the host, in the order operations run them
pub fn plan() -> Plan {
    Plan::new("status")
        .stage(Packages)
        .stage(Identity)
        .stage(BootstrapCertificate { common_name: None })
        .stage(Proxy)
        .stage(Supervision)
        .stage(Jobs)
        .stage(Secrets::new(Terminal))
        .stage(DatabaseBootstrap)
}

pub async fn run(config: DeckhandConfig) -> Result<()> {
    output::header(&format!("{} on {}", config.app.name, config.host.address));

    let session = SshSession::connect(&config.host).await?;
    let result = report(config, &session).await;
    let closed = session.close().await;
    result?;
    closed?;
    Ok(())
}

async fn report(config: DeckhandConfig, remote: &dyn Remote) -> Result<()> {
    let ctx = Context::new(config, remote);

    // dry run: checks only, apply never runs and nothing prompts
    Executor::new(&ctx, true).run(&plan()).await?;

    println!();
    match DeployRecord::read(&ctx).await? {
        Some(record) => {
            output::info(&format!(
                "Deployed {} ({} mode) at {}",
                record.revision,
                record.mode.as_str(),
                record.deployed_at
            ));
            if let Some(previous) = record.previous_revision {
                output::info(&format!("Previous revision {}", previous));
            }
        }
        None => output::info("Never deployed"),
    }

    if let Some(holder) = HostLock::holder(remote, &ctx.layout.app).await? {
        output::warning(&format!("Locked by {}", holder.describe()));
    }
    Ok(())
}
