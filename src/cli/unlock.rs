use anyhow::Result;
use dialoguer::Confirm;

use crate::config::DeckhandConfig;
use crate::output;
use crate::ssh::SshSession;
use crate::stage::lock::HostLock;

pub async fn run(config: DeckhandConfig) -> Result<()> {
    let session = SshSession::connect(&config.host).await?;
    let app = config.app.name.clone();

    let result = async {
        if let Some(holder) = HostLock::holder(&session, &app).await? {
            output::warning(&format!("Lock held by {}", holder.describe()));
            let confirmed = Confirm::new()
                .with_prompt("Remove it? Only do this if that operation is no longer running")
                .default(false)
                .interact()?;
            if !confirmed {
                output::info("Lock left in place");
                return Ok(());
            }
        }

        if HostLock::force_release(&session, &app).await? {
            output::success(&format!("Removed {}", HostLock::path_for(&app)));
        } else {
            output::info("No lock held");
        }
        anyhow::Ok(())
    }
    .await;

    let closed = session.close().await;
    result?;
    closed?;
    Ok(())
}
