use std::io::Write as _;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::output;
use crate::stage::Context as StageContext;

use super::bundle::{generate_token, SecretBundle};

/// Place the bundle at the env file path, owned by the service identity with
/// mode 0600. Values travel only inside the transferred file; the local copy
/// is removed when this returns, on success or not.
pub async fn distribute(ctx: &StageContext<'_>, bundle: &SecretBundle) -> Result<()> {
    let l = &ctx.layout;

    let mut local = tempfile::Builder::new()
        .prefix("deckhand-env-")
        .tempfile()
        .context("Failed to create local temp file for the secret bundle")?;
    local
        .write_all(bundle.render().as_bytes())
        .context("Failed to write secret bundle")?;
    local.flush()?;

    let staging = format!("/tmp/deckhand-{}-{}.env", l.app, generate_token(12));

    // from here on the staging path may hold secret bytes, whole or partial
    let placed = match ctx
        .remote
        .transfer(local.path(), &staging)
        .await
        .context("Failed to transfer secret bundle")
    {
        Ok(()) => ctx
            .remote
            .sudo_exec(&format!(
                "install -m 600 -o {user} -g {user} {staging} {env}.new && mv -f {env}.new {env} && rm -f {staging}",
                user = l.service_user,
                staging = staging,
                env = l.env_file
            ))
            .await
            .map(|_| ())
            .context("Failed to install secret bundle"),
        Err(e) => Err(e),
    };
    if let Err(e) = placed {
        discard_staging(ctx, &staging).await;
        return Err(e);
    }

    verify(ctx, bundle).await?;

    info!("Secret bundle installed, sha256 {}", bundle.fingerprint());
    output::success(&format!("Secrets written to {}", l.env_file));
    Ok(())
}

async fn discard_staging(ctx: &StageContext<'_>, staging: &str) {
    if let Err(e) = ctx.remote.exec(&format!("rm -f {}", staging)).await {
        warn!("Could not remove staging file {}: {:#}", staging, e);
    }
}

async fn verify(ctx: &StageContext<'_>, bundle: &SecretBundle) -> Result<()> {
    let l = &ctx.layout;

    let stat = ctx
        .remote
        .sudo_exec(&format!("stat -c %a:%U {}", l.env_file))
        .await?;
    let expected = format!("600:{}", l.service_user);
    if stat.trim() != expected {
        bail!(
            "{} has mode/owner {} (expected {})",
            l.env_file,
            stat.trim(),
            expected
        );
    }

    let sum = ctx
        .remote
        .sudo_exec(&format!("sha256sum {}", l.env_file))
        .await?;
    let remote_digest = sum.split_whitespace().next().unwrap_or_default();
    if remote_digest != bundle.fingerprint() {
        bail!(
            "{} does not match the bundle that was sent (sha256 {})",
            l.env_file,
            remote_digest
        );
    }

    Ok(())
}
