use anyhow::{Context as _, Result};
use tracing::{debug, warn};

use crate::error::DeployError;
use crate::nginx;
use crate::output;
use crate::secrets::bundle::generate_token;
use crate::ssh::remote::sudo;
use crate::stage::Context;
use crate::systemd;

use super::archive::Archive;

pub const TOTAL_STEPS: usize = 7;

/// Step 1 (archive): unpack into a fresh staging tree next to the live one.
/// Returns the staging directory.
pub async fn upload_archive(ctx: &Context<'_>, archive: &Archive) -> Result<String> {
    output::step(1, TOTAL_STEPS, "Uploading code archive");
    let l = &ctx.layout;
    let next = l.code_next();
    let staging = format!("/tmp/deckhand-{}-{}.tar.gz", l.app, generate_token(12));

    let unpacked = match ctx
        .remote
        .transfer(archive.file.path(), &staging)
        .await
        .context("Failed to upload code archive")
    {
        Ok(()) => ctx
            .remote
            .sudo_exec(&format!(
                "rm -rf {next} && install -d -m 750 -o {user} -g {user} {next} && \
                 tar -xzf {staging} -C {next} --no-same-owner && chown -R {user}:{user} {next} && rm -f {staging}",
                next = next,
                user = l.service_user,
                staging = staging
            ))
            .await
            .context("Failed to unpack code archive"),
        Err(e) => Err(e),
    };
    if let Err(e) = unpacked {
        if let Err(cleanup) = ctx.remote.exec(&format!("rm -f {}", staging)).await {
            warn!("Could not remove {}: {:#}", staging, cleanup);
        }
        return Err(e);
    }

    output::success(&format!("{} entries unpacked into {}", archive.entries, next));
    Ok(next)
}

fn as_service(ctx: &Context<'_>, cmd: &str) -> String {
    format!("runuser -u {} -- {}", ctx.layout.service_user, cmd)
}

async fn checkout_revision(ctx: &Context<'_>) -> Result<String> {
    let rev = ctx
        .remote
        .sudo_exec(&as_service(
            ctx,
            &format!("git -C {} rev-parse --short HEAD", ctx.layout.code),
        ))
        .await?;
    Ok(rev.trim().to_string())
}

/// Step 1 (git): clone once, then only ever fast-forward. Returns the
/// checked-out revision.
pub async fn update_checkout(ctx: &Context<'_>) -> Result<String> {
    output::step(1, TOTAL_STEPS, "Updating git checkout");
    let l = &ctx.layout;
    let deploy = &ctx.config.deploy;
    let repository = deploy.repository.as_deref().ok_or_else(|| {
        DeployError::missing(
            "git repository for git mode",
            "set `repository` under [deploy] in deckhand.toml",
        )
    })?;

    // the code tree is only traversable by its owner, so look as root
    if ctx
        .remote
        .sudo_exec_ok(&format!("test -d {}/.git", l.code))
        .await?
    {
        let before = checkout_revision(ctx).await?;
        ctx.remote
            .sudo_exec(&format!(
                "cd {code} && {fetch} && {merge}",
                code = l.code,
                fetch = as_service(ctx, &format!("git fetch --quiet origin {}", deploy.branch)),
                merge = as_service(ctx, "git merge --ff-only --quiet FETCH_HEAD"),
            ))
            .await
            .with_context(|| {
                format!(
                    "Could not fast-forward {} to origin/{}; the checkout has diverged from the remote branch",
                    l.code, deploy.branch
                )
            })?;
        let after = checkout_revision(ctx).await?;
        if before == after {
            output::satisfied(&format!("Already at {}", after));
        } else {
            output::success(&format!("Fast-forwarded {} -> {}", before, after));
        }
        return Ok(after);
    }

    ctx.remote
        .sudo_exec(&format!(
            "rm -rf {code} && {clone}",
            code = l.code,
            clone = as_service(
                ctx,
                &format!(
                    "git clone --quiet --branch {} {} {}",
                    deploy.branch, repository, l.code
                )
            ),
        ))
        .await
        .with_context(|| format!("Failed to clone {}", repository))?;
    ctx.remote
        .sudo_exec(&format!("chown -R {user}:{user} {}", l.code, user = l.service_user))
        .await?;

    let rev = checkout_revision(ctx).await?;
    output::success(&format!("Cloned {} at {}", repository, rev));
    Ok(rev)
}

/// Step 2
pub async fn ensure_venv(ctx: &Context<'_>) -> Result<()> {
    output::step(2, TOTAL_STEPS, "Checking virtualenv");
    let venv = &ctx.layout.venv;

    if ctx
        .remote
        .sudo_exec_ok(&format!("test -x {}/bin/python", venv))
        .await?
    {
        output::satisfied(&format!("{} exists", venv));
        return Ok(());
    }

    ctx.remote
        .sudo_exec(&as_service(ctx, &format!("python3 -m venv {}", venv)))
        .await
        .context("Failed to create virtualenv")?;
    output::success(&format!("Created {}", venv));
    Ok(())
}

/// Step 3
pub async fn install_requirements(ctx: &Context<'_>, workdir: &str) -> Result<()> {
    output::step(3, TOTAL_STEPS, "Installing Python dependencies");
    let pip = format!("{}/bin/pip", ctx.layout.venv);

    let spinner = output::create_spinner("pip install -r requirements.txt...");
    let result = ctx
        .remote
        .sudo_exec(&format!(
            "cd {} && {} && {}",
            workdir,
            as_service(ctx, &format!("{} install --quiet --upgrade pip", pip)),
            as_service(ctx, &format!("{} install --quiet -r requirements.txt", pip))
        ))
        .await;
    spinner.finish_and_clear();
    result.context("Failed to install requirements")?;

    output::success("Dependencies installed");
    Ok(())
}

/// Step 4
pub async fn migrate(ctx: &Context<'_>, workdir: &str) -> Result<()> {
    output::step(4, TOTAL_STEPS, "Applying database migrations");
    let out = ctx
        .remote
        .sudo_exec(&ctx.manage_py(workdir, "migrate --noinput"))
        .await
        .context("Migrations failed; the running application was not touched")?;
    debug!("migrate: {}", out.trim());
    output::success("Migrations applied");
    Ok(())
}

/// Step 5
pub async fn collectstatic(ctx: &Context<'_>, workdir: &str) -> Result<()> {
    output::step(5, TOTAL_STEPS, "Collecting static files");
    ctx.remote
        .sudo_exec(&ctx.manage_py(workdir, "collectstatic --noinput"))
        .await
        .context("collectstatic failed; the running application was not touched")?;
    output::success(&format!("Static files in {}", ctx.layout.static_root));
    Ok(())
}

/// Swap the staging tree in for the live one
pub async fn promote(ctx: &Context<'_>) -> Result<()> {
    let l = &ctx.layout;
    ctx.remote
        .sudo_exec(&format!(
            "rm -rf {prev} && if [ -d {code} ]; then mv {code} {prev}; fi && mv {next} {code} && rm -rf {prev}",
            prev = l.code_prev(),
            code = l.code,
            next = l.code_next()
        ))
        .await
        .context("Failed to swap in the new code tree")?;
    Ok(())
}

/// Step 6
pub async fn restart(ctx: &Context<'_>) -> Result<()> {
    output::step(6, TOTAL_STEPS, "Restarting application");
    systemd::restart(ctx).await?;
    systemd::timers::start(ctx).await?;
    output::success(&format!("{} restarted", ctx.layout.service_name()));
    Ok(())
}

/// Step 7
pub async fn reload_proxy(ctx: &Context<'_>) -> Result<()> {
    output::step(7, TOTAL_STEPS, "Reloading nginx");
    let test = ctx.remote.run(&sudo("nginx -t 2>&1")).await?;
    if !test.success() {
        return Err(DeployError::ValidationFailure {
            what: "nginx configuration".to_string(),
            diagnostic: format!("{}{}", test.stdout.trim(), test.stderr.trim()),
        }
        .into());
    }
    nginx::reload(ctx).await?;
    output::success("nginx reloaded");
    Ok(())
}
