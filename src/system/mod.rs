//! OS packages and the service identity.

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::database;
use crate::error::DeployError;
use crate::output;
use crate::stage::{Context, Precondition, Stage, StageId};

const BASE_PACKAGES: &[&str] = &[
    "nginx",
    "python3",
    "python3-venv",
    "python3-pip",
    "python3-dev",
    "build-essential",
    "libpq-dev",
    "git",
    "openssl",
    "curl",
];

pub fn package_list(ctx: &Context<'_>) -> Vec<String> {
    let mut packages: Vec<String> = BASE_PACKAGES.iter().map(|p| p.to_string()).collect();

    // An unset host is asked for later and defaults to local
    let local_db = ctx
        .config
        .database
        .host
        .as_deref()
        .map_or(true, database::is_local);
    if local_db {
        packages.push("postgresql".to_string());
    }

    for extra in &ctx.config.deploy.extra_packages {
        if !packages.contains(extra) {
            packages.push(extra.clone());
        }
    }
    packages
}

pub async fn packages_installed(ctx: &Context<'_>) -> Result<bool> {
    ctx.remote
        .exec_ok(&format!(
            "dpkg -s {} > /dev/null 2>&1",
            package_list(ctx).join(" ")
        ))
        .await
}

pub struct Packages;

#[async_trait]
impl Stage for Packages {
    fn id(&self) -> StageId {
        StageId::Packages
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition> {
        Ok(Precondition::from_bool(packages_installed(ctx).await?))
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        if !ctx.remote.exec_ok("command -v apt-get").await? {
            return Err(DeployError::missing(
                format!("apt-get on {}", ctx.remote.host()),
                "deckhand provisions Debian and Ubuntu hosts only",
            )
            .into());
        }

        let packages = package_list(ctx).join(" ");
        output::info(&format!("Installing {}", packages));
        let spinner = output::create_spinner("Installing packages...");

        let result = ctx
            .remote
            .sudo_exec(&format!(
                "export DEBIAN_FRONTEND=noninteractive && apt-get update -qq && apt-get install -y -qq {}",
                packages
            ))
            .await;
        spinner.finish_and_clear();
        result.context("Failed to install OS packages")?;

        output::success("Packages installed");
        Ok(())
    }
}

fn identity_check(ctx: &Context<'_>) -> String {
    let l = &ctx.layout;
    format!(
        "id -u {user} > /dev/null 2>&1 && test -d {base} && test -d {static_root} && test -d {media} && test -d {env_dir} \
         && [ \"$(stat -c %U {base})\" = {user} ] && id -nG www-data | grep -qw {user}",
        user = l.service_user,
        base = l.base,
        static_root = l.static_root,
        media = l.media_root,
        env_dir = l.env_dir
    )
}

pub async fn identity_present(ctx: &Context<'_>) -> Result<bool> {
    ctx.remote.sudo_exec_ok(&identity_check(ctx)).await
}

/// System account, its group, and the directory tree it owns
pub struct Identity;

#[async_trait]
impl Stage for Identity {
    fn id(&self) -> StageId {
        StageId::Identity
    }

    fn requires(&self) -> &'static [StageId] {
        &[StageId::Packages]
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition> {
        Ok(Precondition::from_bool(identity_present(ctx).await?))
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        let l = &ctx.layout;
        let user = &l.service_user;

        let exists = ctx
            .remote
            .exec_ok(&format!("id -u {} > /dev/null 2>&1", user))
            .await?;
        if exists {
            output::satisfied(&format!("Account {} already exists", user));
        } else {
            ctx.remote
                .sudo_exec(&format!(
                    "useradd --system --user-group --home-dir {} --no-create-home --shell /usr/sbin/nologin {}",
                    l.base, user
                ))
                .await
                .with_context(|| format!("Failed to create service account {}", user))?;
            output::success(&format!("Created service account {}", user));
        }

        // install -d is idempotent and corrects owner and mode on reruns
        ctx.remote
            .sudo_exec(&format!(
                "install -d -m 750 -o {user} -g {user} {base} {static_root} {media} && install -d -m 750 -o root -g {user} {env_dir}",
                user = user,
                base = l.base,
                static_root = l.static_root,
                media = l.media_root,
                env_dir = l.env_dir
            ))
            .await
            .context("Failed to create application directories")?;

        // nginx reads static files and connects to the socket through the group
        ctx.remote
            .sudo_exec(&format!("usermod -aG {} www-data", user))
            .await
            .context("Failed to add www-data to the service group")?;

        output::success(&format!("Directory tree under {} owned by {}", l.base, user));
        Ok(())
    }
}
