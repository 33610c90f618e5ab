//! systemd unit that keeps the ASGI server running.

pub mod timers;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use minijinja::Environment;

use crate::database;
use crate::output;
use crate::stage::{Context, Precondition, Stage, StageId};

const UNIT_TEMPLATE: &str = include_str!("../../templates/app.service.j2");

pub use timers::Jobs;

fn exec_start(ctx: &Context<'_>) -> String {
    match &ctx.config.app.entrypoint {
        Some(entrypoint) => entrypoint.clone(),
        None => format!(
            "{}/bin/daphne -u {} {}.asgi:application",
            ctx.layout.venv, ctx.layout.socket, ctx.config.app.project
        ),
    }
}

pub fn render_unit(ctx: &Context<'_>) -> Result<String> {
    let l = &ctx.layout;
    let local_db = ctx
        .config
        .database
        .host
        .as_deref()
        .map_or(true, database::is_local);

    let mut env = Environment::new();
    env.add_template("app.service", UNIT_TEMPLATE)?;
    let tmpl = env.get_template("app.service")?;
    Ok(tmpl.render(minijinja::context! {
        app => l.app,
        user => l.service_user,
        code => l.code,
        env_file => l.env_file,
        static_root => l.static_root,
        media_root => l.media_root,
        runtime_dir => l.runtime_dir,
        exec_start => exec_start(ctx),
        restart_sec => ctx.config.app.restart_sec,
        local_db => local_db,
    })?)
}

pub async fn unit_registered(ctx: &Context<'_>) -> Result<bool> {
    ctx.remote.path_exists(&ctx.layout.unit).await
}

/// Restart the application after a deploy. Never recreates the unit.
pub async fn restart(ctx: &Context<'_>) -> Result<()> {
    let service = ctx.layout.service_name();
    ctx.remote
        .sudo_exec(&format!("systemctl restart {}", service))
        .await
        .with_context(|| format!("Failed to restart {}", service))?;

    if !ctx
        .remote
        .exec_ok(&format!("systemctl is-active --quiet {}", service))
        .await?
    {
        output::warning(&format!(
            "{} is not active after restart; see `deckhand logs`",
            service
        ));
    }
    Ok(())
}

pub struct Supervision;

#[async_trait]
impl Stage for Supervision {
    fn id(&self) -> StageId {
        StageId::Supervision
    }

    fn requires(&self) -> &'static [StageId] {
        &[StageId::Identity]
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition> {
        Ok(Precondition::from_bool(unit_registered(ctx).await?))
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        let unit = render_unit(ctx)?;
        ctx.remote
            .sudo_write_file(&ctx.layout.unit, &unit)
            .await
            .with_context(|| format!("Failed to write {}", ctx.layout.unit))?;

        // Started by the first deploy, once there is code to run
        ctx.remote
            .sudo_exec(&format!(
                "systemctl daemon-reload && systemctl enable {}",
                ctx.layout.service_name()
            ))
            .await
            .context("Failed to register the service")?;

        output::success(&format!("Registered {}", ctx.layout.service_name()));
        Ok(())
    }
}
