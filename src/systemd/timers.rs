use anyhow::{Context as _, Result};
use async_trait::async_trait;
use minijinja::Environment;

use crate::config::JobConfig;
use crate::output;
use crate::stage::{Context, Precondition, Stage, StageId};

const SERVICE_TEMPLATE: &str = include_str!("../../templates/job.service.j2");
const TIMER_TEMPLATE: &str = include_str!("../../templates/job.timer.j2");

const UNIT_DIR: &str = "/etc/systemd/system";

pub fn unit_name(ctx: &Context<'_>, job: &JobConfig) -> String {
    format!("{}-{}", ctx.layout.app, job.name)
}

fn timer_units(ctx: &Context<'_>) -> Vec<String> {
    ctx.config
        .jobs
        .iter()
        .map(|job| format!("{}.timer", unit_name(ctx, job)))
        .collect()
}

fn unit_paths(ctx: &Context<'_>, job: &JobConfig) -> (String, String) {
    let name = unit_name(ctx, job);
    (
        format!("{}/{}.service", UNIT_DIR, name),
        format!("{}/{}.timer", UNIT_DIR, name),
    )
}

pub fn render(ctx: &Context<'_>, job: &JobConfig) -> Result<(String, String)> {
    let l = &ctx.layout;
    let mut env = Environment::new();
    env.add_template("job.service", SERVICE_TEMPLATE)?;
    env.add_template("job.timer", TIMER_TEMPLATE)?;

    let vars = minijinja::context! {
        app => l.app,
        name => job.name,
        command => job.command,
        schedule => job.schedule,
        unit => format!("{}.service", unit_name(ctx, job)),
        user => l.service_user,
        code => l.code,
        venv => l.venv,
        env_file => l.env_file,
        static_root => l.static_root,
        media_root => l.media_root,
    };

    let service = env.get_template("job.service")?.render(&vars)?;
    let timer = env.get_template("job.timer")?.render(&vars)?;
    Ok((service, timer))
}

/// Every configured job has both unit files
pub async fn registered(ctx: &Context<'_>) -> Result<bool> {
    for job in &ctx.config.jobs {
        let (service, timer) = unit_paths(ctx, job);
        if !ctx
            .remote
            .exec_ok(&format!("test -f {} && test -f {}", service, timer))
            .await?
        {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Periodic management commands as oneshot services driven by timers
pub struct Jobs;

#[async_trait]
impl Stage for Jobs {
    fn id(&self) -> StageId {
        StageId::Jobs
    }

    fn requires(&self) -> &'static [StageId] {
        &[StageId::Supervision]
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition> {
        if ctx.config.jobs.is_empty() {
            return Ok(Precondition::NotApplicable("no jobs configured".to_string()));
        }
        Ok(Precondition::from_bool(registered(ctx).await?))
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        for job in &ctx.config.jobs {
            let (service_path, timer_path) = unit_paths(ctx, job);
            let (service, timer) = render(ctx, job)?;
            ctx.remote
                .sudo_write_file(&service_path, &service)
                .await
                .with_context(|| format!("Failed to write {}", service_path))?;
            ctx.remote
                .sudo_write_file(&timer_path, &timer)
                .await
                .with_context(|| format!("Failed to write {}", timer_path))?;
        }

        // Started by the first deploy; until then there is no code or env file
        let timers = timer_units(ctx);
        ctx.remote
            .sudo_exec(&format!(
                "systemctl daemon-reload && systemctl enable {}",
                timers.join(" ")
            ))
            .await
            .context("Failed to enable job timers")?;

        output::success(&format!("Scheduled {} jobs", timers.len()));
        Ok(())
    }
}

/// Start every job timer. Starting an active timer is a no-op.
pub async fn start(ctx: &Context<'_>) -> Result<()> {
    let timers = timer_units(ctx);
    if timers.is_empty() {
        return Ok(());
    }
    ctx.remote
        .sudo_exec(&format!("systemctl start {}", timers.join(" ")))
        .await
        .context("Failed to start job timers")?;
    Ok(())
}
