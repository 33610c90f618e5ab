//! Local PostgreSQL role and database for the application.

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::output;
use crate::secrets::bundle::DB_HOST;
use crate::stage::{Context, Precondition, Stage, StageId};

pub fn is_local(host: &str) -> bool {
    matches!(host.trim(), "" | "localhost" | "127.0.0.1" | "::1")
}

/// Configured host, or the one recorded in the env file on the host
async fn target_host(ctx: &Context<'_>) -> Result<Option<String>> {
    if let Some(host) = &ctx.config.database.host {
        return Ok(Some(host.clone()));
    }

    let line = ctx
        .remote
        .sudo_exec(&format!(
            "grep -m1 ^{}= {} || true",
            DB_HOST, ctx.layout.env_file
        ))
        .await?;
    Ok(line
        .trim()
        .strip_prefix(&format!("{}=", DB_HOST))
        .map(|v| v.trim_matches('\'').to_string()))
}

fn psql_query(sql: &str) -> String {
    format!("runuser -u postgres -- psql -tAc \"{}\"", sql)
}

async fn query_exists(ctx: &Context<'_>, sql: &str) -> Result<bool> {
    let out = ctx.remote.sudo_exec(&psql_query(sql)).await?;
    Ok(out.trim() == "1")
}

async fn role_exists(ctx: &Context<'_>) -> Result<bool> {
    query_exists(
        ctx,
        &format!(
            "SELECT 1 FROM pg_roles WHERE rolname='{}'",
            ctx.config.database.user
        ),
    )
    .await
}

async fn database_exists(ctx: &Context<'_>) -> Result<bool> {
    query_exists(
        ctx,
        &format!(
            "SELECT 1 FROM pg_database WHERE datname='{}'",
            ctx.config.database.name
        ),
    )
    .await
}

pub async fn state(ctx: &Context<'_>) -> Result<Precondition> {
    let host = target_host(ctx).await?.unwrap_or_default();
    if !is_local(&host) {
        return Ok(Precondition::NotApplicable(format!(
            "database on {} is managed elsewhere",
            host
        )));
    }

    if !ctx.remote.exec_ok("command -v psql").await? {
        return Ok(Precondition::Pending);
    }

    Ok(Precondition::from_bool(
        role_exists(ctx).await? && database_exists(ctx).await?,
    ))
}

/// The password is expanded by the host's shell from the sourced env file
/// into psql's stdin. It never reaches command text or argv.
fn create_role_command(ctx: &Context<'_>) -> String {
    format!(
        "set -a && . {env} && set +a && \
         case \"$POSTGRES_PASSWORD\" in ''|*[!A-Za-z0-9_-]*) echo 'POSTGRES_PASSWORD must be non-empty and URL-safe' >&2; exit 1;; esac && \
         runuser -u postgres -- psql -v ON_ERROR_STOP=1 -q << SQL\n\
         CREATE ROLE \"{user}\" LOGIN PASSWORD '$POSTGRES_PASSWORD';\n\
         SQL",
        env = ctx.layout.env_file,
        user = ctx.config.database.user
    )
}

fn create_database_command(ctx: &Context<'_>) -> String {
    format!(
        "runuser -u postgres -- psql -v ON_ERROR_STOP=1 -q << 'SQL'\n\
         CREATE DATABASE \"{name}\" OWNER \"{user}\";\n\
         SQL",
        name = ctx.config.database.name,
        user = ctx.config.database.user
    )
}

pub struct DatabaseBootstrap;

#[async_trait]
impl Stage for DatabaseBootstrap {
    fn id(&self) -> StageId {
        StageId::Database
    }

    fn requires(&self) -> &'static [StageId] {
        &[StageId::Packages, StageId::Secrets]
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition> {
        state(ctx).await
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        let db = &ctx.config.database;

        ctx.remote
            .sudo_exec("systemctl enable --now postgresql")
            .await
            .context("Failed to start PostgreSQL")?;

        if role_exists(ctx).await? {
            output::satisfied(&format!("Role {} already exists", db.user));
        } else {
            ctx.remote
                .sudo_exec(&create_role_command(ctx))
                .await
                .with_context(|| format!("Failed to create role {}", db.user))?;
            output::success(&format!("Created role {}", db.user));
        }

        if database_exists(ctx).await? {
            output::satisfied(&format!("Database {} already exists", db.name));
        } else {
            ctx.remote
                .sudo_exec(&create_database_command(ctx))
                .await
                .with_context(|| format!("Failed to create database {}", db.name))?;
            output::success(&format!("Created database {} owned by {}", db.name, db.user));
        }

        Ok(())
    }
}
