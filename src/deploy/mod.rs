pub mod archive;
pub mod record;
pub mod steps;

use anyhow::{Context as _, Result};
use async_trait::async_trait;

use crate::config::DeployMode;
use crate::output;
use crate::stage::{Context, Precondition, Stage, StageId};

use record::DeployRecord;

/// Push code and bring the application up on it. Anything that fails before
/// the restart leaves the running process and the proxy as they were.
pub struct Deploy {
    pub mode: DeployMode,
}

#[async_trait]
impl Stage for Deploy {
    fn id(&self) -> StageId {
        StageId::Deploy
    }

    fn requires(&self) -> &'static [StageId] {
        &[
            StageId::Identity,
            StageId::Secrets,
            StageId::Database,
            StageId::Supervision,
            StageId::Proxy,
        ]
    }

    async fn check(&self, _ctx: &Context<'_>) -> Result<Precondition> {
        Ok(Precondition::Pending)
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        output::header(&format!(
            "Deploying {} to {} ({} mode)",
            ctx.layout.app,
            ctx.remote.host(),
            self.mode.as_str()
        ));

        let previous = DeployRecord::read(ctx).await?.map(|r| r.revision);

        let revision = match self.mode {
            DeployMode::Archive => {
                let source = &ctx.config.deploy.source;
                let archive = archive::build(source, &ctx.config.deploy.exclude)
                    .with_context(|| format!("Failed to archive {}", source.display()))?;
                let revision = archive::local_revision(source)
                    .unwrap_or_else(|| format!("sha256:{}", &archive.sha256[..12]));

                let workdir = steps::upload_archive(ctx, &archive).await?;
                drop(archive);

                steps::ensure_venv(ctx).await?;
                steps::install_requirements(ctx, &workdir).await?;
                steps::migrate(ctx, &workdir).await?;
                steps::collectstatic(ctx, &workdir).await?;
                steps::promote(ctx).await?;
                revision
            }
            DeployMode::Git => {
                let revision = steps::update_checkout(ctx).await?;
                let workdir = ctx.layout.code.clone();

                steps::ensure_venv(ctx).await?;
                steps::install_requirements(ctx, &workdir).await?;
                steps::migrate(ctx, &workdir).await?;
                steps::collectstatic(ctx, &workdir).await?;
                revision
            }
        };

        steps::restart(ctx).await?;
        steps::reload_proxy(ctx).await?;

        DeployRecord::new(revision.clone(), previous, self.mode)
            .write(ctx)
            .await?;

        println!();
        output::success(&format!("Deploy complete! {} is live.", revision));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::config::tests::minimal;
    use crate::config::DeckhandConfig;
    use crate::ssh::fake::FakeHost;

    fn archive_config(source: &std::path::Path) -> DeckhandConfig {
        let mut config = minimal();
        config.deploy.source = source.to_path_buf();
        config
    }

    fn git_config() -> DeckhandConfig {
        let mut config = minimal();
        config.deploy.mode = DeployMode::Git;
        config.deploy.repository = Some("https://git.example/stockwars.git".into());
        config
    }

    fn project() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("manage.py"), "").unwrap();
        fs::write(dir.path().join("requirements.txt"), "Django\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn archive_deploy_runs_steps_in_order() {
        let dir = project();
        let host = FakeHost::new();
        let ctx = Context::new(archive_config(dir.path()), &host);

        Deploy {
            mode: DeployMode::Archive,
        }
        .apply(&ctx)
        .await
        .unwrap();

        let order = [
            "transfer ",
            "tar -xzf",
            "pip install --quiet -r requirements.txt",
            "manage.py migrate --noinput",
            "manage.py collectstatic --noinput",
            "mv /srv/stockwars/app.next /srv/stockwars/app",
            "systemctl restart stockwars.service",
            "systemctl start stockwars-fetch-quotes.timer",
            "nginx -t",
            "systemctl reload nginx",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|p| host.position(p).unwrap_or_else(|| panic!("{} never ran", p)))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", positions);

        // management commands run from the staged tree with the env file sourced
        assert!(host.ran("cd /srv/stockwars/app.next && set -a && . /etc/stockwars/stockwars.env"));
        assert!(host.ran("runuser -u stockwars -- /srv/stockwars/venv/bin/python manage.py migrate"));

        let record: DeployRecord =
            serde_json::from_str(&host.file("/srv/stockwars/deploy.json").unwrap()).unwrap();
        assert_eq!(record.mode, DeployMode::Archive);
        assert!(!record.revision.is_empty());
    }

    #[tokio::test]
    async fn failed_migration_leaves_the_running_app_alone() {
        let dir = project();
        let host = FakeHost::new();
        host.fail("migrate --noinput");
        let ctx = Context::new(archive_config(dir.path()), &host);

        let err = Deploy {
            mode: DeployMode::Archive,
        }
        .apply(&ctx)
        .await
        .unwrap_err();

        assert!(format!("{:#}", err).contains("Migrations failed"));
        assert!(!host.ran("collectstatic"));
        assert!(!host.ran("mv /srv/stockwars/app.next"));
        assert!(!host.ran("systemctl restart"));
        assert!(!host.ran("systemctl start"));
        assert!(!host.ran("systemctl reload nginx"));
        assert!(host.file("/srv/stockwars/deploy.json").is_none());
    }

    #[tokio::test]
    async fn failed_dependency_install_stops_before_migrations() {
        let dir = project();
        let host = FakeHost::new();
        host.fail("pip install");
        let ctx = Context::new(archive_config(dir.path()), &host);

        assert!(Deploy {
            mode: DeployMode::Archive
        }
        .apply(&ctx)
        .await
        .is_err());

        assert!(!host.ran("migrate"));
        assert!(!host.ran("systemctl restart"));
    }

    #[tokio::test]
    async fn git_deploy_fast_forwards_existing_checkout() {
        let host = FakeHost::new();
        host.put_file(
            "/srv/stockwars/deploy.json",
            r#"{"revision":"a71b003","previous_revision":null,"mode":"git","deployed_at":"2026-10-01T09:00:00+00:00"}"#,
        );
        host.script(
            "rev-parse --short HEAD",
            vec![
                crate::ssh::CommandOutput::ok("a71b003\n"),
                crate::ssh::CommandOutput::ok("4f2c9e1\n"),
            ],
        );
        let ctx = Context::new(git_config(), &host);

        Deploy {
            mode: DeployMode::Git,
        }
        .apply(&ctx)
        .await
        .unwrap();

        assert!(host.ran("sudo bash -c 'test -d /srv/stockwars/app/.git'"));
        assert!(!host.ran("git clone"));
        assert!(!host.ran("rm -rf /srv/stockwars/app "));
        assert!(host.ran("git fetch --quiet origin main"));
        assert!(host.ran("git merge --ff-only --quiet FETCH_HEAD"));
        assert!(host.ran("cd /srv/stockwars/app && set -a"));

        let record: DeployRecord =
            serde_json::from_str(&host.file("/srv/stockwars/deploy.json").unwrap()).unwrap();
        assert_eq!(record.revision, "4f2c9e1");
        assert_eq!(record.previous_revision.as_deref(), Some("a71b003"));
    }

    #[tokio::test]
    async fn diverged_checkout_fails_before_restart() {
        let host = FakeHost::new();
        host.fail("git merge --ff-only");
        let ctx = Context::new(git_config(), &host);

        let err = Deploy {
            mode: DeployMode::Git,
        }
        .apply(&ctx)
        .await
        .unwrap_err();

        assert!(err.to_string().contains("diverged"));
        assert!(!host.ran("pip install"));
        assert!(!host.ran("systemctl restart"));
    }

    #[tokio::test]
    async fn existing_venv_is_found_as_root_and_kept() {
        let host = FakeHost::new();
        let ctx = Context::new(minimal(), &host);

        steps::ensure_venv(&ctx).await.unwrap();

        assert!(host.ran("sudo bash -c 'test -x /srv/stockwars/venv/bin/python'"));
        assert!(!host.ran("python3 -m venv"));
    }

    #[tokio::test]
    async fn first_git_deploy_clones() {
        let host = FakeHost::new();
        host.fail("test -d /srv/stockwars/app/.git");
        let ctx = Context::new(git_config(), &host);

        Deploy {
            mode: DeployMode::Git,
        }
        .apply(&ctx)
        .await
        .unwrap();

        assert!(host.ran(
            "git clone --quiet --branch main https://git.example/stockwars.git /srv/stockwars/app"
        ));
        assert!(!host.ran("git fetch"));
    }
}
