//! nginx site for the application: TLS termination, static files, and the
//! proxy to the ASGI socket.

pub mod config;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use minijinja::Environment;
use tracing::warn;

use crate::error::DeployError;
use crate::output;
use crate::ssh::remote::sudo;
use crate::stage::{Context, Precondition, Stage, StageId};

pub use config::NginxConfig;

const SITE_TEMPLATE: &str = include_str!("../../templates/nginx.conf.j2");
const DEFAULT_SITE: &str = "/etc/nginx/sites-enabled/default";

/// Certificate and key paths the site serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Material {
    pub certificate: String,
    pub key: String,
}

impl Material {
    pub fn bootstrap(ctx: &Context<'_>) -> Self {
        Self {
            certificate: ctx.layout.bootstrap_cert(),
            key: ctx.layout.bootstrap_key(),
        }
    }

    /// Material a live config already points at
    pub fn from_config(config: &NginxConfig) -> Option<Self> {
        let certificate = config.find_first("ssl_certificate")?.first()?.clone();
        let key = config.find_first("ssl_certificate_key")?.first()?.clone();
        Some(Self { certificate, key })
    }
}

pub fn render(ctx: &Context<'_>, material: &Material) -> Result<String> {
    let l = &ctx.layout;
    let proxy = &ctx.config.proxy;

    let mut env = Environment::new();
    env.add_template("nginx.conf", SITE_TEMPLATE)?;
    let tmpl = env.get_template("nginx.conf")?;
    let content = tmpl.render(minijinja::context! {
        app => l.app,
        server_name => proxy.server_name,
        http_port => proxy.http_port,
        https_port => proxy.https_port,
        acme_root => proxy.acme_root,
        max_body_size => proxy.max_body_size,
        certificate => material.certificate,
        certificate_key => material.key,
        static_root => l.static_root,
        media_root => l.media_root,
        socket => l.socket,
    })?;
    Ok(content)
}

/// Live site file, if there is one
pub async fn read_live(ctx: &Context<'_>) -> Result<Option<String>> {
    let out = ctx
        .remote
        .run(&format!("sudo cat {}", ctx.layout.proxy_available))
        .await?;
    Ok(out.success().then_some(out.stdout))
}

pub async fn site_enabled(ctx: &Context<'_>) -> Result<bool> {
    ctx.remote
        .sudo_exec_ok(&format!(
            "test -f {} && test -L {}",
            ctx.layout.proxy_available, ctx.layout.proxy_enabled
        ))
        .await
}

/// Keep externally issued material a previous upgrade put in place; a rerun of
/// provision must not fall back to the self-signed pair.
fn active_material(ctx: &Context<'_>, live: Option<&str>) -> Material {
    let bootstrap = Material::bootstrap(ctx);
    live.and_then(|text| NginxConfig::parse(text).ok())
        .and_then(|config| Material::from_config(&config))
        .filter(|m| m.certificate != bootstrap.certificate)
        .unwrap_or(bootstrap)
}

/// Write `content` to `path` and keep it only if `nginx -t` accepts the
/// resulting configuration. The previous file is copied to `<path>.bak.<ts>`
/// first and copied back on failure; with no previous file the new one is
/// removed again. `enable` links the file into sites-enabled before testing
/// and drops the default site once the test passes.
pub async fn install_validated(
    ctx: &Context<'_>,
    path: &str,
    content: &str,
    enable: Option<&str>,
) -> Result<()> {
    let backup = if ctx.remote.path_exists(path).await? {
        let backup = format!(
            "{}.bak.{}",
            path,
            chrono::Local::now().format("%Y%m%d%H%M%S")
        );
        ctx.remote
            .sudo_exec(&format!("cp -p {} {}", path, backup))
            .await
            .with_context(|| format!("Failed to back up {}", path))?;
        Some(backup)
    } else {
        None
    };

    ctx.remote
        .sudo_write_file(path, content)
        .await
        .with_context(|| format!("Failed to write {}", path))?;

    if let Some(link) = enable {
        ctx.remote
            .sudo_exec(&format!("ln -sf {} {}", path, link))
            .await
            .context("Failed to enable site")?;
    }

    let test = ctx.remote.run(&sudo("nginx -t 2>&1")).await?;
    if test.success() {
        // the distribution's placeholder site goes only once ours is accepted
        if enable.is_some() {
            ctx.remote
                .sudo_exec(&format!("rm -f {}", DEFAULT_SITE))
                .await
                .context("Failed to disable the default site")?;
        }
        return Ok(());
    }

    let restore = match (&backup, enable) {
        (Some(backup), _) => format!("cp -p {} {}", backup, path),
        (None, Some(link)) => format!("rm -f {} {}", link, path),
        (None, None) => format!("rm -f {}", path),
    };
    if let Err(e) = ctx.remote.sudo_exec(&restore).await {
        warn!("Could not restore {}: {:#}", path, e);
    }

    Err(DeployError::ValidationFailure {
        what: format!("nginx configuration {}", path),
        diagnostic: format!("{}{}", test.stdout.trim(), test.stderr.trim()),
    }
    .into())
}

pub async fn reload(ctx: &Context<'_>) -> Result<()> {
    ctx.remote
        .sudo_exec("systemctl reload nginx")
        .await
        .context("Failed to reload nginx")?;
    Ok(())
}

pub struct Proxy;

#[async_trait]
impl Stage for Proxy {
    fn id(&self) -> StageId {
        StageId::Proxy
    }

    fn requires(&self) -> &'static [StageId] {
        &[StageId::Identity, StageId::Certificate]
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition> {
        let Some(live) = read_live(ctx).await? else {
            return Ok(Precondition::Pending);
        };
        let wanted = render(ctx, &active_material(ctx, Some(&live)))?;
        let linked = ctx
            .remote
            .sudo_exec_ok(&format!("test -L {}", ctx.layout.proxy_enabled))
            .await?;
        Ok(Precondition::from_bool(
            linked && live.trim_end() == wanted.trim_end(),
        ))
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        let l = &ctx.layout;
        let live = read_live(ctx).await?;
        let material = active_material(ctx, live.as_deref());
        let content = render(ctx, &material)?;

        ctx.remote
            .sudo_exec(&format!("install -d -m 755 {}", ctx.config.proxy.acme_root))
            .await
            .context("Failed to create ACME challenge directory")?;

        install_validated(ctx, &l.proxy_available, &content, Some(&l.proxy_enabled)).await?;

        ctx.remote
            .sudo_exec("systemctl enable nginx && systemctl start nginx")
            .await
            .context("Failed to start nginx")?;
        reload(ctx).await?;

        output::success(&format!(
            "nginx serving {} with {}",
            ctx.config.proxy.server_name, material.certificate
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::minimal;
    use crate::ssh::fake::FakeHost;
    use crate::ssh::CommandOutput;

    const SITE: &str = "/etc/nginx/sites-available/stockwars";

    #[test]
    fn rendered_site_covers_tls_static_and_websockets() {
        let host = FakeHost::new();
        let ctx = Context::new(minimal(), &host);
        let site = render(&ctx, &Material::bootstrap(&ctx)).unwrap();

        assert!(site.contains("return 301 https://$host$request_uri;"));
        assert!(site.contains("listen 443 ssl http2;"));
        assert!(site.contains("ssl_certificate /etc/stockwars/tls/bootstrap.crt;"));
        assert!(site.contains("alias /srv/stockwars/static/;"));
        assert!(site.contains("expires 30d;"));
        assert!(site.contains("expires 1h;"));
        assert!(site.contains("proxy_pass http://unix:/run/stockwars/app.sock;"));
        assert!(site.contains("proxy_set_header Connection \"upgrade\";"));
        assert!(site.contains("proxy_set_header X-Forwarded-Proto $scheme;"));
    }

    #[test]
    fn rendered_site_is_in_canonical_form() {
        let host = FakeHost::new();
        let ctx = Context::new(minimal(), &host);
        let site = render(&ctx, &Material::bootstrap(&ctx)).unwrap();

        let parsed = NginxConfig::parse(&site).unwrap();
        assert_eq!(parsed.to_string().trim_end(), site.trim_end());
    }

    #[tokio::test]
    async fn first_apply_writes_links_and_reloads() {
        let host = FakeHost::new();
        host.fail(&format!("test -e {}", SITE));
        let ctx = Context::new(minimal(), &host);

        Proxy.apply(&ctx).await.unwrap();

        assert!(host.file(SITE).unwrap().contains("bootstrap.crt"));
        assert!(host.ran("ln -sf /etc/nginx/sites-available/stockwars /etc/nginx/sites-enabled/stockwars"));
        assert!(host.position("nginx -t") < host.position("rm -f /etc/nginx/sites-enabled/default"));
        assert!(host.position("nginx -t") < host.position("systemctl reload nginx"));
    }

    #[tokio::test]
    async fn rerun_keeps_issued_certificate() {
        let host = FakeHost::new();
        let ctx = Context::new(minimal(), &host);
        let issued = Material {
            certificate: "/etc/letsencrypt/live/stockwars.example/fullchain.pem".into(),
            key: "/etc/letsencrypt/live/stockwars.example/privkey.pem".into(),
        };
        host.put_file(SITE, &render(&ctx, &issued).unwrap());

        assert_eq!(Proxy.check(&ctx).await.unwrap(), Precondition::Satisfied);

        Proxy.apply(&ctx).await.unwrap();
        assert!(host.file(SITE).unwrap().contains("fullchain.pem"));
        assert!(!host.file(SITE).unwrap().contains("bootstrap.crt"));
    }

    #[tokio::test]
    async fn drifted_site_is_pending() {
        let host = FakeHost::new();
        host.put_file(SITE, "server {\n    listen 80;\n}\n");
        let ctx = Context::new(minimal(), &host);

        assert_eq!(Proxy.check(&ctx).await.unwrap(), Precondition::Pending);
    }

    #[tokio::test]
    async fn rejected_config_is_rolled_back_without_reload() {
        let host = FakeHost::new();
        host.script(
            "nginx -t",
            vec![CommandOutput::failed(1, "nginx: [emerg] unknown directive")],
        );
        host.put_file(SITE, "server {\n    listen 80;\n}\n");
        let ctx = Context::new(minimal(), &host);

        let err = Proxy.apply(&ctx).await.unwrap_err();

        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::ValidationFailure { .. })
        ));
        assert!(err.to_string().contains("unknown directive"));
        assert!(host.ran(&format!("cp -p {}.bak.", SITE)));
        let restore = host
            .history()
            .into_iter()
            .filter(|c| c.contains("cp -p"))
            .last()
            .unwrap();
        assert!(restore.contains(&format!(" {}'", SITE)));
        assert!(!host.ran("sites-enabled/default"));
        assert!(!host.ran("systemctl reload nginx"));
    }
}
