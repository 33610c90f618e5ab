use anyhow::{bail, Context as _, Result};
use async_trait::async_trait;

use crate::error::DeployError;
use crate::nginx::{self, Material, NginxConfig};
use crate::output;
use crate::stage::{Context, Precondition, Stage, StageId};

/// Point the live site at CA-issued material for `domain`. The bootstrap pair
/// stays on disk.
pub struct UpgradeCertificate {
    pub domain: String,
}

impl UpgradeCertificate {
    fn issued(&self, ctx: &Context<'_>) -> Material {
        let dir = format!(
            "{}/{}",
            ctx.config.tls.issued_dir.trim_end_matches('/'),
            self.domain
        );
        Material {
            certificate: format!("{}/fullchain.pem", dir),
            key: format!("{}/privkey.pem", dir),
        }
    }

    async fn live_config(ctx: &Context<'_>) -> Result<NginxConfig> {
        let text = nginx::read_live(ctx).await?.ok_or_else(|| {
            DeployError::missing(
                format!("nginx site {}", ctx.layout.proxy_available),
                "run `deckhand provision` first",
            )
        })?;
        NginxConfig::parse(&text)
            .with_context(|| format!("Could not parse {}", ctx.layout.proxy_available))
    }
}

fn valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && domain.len() <= 253
        && !domain.starts_with('.')
        && !domain.contains("..")
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
}

#[async_trait]
impl Stage for UpgradeCertificate {
    fn id(&self) -> StageId {
        StageId::CertificateUpgrade
    }

    fn requires(&self) -> &'static [StageId] {
        &[StageId::Proxy]
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition> {
        if !valid_domain(&self.domain) {
            bail!("'{}' is not a valid domain name", self.domain);
        }
        let Some(text) = nginx::read_live(ctx).await? else {
            return Ok(Precondition::Pending);
        };
        let live = NginxConfig::parse(&text).ok().and_then(|c| Material::from_config(&c));
        Ok(Precondition::from_bool(live == Some(self.issued(ctx))))
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        let issued = self.issued(ctx);

        let present = ctx
            .remote
            .sudo_exec_ok(&format!("test -s {} && test -s {}", issued.certificate, issued.key))
            .await?;
        if !present {
            return Err(DeployError::missing(
                format!("issued certificate for {} ({})", self.domain, issued.certificate),
                format!(
                    "issue one on the host with `sudo certbot certonly --webroot -w {} -d {}`",
                    ctx.config.proxy.acme_root, self.domain
                ),
            )
            .into());
        }

        let mut config = Self::live_config(ctx).await?;
        if config.set_all("ssl_certificate", &[issued.certificate.as_str()]) == 0 {
            bail!(
                "{} has no ssl_certificate directive to replace",
                ctx.layout.proxy_available
            );
        }
        config.set_all("ssl_certificate_key", &[issued.key.as_str()]);

        nginx::install_validated(ctx, &ctx.layout.proxy_available, &config.to_string(), None)
            .await?;
        nginx::reload(ctx).await?;

        output::success(&format!("Serving {} with {}", self.domain, issued.certificate));
        Ok(())
    }
}
