//! Self-signed bootstrap certificate, generated on the host so the private
//! key never leaves it.

pub mod upgrade;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::output;
use crate::stage::{Context, Precondition, Stage, StageId};

pub use upgrade::UpgradeCertificate;

const CN_MAX_LEN: usize = 64;
const KEY_BITS: u32 = 2048;
const VALIDITY_DAYS: u32 = 180;
const FALLBACK_CN: &str = "localhost";

const METADATA_BASE: &str = "http://169.254.169.254/latest";

/// Keep only `[A-Za-z0-9._-]`, at most 64 characters. `None` when nothing
/// usable is left.
pub fn sanitize_cn(raw: &str) -> Option<String> {
    let cn: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .take(CN_MAX_LEN)
        .collect();
    if cn.is_empty() {
        None
    } else {
        Some(cn)
    }
}

/// First usable name among the override, the public hostname, and `localhost`
pub fn choose_cn(override_cn: Option<&str>, public_hostname: Option<&str>) -> String {
    override_cn
        .and_then(sanitize_cn)
        .or_else(|| public_hostname.and_then(sanitize_cn))
        .unwrap_or_else(|| FALLBACK_CN.to_string())
}

/// Public name from the cloud metadata service, asked from the host itself.
/// IMDSv2 first, plain GET if no token is issued. Any failure is `None`.
pub async fn public_hostname(ctx: &Context<'_>) -> Result<Option<String>> {
    let cmd = format!(
        "TOKEN=$(curl -sf --max-time 2 -X PUT -H 'X-aws-ec2-metadata-token-ttl-seconds: 60' {base}/api/token || true); \
         curl -sf --max-time 2 ${{TOKEN:+-H \"X-aws-ec2-metadata-token: $TOKEN\"}} {base}/meta-data/public-hostname",
        base = METADATA_BASE
    );
    let out = ctx.remote.run(&cmd).await?;
    if !out.success() {
        debug!("No public hostname from metadata (exit {})", out.code);
        return Ok(None);
    }
    Ok(Some(out.stdout).filter(|s| !s.trim().is_empty()))
}

pub async fn installed(ctx: &Context<'_>) -> Result<bool> {
    ctx.remote
        .sudo_exec_ok(&format!(
            "test -s {} && test -s {}",
            ctx.layout.bootstrap_key(),
            ctx.layout.bootstrap_cert()
        ))
        .await
}

fn generate_command(ctx: &Context<'_>, cn: &str) -> String {
    let l = &ctx.layout;
    format!(
        "install -d -m 700 {dir} && umask 077 && \
         openssl req -x509 -newkey rsa:{bits} -nodes -sha256 -days {days} -subj /CN={cn} \
         -keyout {key} -out {cert} 2>/dev/null && chmod 600 {key} && chmod 644 {cert}",
        dir = l.tls_dir,
        bits = KEY_BITS,
        days = VALIDITY_DAYS,
        cn = cn,
        key = l.bootstrap_key(),
        cert = l.bootstrap_cert()
    )
}

pub struct BootstrapCertificate {
    /// Name given on the command line; wins over the config
    pub common_name: Option<String>,
}

#[async_trait]
impl Stage for BootstrapCertificate {
    fn id(&self) -> StageId {
        StageId::Certificate
    }

    fn requires(&self) -> &'static [StageId] {
        &[StageId::Identity]
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition> {
        Ok(Precondition::from_bool(installed(ctx).await?))
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        let override_cn = self
            .common_name
            .as_deref()
            .or(ctx.config.tls.common_name.as_deref());

        // Only ask the metadata service when the override is unusable
        let public = match override_cn.and_then(sanitize_cn) {
            Some(_) => None,
            None => public_hostname(ctx).await?,
        };
        let cn = choose_cn(override_cn, public.as_deref());

        ctx.remote
            .sudo_exec(&generate_command(ctx, &cn))
            .await
            .context("Failed to generate bootstrap certificate")?;

        output::success(&format!(
            "Self-signed certificate for CN={} (RSA {}, {} days)",
            cn, KEY_BITS, VALIDITY_DAYS
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

    #[test]
    fn sanitized_names_stay_in_the_safe_alphabet() {
        let samples = [
            "ec2-3-91-12-7.compute-1.amazonaws.com\r\n",
            "evil.example; rm -rf /",
            "ünïcödé.example",
            "a b\tc",
            &"x".repeat(200),
            "/CN=other/O=forged",
        ];
        for raw in samples {
            let cn = sanitize_cn(raw).unwrap();
            assert!(cn.len() <= 64, "{}", cn);
            assert!(cn
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
        }
        assert_eq!(
            sanitize_cn("ec2-3-91-12-7.compute-1.amazonaws.com\n").as_deref(),
            Some("ec2-3-91-12-7.compute-1.amazonaws.com")
        );
    }

    #[test]
    fn eighty_character_name_with_separators_is_cut_to_sixty_four() {
        let raw = format!("{} ;\t{}\n;", "a".repeat(38), "b".repeat(37));
        assert_eq!(raw.chars().count(), 80);

        let cn = sanitize_cn(&raw).unwrap();
        assert_eq!(cn, format!("{}{}", "a".repeat(38), "b".repeat(26)));
        assert_eq!(cn.len(), 64);
    }

    #[test]
    fn unusable_names_fall_through() {
        assert_eq!(choose_cn(Some("app.example"), Some("ec2.example")), "app.example");
        assert_eq!(choose_cn(Some("\r\n;;"), Some("ec2.example")), "ec2.example");
        assert_eq!(choose_cn(None, Some("  ")), "localhost");
        assert_eq!(choose_cn(None, None), "localhost");
    }

    #[tokio::test]
    async fn metadata_failure_falls_back_to_localhost() {
        let host = FakeHost::new();
        host.script(
            "meta-data/public-hostname",
            vec![CommandOutput::failed(28, "")],
        );
        let ctx = Context::new(minimal(), &host);

        BootstrapCertificate { common_name: None }
            .apply(&ctx)
            .await
            .unwrap();

        assert!(host.ran("-subj /CN=localhost "));
    }

    #[tokio::test]
    async fn key_is_rsa_2048_valid_180_days() {
        let host = FakeHost::new();
        host.on("meta-data/public-hostname", "ec2-203-0-113-7.compute-1.amazonaws.com");
        let ctx = Context::new(minimal(), &host);

        BootstrapCertificate { common_name: None }
            .apply(&ctx)
            .await
            .unwrap();

        assert!(host.ran("-newkey rsa:2048 -nodes -sha256 -days 180"));
        assert!(host.ran("-subj /CN=ec2-203-0-113-7.compute-1.amazonaws.com "));
        assert!(host.ran("chmod 600 /etc/stockwars/tls/bootstrap.key"));
    }

    #[tokio::test]
    async fn override_skips_the_metadata_service() {
        let host = FakeHost::new();
        let ctx = Context::new(minimal(), &host);

        BootstrapCertificate {
            common_name: Some("stockwars.example".into()),
        }
        .apply(&ctx)
        .await
        .unwrap();

        assert!(!host.ran("169.254.169.254"));
        assert!(host.ran("-subj /CN=stockwars.example "));
    }
}
