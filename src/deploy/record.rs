use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};

use crate::config::DeployMode;
use crate::stage::Context;

/// What is running on the host, written after a deploy completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployRecord {
    pub revision: String,
    pub previous_revision: Option<String>,
    pub mode: DeployMode,
    pub deployed_at: String,
}

impl DeployRecord {
    pub fn new(revision: String, previous_revision: Option<String>, mode: DeployMode) -> Self {
        Self {
            revision,
            previous_revision,
            mode,
            deployed_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub async fn read(ctx: &Context<'_>) -> Result<Option<Self>> {
        let out = ctx
            .remote
            .run(&format!("sudo cat {}", ctx.layout.record))
            .await?;
        if !out.success() {
            return Ok(None);
        }
        let record = serde_json::from_str(out.stdout.trim())
            .with_context(|| format!("Failed to parse {}", ctx.layout.record))?;
        Ok(Some(record))
    }

    pub async fn write(&self, ctx: &Context<'_>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        ctx.remote
            .sudo_write_file(&ctx.layout.record, &content)
            .await
            .with_context(|| format!("Failed to write {}", ctx.layout.record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::minimal;
    use crate::ssh::fake::FakeHost;

    #[tokio::test]
    async fn written_record_reads_back() {
        let host = FakeHost::new();
        let ctx = Context::new(minimal(), &host);

        assert_eq!(DeployRecord::read(&ctx).await.unwrap(), None);

        let record = DeployRecord::new("4f2c9e1".into(), Some("a71b003".into()), DeployMode::Git);
        record.write(&ctx).await.unwrap();

        let stored = host.file("/srv/stockwars/deploy.json").unwrap();
        assert!(stored.contains("\"mode\": \"git\""));
        assert_eq!(DeployRecord::read(&ctx).await.unwrap(), Some(record));
    }
}
