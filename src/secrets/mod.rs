//! Runtime secrets for the application: generated or asked for once, then
//! placed on the host as a private env file.

pub mod bundle;
pub mod prompt;
pub mod store;

use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::output;
use crate::stage::{Context, Precondition, Stage, StageId};

pub use bundle::SecretBundle;
pub use prompt::{SecretSource, Terminal};

pub async fn installed(ctx: &Context<'_>) -> Result<bool> {
    ctx.remote
        .sudo_exec_ok(&format!("test -f {}", ctx.layout.env_file))
        .await
}

pub struct Secrets {
    source: Mutex<Box<dyn SecretSource + Send>>,
}

impl Secrets {
    pub fn new(source: impl SecretSource + Send + 'static) -> Self {
        Self {
            source: Mutex::new(Box::new(source)),
        }
    }
}

#[async_trait]
impl Stage for Secrets {
    fn id(&self) -> StageId {
        StageId::Secrets
    }

    fn requires(&self) -> &'static [StageId] {
        &[StageId::Identity]
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition> {
        Ok(Precondition::from_bool(installed(ctx).await?))
    }

    async fn apply(&self, ctx: &Context<'_>) -> Result<()> {
        let bundle = {
            let mut source = self
                .source
                .lock()
                .map_err(|_| anyhow!("secret prompt state poisoned"))?;
            SecretBundle::assemble(&ctx.config, source.as_mut())?
        };
        output::info(&format!("Assembled {} values", bundle.keys().count()));

        store::distribute(ctx, &bundle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::minimal;
    use crate::secrets::prompt::Scripted;
    use crate::ssh::fake::FakeHost;

    #[tokio::test]
    async fn existing_env_file_is_left_alone() {
        let host = FakeHost::new();
        let ctx = Context::new(minimal(), &host);

        let stage = Secrets::new(Scripted::new(&[]));
        assert_eq!(stage.check(&ctx).await.unwrap(), Precondition::Satisfied);
        assert!(host.ran("test -f /etc/stockwars/stockwars.env"));
    }

    #[tokio::test]
    async fn missing_env_file_is_pending() {
        let host = FakeHost::new();
        host.fail("test -f /etc/stockwars/stockwars.env");
        let ctx = Context::new(minimal(), &host);

        let stage = Secrets::new(Scripted::new(&[]));
        assert_eq!(stage.check(&ctx).await.unwrap(), Precondition::Pending);
    }
}
