use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use openssh::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::DeployError;

use super::remote::{CommandOutput, Remote};
use super::{shell_quote, SshSession};

#[async_trait]
impl Remote for SshSession {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, cmd: &str) -> Result<CommandOutput> {
        debug!("[{}] exec: {}", self.host, cmd);

        let output = self
            .session
            .command("bash")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .with_context(|| format!("Failed to execute command on {}: {}", self.host, cmd))?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            code: output.status.code().unwrap_or(-1),
        })
    }

    async fn transfer(&self, local: &Path, remote_path: &str) -> Result<()> {
        debug!(
            "[{}] transfer: {} -> {}",
            self.host,
            local.display(),
            remote_path
        );

        let mut file = tokio::fs::File::open(local)
            .await
            .with_context(|| format!("Failed to open {}", local.display()))?;

        let receive = format!("umask 077 && cat > {}", shell_quote(remote_path));
        let mut child = self
            .session
            .command("bash")
            .arg("-c")
            .arg(&receive)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .with_context(|| format!("Failed to start transfer to {}:{}", self.host, remote_path))?;

        let mut stdin = child
            .stdin()
            .take()
            .context("Failed to open remote stdin for transfer")?;
        tokio::io::copy(&mut file, &mut stdin)
            .await
            .with_context(|| format!("Failed to stream {} to {}", local.display(), self.host))?;
        stdin.shutdown().await?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Transfer to {}:{} did not complete", self.host, remote_path))?;

        if !output.status.success() {
            return Err(DeployError::RemoteCommandFailure {
                host: self.host.clone(),
                command: receive,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }

        Ok(())
    }
}
