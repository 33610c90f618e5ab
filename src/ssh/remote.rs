use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;

use crate::error::DeployError;

use super::shell_quote;

/// Delimiter for heredoc writes. The quoted form disables expansion, so file
/// content reaches the host byte for byte.
pub const HEREDOC_EOF: &str = "DECKHAND_EOF";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub code: i32,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            code: 0,
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            code,
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Command execution and file transfer against the one host every stage acts
/// on. Implementations only provide `run` and `transfer`; the rest is layered
/// on top so that a test double exercises the same command text as SSH.
#[async_trait]
pub trait Remote: Send + Sync {
    fn host(&self) -> &str;

    /// Run `cmd` through `bash -c` and capture its output. A nonzero exit is
    /// not an error at this level.
    async fn run(&self, cmd: &str) -> Result<CommandOutput>;

    /// Stream a local file into `remote_path` over the session channel. The
    /// file is created with a 077 umask.
    async fn transfer(&self, local: &Path, remote_path: &str) -> Result<()>;

    /// Run a command and return stdout, failing on nonzero exit.
    async fn exec(&self, cmd: &str) -> Result<String> {
        let output = self.run(cmd).await?;
        if !output.success() {
            return Err(DeployError::RemoteCommandFailure {
                host: self.host().to_string(),
                command: cmd.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            }
            .into());
        }
        Ok(output.stdout)
    }

    /// Run a command, returning Ok(true) on exit 0 and Ok(false) otherwise
    async fn exec_ok(&self, cmd: &str) -> Result<bool> {
        Ok(self.run(cmd).await?.success())
    }

    async fn path_exists(&self, path: &str) -> Result<bool> {
        self.exec_ok(&format!("test -e {}", path)).await
    }

    async fn sudo_exec(&self, cmd: &str) -> Result<String> {
        self.exec(&sudo(cmd)).await
    }

    async fn sudo_exec_ok(&self, cmd: &str) -> Result<bool> {
        self.exec_ok(&sudo(cmd)).await
    }

    /// Write content to a root-owned file
    async fn sudo_write_file(&self, path: &str, content: &str) -> Result<()> {
        self.exec(&format!(
            "sudo tee {} > /dev/null << '{eof}'\n{}\n{eof}",
            path,
            content.trim_end_matches('\n'),
            eof = HEREDOC_EOF
        ))
        .await?;
        Ok(())
    }

    /// Write content to a file owned by the login user
    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        self.exec(&format!(
            "cat > {} << '{eof}'\n{}\n{eof}",
            path,
            content.trim_end_matches('\n'),
            eof = HEREDOC_EOF
        ))
        .await?;
        Ok(())
    }
}

pub fn sudo(cmd: &str) -> String {
    format!("sudo bash -c {}", shell_quote(cmd))
}
