use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DeployError;
use crate::ssh::{shell_quote, Remote};

/// tmpfs on systemd hosts, so a lock never survives a reboot
const LOCK_ROOT: &str = "/run/lock";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockHolder {
    pub operation: String,
    pub holder: String,
    pub acquired_at: String,
}

impl LockHolder {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            holder: local_identity(),
            acquired_at: chrono::Local::now().to_rfc3339(),
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "{} (running `{}` since {})",
            self.holder, self.operation, self.acquired_at
        )
    }
}

/// Exclusive claim on the host for one mutating operation. `mkdir` is atomic,
/// so two deployers racing for the same host cannot both win.
pub struct HostLock {
    path: String,
}

impl HostLock {
    pub fn path_for(app: &str) -> String {
        format!("{}/deckhand-{}", LOCK_ROOT, app)
    }

    pub async fn acquire(remote: &dyn Remote, app: &str, operation: &str) -> Result<Self> {
        let path = Self::path_for(app);

        if !remote.exec_ok(&format!("mkdir {}", path)).await? {
            let holder = Self::holder(remote, app)
                .await?
                .map(|h| h.describe())
                .unwrap_or_else(|| "an unknown operator".to_string());
            return Err(DeployError::LockHeld {
                host: remote.host().to_string(),
                holder,
            }
            .into());
        }

        let holder = LockHolder::new(operation);
        remote
            .write_file(
                &format!("{}/holder.json", path),
                &serde_json::to_string_pretty(&holder)?,
            )
            .await?;

        debug!("Acquired {} for {}", path, operation);
        Ok(Self { path })
    }

    pub async fn holder(remote: &dyn Remote, app: &str) -> Result<Option<LockHolder>> {
        let holder_file = format!("{}/holder.json", Self::path_for(app));
        let output = remote.run(&format!("cat {}", holder_file)).await?;
        if !output.success() {
            return Ok(None);
        }
        Ok(serde_json::from_str(output.stdout.trim()).ok())
    }

    pub async fn release(self, remote: &dyn Remote) -> Result<()> {
        remote.exec(&format!("rm -rf {}", self.path)).await?;
        debug!("Released {}", self.path);
        Ok(())
    }

    /// Release after a failed operation; the original error matters more
    pub async fn release_quietly(self, remote: &dyn Remote) {
        let path = self.path.clone();
        if let Err(e) = self.release(remote).await {
            warn!("Could not release {}: {:#}", path, e);
        }
    }

    /// Remove a lock left behind by an interrupted operation
    pub async fn force_release(remote: &dyn Remote, app: &str) -> Result<bool> {
        let path = Self::path_for(app);
        if !remote.path_exists(&path).await? {
            return Ok(false);
        }
        remote
            .sudo_exec(&format!("rm -rf {}", shell_quote(&path)))
            .await?;
        Ok(true)
    }
}

fn local_identity() -> String {
    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    let host = std::process::Command::new("hostname")
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}@{}", user, host)
}
