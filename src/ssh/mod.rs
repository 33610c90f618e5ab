pub mod exec;
#[cfg(test)]
pub mod fake;
pub mod remote;

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use openssh::{KnownHosts, Session, SessionBuilder};
use tracing::{debug, warn};

use crate::config::HostConfig;
use crate::error::require_binary;

pub use remote::{CommandOutput, Remote};

pub struct SshSession {
    session: Session,
    host: String,
}

impl SshSession {
    pub async fn connect(target: &HostConfig) -> Result<Self> {
        require_binary("ssh", "install an OpenSSH client")?;

        if target.forget_stale_identity {
            forget_host_identity(&target.address, target.port);
        }

        match &target.jump {
            Some(jump) => debug!(
                "Connecting to {}@{}:{} via {}",
                target.user, target.address, target.port, jump
            ),
            None => debug!(
                "Connecting to {}@{}:{}",
                target.user, target.address, target.port
            ),
        }

        let mut builder = SessionBuilder::default();
        builder.known_hosts_check(KnownHosts::Add);
        builder.user(target.user.clone());
        builder.port(target.port);
        builder.connect_timeout(Duration::from_secs(target.connect_timeout));

        if let Some(identity) = &target.identity {
            builder.keyfile(expand_home(identity));
        }

        if let Some(jump) = &target.jump {
            builder.jump_hosts([jump]);
        }

        let session = builder.connect(&target.address).await.with_context(|| {
            format!(
                "Failed to connect to {}@{}:{} (check [host] in deckhand.toml or pass --host/--user/--identity)",
                target.user, target.address, target.port
            )
        })?;

        Ok(Self {
            session,
            host: target.address.clone(),
        })
    }

    pub async fn close(self) -> Result<()> {
        self.session
            .close()
            .await
            .with_context(|| format!("Failed to close SSH session to {}", self.host))?;
        Ok(())
    }
}

/// Drop any cached key for the host so a rebuilt machine on the same address
/// can be reached. Failures are logged and ignored.
pub fn forget_host_identity(address: &str, port: u16) {
    let Some(known_hosts) = known_hosts_path() else {
        return;
    };
    if !known_hosts.exists() {
        return;
    }

    let entry = known_hosts_entry(address, port);
    let result = Command::new("ssh-keygen")
        .arg("-R")
        .arg(&entry)
        .arg("-f")
        .arg(&known_hosts)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match result {
        Ok(status) if status.success() => debug!("Cleared cached host key for {}", entry),
        Ok(status) => debug!("ssh-keygen -R {} exited with {}", entry, status),
        Err(e) => warn!("Could not clear cached host key for {}: {}", entry, e),
    }
}

fn known_hosts_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

/// known_hosts stores non-default ports as `[host]:port`
pub fn known_hosts_entry(address: &str, port: u16) -> String {
    if port == 22 {
        address.to_string()
    } else {
        format!("[{}]:{}", address, port)
    }
}

fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Single-quote a string for bash
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_uses_bare_address() {
        assert_eq!(known_hosts_entry("203.0.113.7", 22), "203.0.113.7");
        assert_eq!(known_hosts_entry("example.org", 2222), "[example.org]:2222");
    }

    #[test]
    fn quoting_survives_embedded_single_quotes() {
        assert_eq!(shell_quote("echo 'hi'"), "'echo '\\''hi'\\'''");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[test]
    fn tilde_paths_expand_to_home() {
        let expanded = expand_home("~/.ssh/id_ed25519");
        assert!(expanded.ends_with(".ssh/id_ed25519"));
        assert_eq!(expand_home("/etc/key"), PathBuf::from("/etc/key"));
    }
}
