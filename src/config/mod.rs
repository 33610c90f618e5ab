use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::DeployError;

mod layout;
mod validate;

pub use layout::Layout;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeckhandConfig {
    pub app: AppConfig,
    pub host: HostConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub deploy: DeployConfig,
    #[serde(default = "default_jobs")]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub name: String,
    /// Django project package holding `asgi.py` and `settings.py`
    #[serde(default = "default_project")]
    pub project: String,
    /// Service identity; defaults to the app name
    pub user: Option<String>,
    /// Full command line overriding the default daphne entrypoint
    pub entrypoint: Option<String>,
    #[serde(default = "default_restart_sec")]
    pub restart_sec: u32,
}

fn default_project() -> String {
    "stockwars".to_string()
}

fn default_restart_sec() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    pub address: String,
    #[serde(default = "default_ssh_user")]
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Private key file; `~/` is expanded
    pub identity: Option<String>,
    pub jump: Option<String>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_true")]
    pub forget_stale_identity: bool,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PathsConfig {
    pub base: Option<String>,
    pub env_dir: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub common_name: Option<String>,
    /// Directory holding CA-issued material as `<domain>/{fullchain,privkey}.pem`
    #[serde(default = "default_issued_dir")]
    pub issued_dir: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            common_name: None,
            issued_dir: default_issued_dir(),
        }
    }
}

fn default_issued_dir() -> String {
    "/etc/letsencrypt/live".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    #[serde(default = "default_server_name")]
    pub server_name: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
    #[serde(default = "default_max_body")]
    pub max_body_size: String,
    #[serde(default = "default_acme_root")]
    pub acme_root: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server_name: default_server_name(),
            http_port: default_http_port(),
            https_port: default_https_port(),
            max_body_size: default_max_body(),
            acme_root: default_acme_root(),
        }
    }
}

fn default_server_name() -> String {
    "_".to_string()
}
fn default_http_port() -> u16 {
    80
}
fn default_https_port() -> u16 {
    443
}
fn default_max_body() -> String {
    "10m".to_string()
}
fn default_acme_root() -> String {
    "/var/www/letsencrypt".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Left unset, the host is asked for when secrets are distributed
    pub host: Option<String>,
    #[serde(default = "default_db_port")]
    pub port: u16,
    #[serde(default = "default_db_name")]
    pub name: String,
    #[serde(default = "default_db_name")]
    pub user: String,
    #[serde(default = "default_conn_max_age")]
    pub conn_max_age: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: default_db_port(),
            name: default_db_name(),
            user: default_db_name(),
            conn_max_age: default_conn_max_age(),
        }
    }
}

fn default_db_port() -> u16 {
    5432
}
fn default_db_name() -> String {
    "stockwars".to_string()
}
fn default_conn_max_age() -> u32 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretsConfig {
    #[serde(default)]
    pub debug: bool,
    /// Left empty, the list is asked for when secrets are distributed
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    #[serde(default = "default_max_quote_age")]
    pub max_quote_age_seconds: u32,
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            debug: false,
            allowed_hosts: Vec::new(),
            max_quote_age_seconds: default_max_quote_age(),
        }
    }
}

fn default_max_quote_age() -> u32 {
    300
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    /// Build a tarball locally and replace the remote code tree
    Archive,
    /// Fast-forward a checkout on the host
    Git,
}

impl DeployMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployMode::Archive => "archive",
            DeployMode::Git => "git",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeployConfig {
    #[serde(default = "default_mode")]
    pub mode: DeployMode,
    /// Local project directory for archive mode
    #[serde(default = "default_source")]
    pub source: PathBuf,
    pub repository: Option<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub extra_packages: Vec<String>,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            source: default_source(),
            repository: None,
            branch: default_branch(),
            exclude: default_excludes(),
            extra_packages: Vec::new(),
        }
    }
}

fn default_mode() -> DeployMode {
    DeployMode::Archive
}

fn default_source() -> PathBuf {
    PathBuf::from(".")
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_excludes() -> Vec<String> {
    [
        ".git",
        ".venv",
        "venv",
        "__pycache__",
        "*.pyc",
        "node_modules",
        ".env*",
        "staticfiles",
        "media",
        "deckhand.toml",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobConfig {
    pub name: String,
    /// `manage.py` subcommand
    pub command: String,
    /// systemd `OnCalendar=` expression
    pub schedule: String,
}

fn default_jobs() -> Vec<JobConfig> {
    [
        ("fetch-quotes", "fetch_latest_quotes_for_active_competitions", "minutely"),
        ("enforce-rules", "enforce_advanced_rules", "minutely"),
        ("auto-close", "auto_close_advanced_positions", "minutely"),
        ("snapshots", "compute_portfolio_snapshots", "*:0/5"),
        ("close-competitions", "close_and_lock_finished_competitions", "*:0/5"),
    ]
    .iter()
    .map(|(name, command, schedule)| JobConfig {
        name: name.to_string(),
        command: command.to_string(),
        schedule: schedule.to_string(),
    })
    .collect()
}

/// Connection settings given on the command line
#[derive(Debug, Default, Clone)]
pub struct HostOverrides {
    pub address: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity: Option<String>,
}

impl DeckhandConfig {
    pub fn load(path: &Path, overrides: &HostOverrides) -> Result<Self> {
        if !path.exists() {
            return Err(DeployError::missing(
                format!("config file {}", path.display()),
                "run `deckhand init` to create one, or pass --config",
            )
            .into());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let mut config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.apply_overrides(overrides);
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate::validate(self)
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_overrides(&mut self, overrides: &HostOverrides) {
        if let Some(address) = &overrides.address {
            self.host.address = address.clone();
        }
        if let Some(user) = &overrides.user {
            self.host.user = user.clone();
        }
        if let Some(port) = overrides.port {
            self.host.port = port;
        }
        if let Some(identity) = &overrides.identity {
            self.host.identity = Some(identity.clone());
        }
    }

    pub fn service_user(&self) -> &str {
        self.app.user.as_deref().unwrap_or(&self.app.name)
    }

    pub fn layout(&self) -> Layout {
        Layout::new(self)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const MINIMAL: &str = r#"
[app]
name = "stockwars"

[host]
address = "203.0.113.7"
user = "ubuntu"
"#;

    pub fn minimal() -> DeckhandConfig {
        DeckhandConfig::parse(MINIMAL).unwrap()
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let config = minimal();
        assert_eq!(config.service_user(), "stockwars");
        assert_eq!(config.host.port, 22);
        assert!(config.host.forget_stale_identity);
        assert_eq!(config.deploy.mode, DeployMode::Archive);
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.secrets.max_quote_age_seconds, 300);
        assert_eq!(config.jobs.len(), 5);
        assert!(config.database.host.is_none());
    }

    #[test]
    fn empty_jobs_list_disables_timers() {
        let config = DeckhandConfig::parse(&format!("jobs = []\n{}", MINIMAL)).unwrap();
        assert!(config.jobs.is_empty());
    }

    #[test]
    fn overrides_replace_host_fields() {
        let mut config = minimal();
        config.apply_overrides(&HostOverrides {
            address: Some("198.51.100.2".into()),
            port: Some(2222),
            ..Default::default()
        });
        assert_eq!(config.host.address, "198.51.100.2");
        assert_eq!(config.host.port, 2222);
        assert_eq!(config.host.user, "ubuntu");
    }

    #[test]
    fn missing_config_file_is_a_prerequisite_error() {
        let err = DeckhandConfig::load(Path::new("/nonexistent/deckhand.toml"), &HostOverrides::default())
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<DeployError>(),
            Some(DeployError::MissingPrerequisite { .. })
        ));
    }
}
