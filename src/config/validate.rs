use anyhow::{bail, Result};
use std::collections::HashSet;

use super::{DeckhandConfig, DeployMode};

pub fn validate(config: &DeckhandConfig) -> Result<()> {
    if !is_unit_name(&config.app.name) {
        bail!(
            "app.name '{}' must start with a lowercase letter and contain only a-z, 0-9, '-' or '_'",
            config.app.name
        );
    }

    if !is_unit_name(config.service_user()) {
        bail!("app.user '{}' is not a valid account name", config.service_user());
    }

    if !is_python_module(&config.app.project) {
        bail!("app.project '{}' is not a Python module name", config.app.project);
    }

    if config.host.address.trim().is_empty() {
        bail!("host.address cannot be empty (set it in deckhand.toml or pass --host)");
    }

    if config.host.user.trim().is_empty() {
        bail!("host.user cannot be empty");
    }

    // these land unquoted in root shell commands and in the nginx site
    for (field, value) in [
        ("paths.base", config.paths.base.as_deref()),
        ("paths.env_dir", config.paths.env_dir.as_deref()),
        ("proxy.acme_root", Some(config.proxy.acme_root.as_str())),
        ("tls.issued_dir", Some(config.tls.issued_dir.as_str())),
    ] {
        if let Some(path) = value {
            if !is_plain_path(path) {
                bail!(
                    "{} must be an absolute path of letters, digits, '.', '_', '-' and '/', got '{}'",
                    field,
                    path
                );
            }
        }
    }

    if !is_server_names(&config.proxy.server_name) {
        bail!(
            "proxy.server_name '{}' must be '_' or space-separated host names",
            config.proxy.server_name
        );
    }

    if !is_body_size(&config.proxy.max_body_size) {
        bail!(
            "proxy.max_body_size '{}' must be a number with an optional k, m or g suffix",
            config.proxy.max_body_size
        );
    }

    if let Some(entrypoint) = &config.app.entrypoint {
        if entrypoint.trim().is_empty() || entrypoint.chars().any(char::is_control) {
            bail!("app.entrypoint must be a single non-empty line");
        }
    }

    if !is_sql_identifier(&config.database.name) {
        bail!(
            "database.name '{}' must match [a-z_][a-z0-9_]* (at most 63 characters)",
            config.database.name
        );
    }

    if !is_sql_identifier(&config.database.user) {
        bail!(
            "database.user '{}' must match [a-z_][a-z0-9_]* (at most 63 characters)",
            config.database.user
        );
    }

    if config.deploy.mode == DeployMode::Git && config.deploy.repository.is_none() {
        bail!("deploy.mode = \"git\" requires deploy.repository");
    }

    if let Some(repository) = &config.deploy.repository {
        if !is_repository(repository) {
            bail!(
                "deploy.repository '{}' must be a git URL without spaces or shell characters",
                repository
            );
        }
    }

    if !is_branch(&config.deploy.branch) {
        bail!(
            "deploy.branch '{}' must contain only letters, digits, '.', '_', '-' and '/'",
            config.deploy.branch
        );
    }

    for package in &config.deploy.extra_packages {
        if !is_package_name(package) {
            bail!("deploy.extra_packages: '{}' is not a Debian package name", package);
        }
    }

    for pattern in &config.deploy.exclude {
        if let Err(e) = glob::Pattern::new(pattern) {
            bail!("deploy.exclude: '{}' is not a valid pattern: {}", pattern, e);
        }
    }

    let mut job_names = HashSet::new();
    for job in &config.jobs {
        if !is_unit_name(&job.name) {
            bail!("jobs: '{}' is not a valid job name", job.name);
        }
        if !job_names.insert(job.name.as_str()) {
            bail!("jobs: '{}' is defined twice", job.name);
        }
        if !is_python_module(&job.command) {
            bail!("jobs.{}: command '{}' is not a manage.py subcommand", job.name, job.command);
        }
        if !is_calendar(&job.schedule) {
            bail!(
                "jobs.{}: schedule '{}' is not a systemd calendar expression",
                job.name,
                job.schedule
            );
        }
    }

    Ok(())
}

fn is_unit_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && s.len() <= 32
}

fn is_python_module(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn is_plain_path(s: &str) -> bool {
    s.starts_with('/')
        && !s.contains("..")
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '.' | '_' | '-'))
}

fn is_server_names(s: &str) -> bool {
    !s.trim().is_empty()
        && s.split(' ').filter(|n| !n.is_empty()).all(|name| {
            name.chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*'))
        })
}

fn is_body_size(s: &str) -> bool {
    let digits = s.trim_end_matches(['k', 'K', 'm', 'M', 'g', 'G']);
    !digits.is_empty() && s.len() - digits.len() <= 1 && digits.chars().all(|c| c.is_ascii_digit())
}

fn is_repository(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/' | ':' | '@' | '~' | '+' | '%')
        })
}

/// Stricter than git's own rules; enough for real branch names
fn is_branch(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('-')
        && !s.contains("..")
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '/'))
}

fn is_package_name(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit())
        && s.len() >= 2
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.'))
}

/// `OnCalendar=` shapes: `minutely`, `*:0/5`, `Mon..Fri *-*-* 09:00:00`
fn is_calendar(s: &str) -> bool {
    !s.trim().is_empty()
        && s.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '*' | ':' | '/' | '-' | '.' | ',' | '~')
        })
}

fn is_sql_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        && s.len() <= 63
}
