use anyhow::{bail, Context, Result};
use dialoguer::{Input, Select};
use minijinja::Environment;
use std::path::Path;

use crate::config::DeckhandConfig;

const TEMPLATE: &str = include_str!("../../templates/deckhand.toml.j2");

pub struct Answers {
    pub app_name: String,
    pub address: String,
    pub ssh_user: String,
    pub domain: String,
    pub mode: &'static str,
    pub repository: String,
    pub branch: String,
}

pub fn render(answers: &Answers) -> Result<String> {
    let db_name = answers.app_name.replace('-', "_");
    let server_name = if answers.domain.is_empty() {
        "_"
    } else {
        answers.domain.as_str()
    };

    let mut env = Environment::new();
    env.add_template("deckhand.toml", TEMPLATE)?;
    let tmpl = env.get_template("deckhand.toml")?;
    Ok(tmpl.render(minijinja::context! {
        app_name => answers.app_name,
        project => db_name,
        address => answers.address,
        ssh_user => answers.ssh_user,
        domain => answers.domain,
        server_name => server_name,
        db_name => db_name,
        mode => answers.mode,
        repository => answers.repository,
        branch => answers.branch,
    })?)
}

/// Render and hold the result to the same checks `load` applies
pub fn scaffold(answers: &Answers) -> Result<String> {
    let content = render(answers)?;
    DeckhandConfig::parse(&content)
        .context("Generated configuration does not parse")?
        .validate()
        .context("Generated configuration is not valid")?;
    Ok(content)
}

pub fn run(config_path: &Path) -> Result<()> {
    if config_path.exists() {
        bail!("{} already exists", config_path.display());
    }

    let default_name = std::env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_else(|| "stockwars".to_string());
    let default_repo = detect_git_remote().unwrap_or_default();

    let app_name: String = Input::new()
        .with_prompt("App name")
        .default(default_name)
        .interact_text()?;

    let address: String = Input::new()
        .with_prompt("Host address")
        .interact_text()?;

    let ssh_user: String = Input::new()
        .with_prompt("SSH user")
        .default("ubuntu".to_string())
        .interact_text()?;

    let domain: String = Input::new()
        .with_prompt("Public domain (empty if none yet)")
        .allow_empty(true)
        .interact_text()?;

    let modes = ["archive", "git"];
    let mode_idx = Select::new()
        .with_prompt("How code reaches the host")
        .items(&modes)
        .default(0)
        .interact()?;

    let repository: String = Input::new()
        .with_prompt("Git repository URL")
        .default(default_repo)
        .allow_empty(true)
        .interact_text()?;

    let branches = ["main", "master"];
    let branch_idx = Select::new()
        .with_prompt("Branch")
        .items(&branches)
        .default(0)
        .interact()?;

    let content = scaffold(&Answers {
        app_name,
        address,
        ssh_user,
        domain: domain.trim().to_string(),
        mode: modes[mode_idx],
        repository,
        branch: branches[branch_idx].to_string(),
    })?;

    std::fs::write(config_path, content)
        .with_context(|| format!("Failed to write {}", config_path.display()))?;

    crate::output::success(&format!("Created {}", config_path.display()));
    crate::output::info("Next: `deckhand provision`");

    Ok(())
}

fn detect_git_remote() -> Option<String> {
    let output = std::process::Command::new("git")
        .args(["remote", "get-url", "origin"])
        .output()
        .ok()?;

    if output.status.success() {
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn answers() -> Answers {
        Answers {
            app_name: "stockwars".into(),
            address: "203.0.113.7".into(),
            ssh_user: "ubuntu".into(),
            domain: String::new(),
            mode: "archive",
            repository: String::new(),
            branch: "main".into(),
        }
    }

    #[test]
    fn scaffold_parses_back() {
        let config = DeckhandConfig::parse(&scaffold(&answers()).unwrap()).unwrap();
        assert_eq!(config.app.name, "stockwars");
        assert_eq!(config.host.user, "ubuntu");
        assert_eq!(config.tls.common_name, None);
        assert!(config.deploy.repository.is_none());
        assert_eq!(config.jobs.len(), 5);
    }

    #[test]
    fn domain_and_repository_are_filled_in() {
        let mut a = answers();
        a.domain = "stockwars.example".into();
        a.mode = "git";
        a.repository = "git@git.example:team/stockwars.git".into();

        let config = DeckhandConfig::parse(&scaffold(&a).unwrap()).unwrap();
        assert_eq!(config.tls.common_name.as_deref(), Some("stockwars.example"));
        assert_eq!(config.proxy.server_name, "stockwars.example");
        assert_eq!(config.secrets.allowed_hosts, vec!["stockwars.example"]);
        assert_eq!(config.deploy.mode, crate::config::DeployMode::Git);
        assert_eq!(
            config.deploy.repository.as_deref(),
            Some("git@git.example:team/stockwars.git")
        );
    }

    #[test]
    fn git_mode_without_repository_is_not_written() {
        let mut a = answers();
        a.mode = "git";

        let err = scaffold(&a).unwrap_err();
        assert!(format!("{:#}", err).contains("requires deploy.repository"));
    }
}
