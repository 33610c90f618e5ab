//! Stages and the executor that sequences them.
//!
//! A stage is one idempotent unit of work: `check` queries the host without
//! changing it and `apply` makes the change. Provisioning state is never
//! recorded locally; the host is the source of truth.

pub mod context;
pub mod executor;
pub mod lock;

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;

use crate::{database, nginx, secrets, system, systemd, tls};

pub use context::Context;
pub use executor::{Executor, Plan};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageId {
    Packages,
    Identity,
    Certificate,
    Proxy,
    Supervision,
    Jobs,
    Secrets,
    Database,
    Deploy,
    CertificateUpgrade,
}

impl StageId {
    pub fn label(&self) -> &'static str {
        match self {
            StageId::Packages => "OS packages",
            StageId::Identity => "service identity",
            StageId::Certificate => "bootstrap certificate",
            StageId::Proxy => "reverse proxy",
            StageId::Supervision => "process supervision",
            StageId::Jobs => "scheduled jobs",
            StageId::Secrets => "secret bundle",
            StageId::Database => "database",
            StageId::Deploy => "deployment",
            StageId::CertificateUpgrade => "certificate upgrade",
        }
    }

    /// The command an operator runs to bring this stage about
    pub fn operation(&self) -> &'static str {
        match self {
            StageId::Packages
            | StageId::Identity
            | StageId::Certificate
            | StageId::Proxy
            | StageId::Supervision
            | StageId::Jobs => "provision",
            StageId::Secrets => "secrets",
            StageId::Database => "bootstrap-database",
            StageId::Deploy => "deploy",
            StageId::CertificateUpgrade => "upgrade-certificate",
        }
    }
}

impl fmt::Display for StageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result of a stage's precondition query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    Satisfied,
    Pending,
    /// The stage does not apply to this host at all
    NotApplicable(String),
}

impl Precondition {
    pub fn from_bool(satisfied: bool) -> Self {
        if satisfied {
            Precondition::Satisfied
        } else {
            Precondition::Pending
        }
    }

    /// Whether dependents may proceed
    pub fn is_ready(&self) -> bool {
        !matches!(self, Precondition::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Applied,
    AlreadySatisfied,
    NotApplicable(String),
    /// Dry run: the action would have run
    WouldApply,
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Stages that must be in place before this one runs
    fn requires(&self) -> &'static [StageId] {
        &[]
    }

    async fn check(&self, ctx: &Context<'_>) -> Result<Precondition>;

    async fn apply(&self, ctx: &Context<'_>) -> Result<()>;
}

/// Query whether a stage's effect is present on the host, without needing an
/// instance of the stage. Used to resolve requirements that are not part of
/// the running plan.
pub async fn probe(id: StageId, ctx: &Context<'_>) -> Result<Precondition> {
    Ok(match id {
        StageId::Packages => Precondition::from_bool(system::packages_installed(ctx).await?),
        StageId::Identity => Precondition::from_bool(system::identity_present(ctx).await?),
        StageId::Certificate => Precondition::from_bool(tls::installed(ctx).await?),
        StageId::Proxy => Precondition::from_bool(nginx::site_enabled(ctx).await?),
        StageId::Supervision => Precondition::from_bool(systemd::unit_registered(ctx).await?),
        StageId::Jobs => Precondition::from_bool(systemd::timers::registered(ctx).await?),
        StageId::Secrets => Precondition::from_bool(secrets::installed(ctx).await?),
        StageId::Database => database::state(ctx).await?,
        StageId::Deploy | StageId::CertificateUpgrade => Precondition::Pending,
    })
}
