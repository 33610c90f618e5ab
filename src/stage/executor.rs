use std::collections::HashSet;

use anyhow::{Context as _, Result};
use tracing::info;

use crate::error::DeployError;
use crate::output;

use super::lock::HostLock;
use super::{probe, Context, Precondition, Stage, StageId, StageOutcome};

/// Ordered stages for one operation
pub struct Plan {
    pub operation: &'static str,
    stages: Vec<Box<dyn Stage>>,
}

impl Plan {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            stages: Vec::new(),
        }
    }

    pub fn stage(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    pub fn ids(&self) -> Vec<StageId> {
        self.stages.iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }
}

pub type Report = Vec<(StageId, StageOutcome)>;

pub struct Executor<'c, 'r> {
    ctx: &'c Context<'r>,
    dry_run: bool,
}

impl<'c, 'r> Executor<'c, 'r> {
    pub fn new(ctx: &'c Context<'r>, dry_run: bool) -> Self {
        Self { ctx, dry_run }
    }

    /// Run every stage in order. The first failure aborts the plan; stages
    /// already applied stay applied.
    pub async fn run(&self, plan: &Plan) -> Result<Report> {
        if self.dry_run {
            return self.dry_run(plan).await;
        }

        self.verify_requirements(plan).await?;

        let lock = HostLock::acquire(self.ctx.remote, &self.ctx.layout.app, plan.operation).await?;
        match self.run_stages(plan).await {
            Ok(report) => {
                lock.release(self.ctx.remote).await?;
                Ok(report)
            }
            Err(e) => {
                lock.release_quietly(self.ctx.remote).await;
                Err(e)
            }
        }
    }

    async fn run_stages(&self, plan: &Plan) -> Result<Report> {
        let total = plan.len();
        let mut report = Vec::with_capacity(total);

        for (i, stage) in plan.stages.iter().enumerate() {
            let id = stage.id();
            output::step(i + 1, total, &capitalize(id.label()));

            let outcome = match stage
                .check(self.ctx)
                .await
                .with_context(|| format!("Could not inspect {} on the host", id))?
            {
                Precondition::Satisfied => {
                    output::satisfied(&format!("{} already in place", capitalize(id.label())));
                    StageOutcome::AlreadySatisfied
                }
                Precondition::NotApplicable(reason) => {
                    output::satisfied(&format!("Skipped: {}", reason));
                    StageOutcome::NotApplicable(reason)
                }
                Precondition::Pending => {
                    stage.apply(self.ctx).await.with_context(|| {
                        format!(
                            "Stage '{}' failed; later stages were not run. Fix the cause and rerun `deckhand {}`",
                            id,
                            plan.operation
                        )
                    })?;
                    StageOutcome::Applied
                }
            };

            info!("{}: {:?}", id, outcome);
            report.push((id, outcome));
        }

        Ok(report)
    }

    /// Every requirement must either run earlier in this plan or already be
    /// in place on the host.
    async fn verify_requirements(&self, plan: &Plan) -> Result<()> {
        let mut planned = HashSet::new();

        for stage in &plan.stages {
            for required in stage.requires() {
                if planned.contains(required) {
                    continue;
                }
                if !probe(*required, self.ctx).await?.is_ready() {
                    return Err(DeployError::missing(
                        format!("{} needs {} on {}", stage.id(), required, self.ctx.remote.host()),
                        format!("run `deckhand {}` first", required.operation()),
                    )
                    .into());
                }
            }
            planned.insert(stage.id());
        }

        Ok(())
    }

    async fn dry_run(&self, plan: &Plan) -> Result<Report> {
        let mut report = Vec::with_capacity(plan.len());
        let mut planned = HashSet::new();

        for stage in &plan.stages {
            let id = stage.id();

            for required in stage.requires() {
                if !planned.contains(required) && !probe(*required, self.ctx).await?.is_ready() {
                    output::warning(&format!(
                        "{} needs {} (run `deckhand {}`)",
                        id,
                        required,
                        required.operation()
                    ));
                }
            }

            let outcome = match stage.check(self.ctx).await? {
                Precondition::Satisfied => {
                    output::satisfied(&format!("{}: in place", id));
                    StageOutcome::AlreadySatisfied
                }
                Precondition::NotApplicable(reason) => {
                    output::satisfied(&format!("{}: not applicable ({})", id, reason));
                    StageOutcome::NotApplicable(reason)
                }
                Precondition::Pending => {
                    output::pending(&format!("{}: would apply", id));
                    StageOutcome::WouldApply
                }
            };

            planned.insert(id);
            report.push((id, outcome));
        }

        Ok(report)
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
