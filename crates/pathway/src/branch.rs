//! Optional secondary plans
//!
//! A [Branch] is either [Branch::Present] with its own plan or [Branch::Absent]. A present branch
//! builds on resources of the primary plan (its anchors) and only runs once the primary run is
//! complete. An absent branch was never built, so it cannot reach the backend.
use crate::descriptor::{ResourceDescriptor, ResourceId};
use crate::executor::{Executor, RunReport};
use crate::outputs::{OutputCollector, OutputSpec, Outputs};
use crate::resolver::{ExecutionPlan, ResolveError, Resolver};

#[derive(Debug, Clone)]
pub struct BranchPlan {
    name: String,
    plan: ExecutionPlan,
    outputs: OutputCollector,
}

impl BranchPlan {
    /// `anchors` are primary plan resources the descriptors may depend on
    pub fn new(
        name: impl Into<String>,
        anchors: impl IntoIterator<Item = ResourceId>,
        descriptors: Vec<ResourceDescriptor>,
        outputs: Vec<OutputSpec>,
    ) -> Result<Self, ResolveError> {
        let resolver = anchors
            .into_iter()
            .fold(Resolver::new(), |resolver, anchor| resolver.external(anchor));

        Ok(Self {
            name: name.into(),
            plan: resolver.resolve(descriptors)?,
            outputs: OutputCollector::new(outputs),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn outputs(&self) -> &OutputCollector {
        &self.outputs
    }
}

#[derive(Debug, Clone)]
pub enum Branch {
    Present(BranchPlan),
    Absent,
}

#[derive(Debug, Clone)]
pub enum BranchOutcome {
    /// The branch is disabled
    Skipped,
    /// The primary run did not make every anchor ready
    Blocked,
    Ran { report: RunReport, outputs: Outputs },
}

impl Branch {
    /// `build` is only called when `enabled`
    pub fn when<E>(enabled: bool, build: impl FnOnce() -> Result<BranchPlan, E>) -> Result<Self, E> {
        if !enabled {
            return Ok(Branch::Absent);
        }

        build().map(Branch::Present)
    }

    pub fn is_present(&self) -> bool {
        matches!(self, Branch::Present(_))
    }

    pub fn plan(&self) -> Option<&BranchPlan> {
        match self {
            Branch::Present(plan) => Some(plan),
            Branch::Absent => None,
        }
    }

    pub async fn run(&self, executor: &Executor, primary: &RunReport) -> BranchOutcome {
        let Branch::Present(branch) = self else {
            tracing::info!("branch disabled, skipping");
            return BranchOutcome::Skipped;
        };

        let plan = &branch.plan;
        let anchors_ready = plan
            .external()
            .iter()
            .all(|anchor| primary.handle(anchor).is_some());

        if !primary.is_complete() || !anchors_ready {
            tracing::warn!(branch = branch.name(), "primary run incomplete, branch not started");
            return BranchOutcome::Blocked;
        }

        tracing::info!(branch = branch.name(), resources = plan.len(), "running branch");
        let seed = primary.cache().filtered(|id| plan.is_external(id));
        let report = executor.run_seeded(plan, seed).await;
        let outputs = branch.outputs.collect(&report);

        BranchOutcome::Ran { report, outputs }
    }
}
