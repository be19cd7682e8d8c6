//! Provisioning executor
//!
//! Walks an [ExecutionPlan] and drives each resource through its state machine:
//!
//! 1. A `Pending` resource starts once every dependency is `Ready`. Its placeholders are injected
//!    from the [ResolvedCache] and it moves to `Creating`.
//! 2. `create` is issued (lookups adopt the handle from their `id` entry instead).
//! 3. Required fields missing from the create response are polled for in `AwaitingDiscovery`.
//! 4. With every field cached the resource is `Ready`, which may unblock its dependents.
//!
//! Independent resources run concurrently up to [ExecutorSettings::concurrency]. Only the
//! scheduling loop writes state and cache. Tasks report back through their join handle and a
//! progress channel.
//!
//! A failure stops the subtree below the failed resource. Everything else keeps going, and nothing
//! that is already live gets deleted.
use crate::backend::{BackendError, ProvisioningBackend};
use crate::descriptor::{FieldRef, Mode, ResourceDescriptor, ResourceId, ResourceKind};
use crate::discovery::{self, DiscoveryError, DiscoveryQuery, RetryPolicy};
use crate::error::ProvisioningFailed;
use crate::outputs::Outputs;
use crate::resolver::ExecutionPlan;
use crate::state::{ProvisioningState, ResolvedCache, ResolvedValue, ResourceState};
use crate::value::{FieldPath, Value};
use indexmap::IndexMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorSettings {
    /// Resources in `Creating`/`AwaitingDiscovery` at the same time, at least one
    pub concurrency: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum FailureCause {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("`{field}` did not appear after {attempts} attempts")]
    DiscoveryTimeout { field: FieldPath, attempts: u32 },
    #[error("run was cancelled before this resource started")]
    Cancelled,
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl From<DiscoveryError> for FailureCause {
    fn from(value: DiscoveryError) -> Self {
        match value {
            DiscoveryError::Timeout {
                field, attempts, ..
            } => FailureCause::DiscoveryTimeout { field, attempts },
            DiscoveryError::Backend(err) => FailureCause::Backend(err),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceFailure {
    pub resource: ResourceId,
    pub cause: FailureCause,
}

/// A resource that reached `Ready` and is live on the backend
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct LiveResource {
    pub id: ResourceId,
    pub kind: ResourceKind,
    pub handle: String,
}

/// Everything one run left behind
#[derive(Debug, Clone)]
pub struct RunReport {
    states: IndexMap<ResourceId, ResourceState>,
    kinds: IndexMap<ResourceId, ResourceKind>,
    cache: ResolvedCache,
    failures: Vec<ResourceFailure>,
    cancelled: bool,
}

impl RunReport {
    pub fn states(&self) -> &IndexMap<ResourceId, ResourceState> {
        &self.states
    }

    pub fn state(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.states.get(id)
    }

    pub fn cache(&self) -> &ResolvedCache {
        &self.cache
    }

    /// Failures in the order they happened
    pub fn failures(&self) -> &[ResourceFailure] {
        &self.failures
    }

    pub fn first_failure(&self) -> Option<&ResourceFailure> {
        self.failures.first()
    }

    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Every resource of the plan is `Ready`
    pub fn is_complete(&self) -> bool {
        self.states.values().all(ResourceState::is_ready)
    }

    pub fn handle(&self, id: &ResourceId) -> Option<&str> {
        self.states.get(id).and_then(ResourceState::handle)
    }

    /// Ready resources in plan order
    pub fn live(&self) -> Vec<LiveResource> {
        self.states
            .iter()
            .filter_map(|(id, state)| {
                Some(LiveResource {
                    id: id.clone(),
                    kind: self.kinds.get(id)?.clone(),
                    handle: state.handle()?.to_string(),
                })
            })
            .collect()
    }

    /// `Ok` only when the run is complete
    ///
    /// Otherwise names the first failed resource. A cancelled run names the first resource that
    /// never started.
    pub fn into_result(self) -> Result<Self, ProvisioningFailed> {
        if self.is_complete() {
            return Ok(self);
        }

        let (resource, cause) = match self.failures.first() {
            Some(failure) => (failure.resource.clone(), failure.cause.clone()),
            None => {
                let (id, state) = self
                    .states
                    .iter()
                    .find(|(_, state)| !state.is_ready())
                    .map(|(id, state)| (id.clone(), state.clone()))
                    .unwrap_or_else(|| (ResourceId::from("unknown"), ResourceState::Pending));

                let cause = if self.cancelled && state == ResourceState::Pending {
                    FailureCause::Cancelled
                } else {
                    FailureCause::Internal(format!("`{id}` stopped in state {state}"))
                };
                (id, cause)
            }
        };

        Err(ProvisioningFailed {
            resource,
            cause,
            live: self.live(),
            outputs: Outputs::default(),
        })
    }
}

/// Result of provisioning a single resource
struct Provisioned {
    handle: String,
    resolved: Vec<ResolvedValue>,
    discovery_attempts: u32,
}

type Progress = mpsc::UnboundedSender<(ResourceId, usize)>;

/// Everything a task needs, detached from the plan
struct Job {
    id: ResourceId,
    kind: ResourceKind,
    mode: Mode,
    config: Value,
    required: Vec<FieldPath>,
}

impl Job {
    async fn run(
        self,
        backend: &dyn ProvisioningBackend,
        retry: &RetryPolicy,
        progress: &Progress,
    ) -> Result<Provisioned, FailureCause> {
        let (handle, attributes) = match self.mode {
            Mode::Create => {
                tracing::debug!(resource = %self.id, kind = %self.kind, "create");
                let created = backend.create(&self.kind, &self.config).await?;
                (created.handle, Some(created.attributes))
            }
            Mode::Lookup => {
                let handle = self
                    .config
                    .lookup(&FieldPath::id())
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        FailureCause::Internal(format!("lookup `{}` has no string id", self.id))
                    })?;
                tracing::debug!(resource = %self.id, kind = %self.kind, handle, "adopt");
                (handle.to_string(), None)
            }
        };

        let mut resolved = vec![ResolvedValue::new(
            self.id.clone(),
            FieldPath::id(),
            Value::from(handle.clone()),
        )];
        let mut queries = vec![];
        for field in &self.required {
            match attributes.as_ref().and_then(|a| a.lookup(field)) {
                Some(value) => resolved.push(ResolvedValue::new(
                    self.id.clone(),
                    field.clone(),
                    value.clone(),
                )),
                None => queries.push(DiscoveryQuery::new(
                    self.id.clone(),
                    handle.clone(),
                    field.clone(),
                )),
            }
        }

        let mut discovery_attempts = 0;
        if !queries.is_empty() {
            // receiver outlives every task
            let _ = progress.send((self.id.clone(), queries.len()));
            let discovered = discovery::poll(backend, retry, &queries, |left| {
                let _ = progress.send((self.id.clone(), left));
            })
            .await?;

            discovery_attempts = discovered.attempts;
            resolved.extend(discovered.values);
        }

        Ok(Provisioned {
            handle,
            resolved,
            discovery_attempts,
        })
    }
}

pub struct Executor {
    backend: Arc<dyn ProvisioningBackend>,
    settings: ExecutorSettings,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(backend: Arc<dyn ProvisioningBackend>, settings: ExecutorSettings) -> Self {
        Self {
            backend,
            settings,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Raising this token stops resources from starting. In-flight work still finishes.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn settings(&self) -> &ExecutorSettings {
        &self.settings
    }

    pub async fn run(&self, plan: &ExecutionPlan) -> RunReport {
        self.run_seeded(plan, ResolvedCache::default()).await
    }

    /// Run `plan` with values of resources outside the plan already in the cache
    #[tracing::instrument(level = "info", skip_all, fields(resources = plan.len()))]
    pub async fn run_seeded(&self, plan: &ExecutionPlan, seed: ResolvedCache) -> RunReport {
        let mut state = ProvisioningState::new(plan, seed);
        let mut failures: Vec<ResourceFailure> = vec![];
        let mut tasks: JoinSet<(ResourceId, Result<Provisioned, FailureCause>)> = JoinSet::new();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let mut cancelled = false;

        loop {
            if self.cancel.is_cancelled() {
                if !cancelled {
                    tracing::info!(
                        in_flight = tasks.len(),
                        "cancelled, waiting for in-flight resources"
                    );
                    cancelled = true;
                }
            } else {
                self.start_ready(plan, &mut state, &mut tasks, &progress_tx, &mut failures);
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                Some((resource, outstanding)) = progress_rx.recv() => {
                    let next = ResourceState::AwaitingDiscovery { outstanding };
                    if let Err(err) = state.transition(&resource, next) {
                        tracing::trace!(%err, "stale discovery progress");
                    }
                }
                Some(joined) = tasks.join_next() => match joined {
                    Ok((resource, Ok(provisioned))) => {
                        tracing::info!(
                            %resource,
                            handle = %provisioned.handle,
                            discovery_attempts = provisioned.discovery_attempts,
                            "ready"
                        );
                        for value in provisioned.resolved {
                            if let Err(conflict) = state.cache_mut().insert(value) {
                                tracing::error!(%conflict, "resolved value written twice");
                            }
                        }
                        advance(&mut state, &resource, ResourceState::Ready { handle: provisioned.handle });
                    }
                    Ok((resource, Err(cause))) => {
                        tracing::warn!(%resource, %cause, "provisioning failed");
                        advance(&mut state, &resource, ResourceState::Failed { cause: cause.to_string() });
                        failures.push(ResourceFailure { resource, cause });
                    }
                    Err(join_error) => {
                        tracing::error!(%join_error, "provisioning task aborted");
                    }
                },
            }
        }

        let (states, cache) = state.into_parts();
        let report = RunReport {
            kinds: plan
                .steps()
                .iter()
                .map(|step| (step.id().clone(), step.kind().clone()))
                .collect(),
            states,
            cache,
            failures,
            cancelled,
        };

        tracing::info!(
            complete = report.is_complete(),
            live = report.live().len(),
            failed = report.failures().len(),
            cancelled,
            "run finished"
        );
        report
    }

    /// Start every startable resource, in plan order, while there is capacity
    fn start_ready(
        &self,
        plan: &ExecutionPlan,
        state: &mut ProvisioningState,
        tasks: &mut JoinSet<(ResourceId, Result<Provisioned, FailureCause>)>,
        progress: &Progress,
        failures: &mut Vec<ResourceFailure>,
    ) {
        let limit = self.settings.concurrency.max(1);

        for descriptor in plan.steps() {
            if tasks.len() >= limit {
                break;
            }

            if !self.startable(descriptor, state) {
                continue;
            }

            let id = descriptor.id();
            let injected = {
                let cache = state.cache();
                descriptor.inject(&|reference: &FieldRef| cache.get(reference).cloned())
            };

            let config = match injected {
                Ok(config) => config,
                Err(miss) => {
                    let cause = FailureCause::Internal(format!("no resolved value for `{miss}`"));
                    tracing::error!(resource = %id, %cause, "injection failed");
                    advance(state, id, ResourceState::Failed { cause: cause.to_string() });
                    failures.push(ResourceFailure {
                        resource: id.clone(),
                        cause,
                    });
                    continue;
                }
            };

            advance(state, id, ResourceState::Creating);

            let job = Job {
                id: id.clone(),
                kind: descriptor.kind().clone(),
                mode: descriptor.mode(),
                config,
                required: plan.required_fields(id).to_vec(),
            };
            let backend = Arc::clone(&self.backend);
            let retry = self.settings.retry.clone();
            let progress = progress.clone();

            tasks.spawn(async move {
                let id = job.id.clone();
                let result = job.run(backend.as_ref(), &retry, &progress).await;
                (id, result)
            });
        }
    }

    fn startable(&self, descriptor: &ResourceDescriptor, state: &ProvisioningState) -> bool {
        state.state(descriptor.id()) == Some(&ResourceState::Pending)
            && descriptor
                .depends_on()
                .iter()
                .all(|dependency| state.dependency_ready(dependency))
    }
}

fn advance(state: &mut ProvisioningState, id: &ResourceId, next: ResourceState) {
    if let Err(err) = state.transition(id, next) {
        tracing::error!(%err, "rejected state transition");
    }
}
