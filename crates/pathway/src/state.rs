//! Per-run provisioning state
//!
//! Each resource walks `Pending → Creating → AwaitingDiscovery(n) → Ready | Failed`.
//! [ProvisioningState] owns those states together with the [ResolvedCache] for the duration of
//! one run. Nothing here outlives the run. The backend keeps the durable record.
use crate::descriptor::{FieldRef, ResourceId};
use crate::resolver::ExecutionPlan;
use crate::value::{FieldPath, Value};
use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq)]
pub enum ResourceState {
    Pending,
    Creating,
    /// `outstanding` fields are still being polled
    AwaitingDiscovery { outstanding: usize },
    Ready { handle: String },
    Failed { cause: String },
}

impl ResourceState {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceState::Pending => "pending",
            ResourceState::Creating => "creating",
            ResourceState::AwaitingDiscovery { .. } => "awaiting_discovery",
            ResourceState::Ready { .. } => "ready",
            ResourceState::Failed { .. } => "failed",
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ResourceState::Ready { .. })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceState::Ready { .. } | ResourceState::Failed { .. })
    }

    /// Work on the backend is underway
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ResourceState::Creating | ResourceState::AwaitingDiscovery { .. }
        )
    }

    pub fn handle(&self) -> Option<&str> {
        match self {
            ResourceState::Ready { handle } => Some(handle),
            _ => None,
        }
    }

    pub fn can_transition_to(&self, next: &ResourceState) -> bool {
        use ResourceState::*;

        match (self, next) {
            (Pending, Creating) => true,
            // injection miss, never reached a backend
            (Pending, Failed { .. }) => true,
            (Creating, AwaitingDiscovery { .. } | Ready { .. } | Failed { .. }) => true,
            (AwaitingDiscovery { outstanding }, AwaitingDiscovery { outstanding: next }) => {
                next < outstanding
            }
            (AwaitingDiscovery { .. }, Ready { .. } | Failed { .. }) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceState::AwaitingDiscovery { outstanding } => {
                write!(f, "awaiting_discovery({outstanding})")
            }
            other => f.write_str(other.label()),
        }
    }
}

/// One discovered or returned field value
#[derive(Debug, Clone, PartialEq, derive_new::new)]
pub struct ResolvedValue {
    pub source: ResourceId,
    pub field: FieldPath,
    pub value: Value,
}

/// Write-once store of resolved field values keyed by `(source, field)`
#[derive(Debug, Clone, Default)]
pub struct ResolvedCache {
    entries: IndexMap<FieldRef, Value>,
}

impl ResolvedCache {
    pub fn insert(&mut self, resolved: ResolvedValue) -> Result<(), CacheConflict> {
        let key = FieldRef::new(resolved.source, resolved.field);
        if self.entries.contains_key(&key) {
            return Err(CacheConflict(key));
        }

        self.entries.insert(key, resolved.value);
        Ok(())
    }

    pub fn get(&self, key: &FieldRef) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Handle of a ready resource
    pub fn handle(&self, source: &ResourceId) -> Option<&Value> {
        self.get(&FieldRef::new(source.clone(), FieldPath::id()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldRef, &Value)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copy of the entries whose source satisfies `keep`
    pub fn filtered(&self, keep: impl Fn(&ResourceId) -> bool) -> Self {
        Self {
            entries: self
                .entries
                .iter()
                .filter(|(key, _)| keep(&key.source))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect(),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("`{0}` was already resolved")]
pub struct CacheConflict(pub FieldRef);

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("`{resource}` cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub resource: ResourceId,
    pub from: String,
    pub to: String,
}

/// States of every resource in a plan plus the resolved values
#[derive(Debug, Clone)]
pub struct ProvisioningState {
    states: IndexMap<ResourceId, ResourceState>,
    cache: ResolvedCache,
}

impl ProvisioningState {
    /// All plan resources start `Pending`. `seed` holds values of resources outside the plan.
    pub fn new(plan: &ExecutionPlan, seed: ResolvedCache) -> Self {
        Self {
            states: plan
                .order()
                .map(|id| (id.clone(), ResourceState::Pending))
                .collect(),
            cache: seed,
        }
    }

    pub fn state(&self, id: &ResourceId) -> Option<&ResourceState> {
        self.states.get(id)
    }

    pub fn states(&self) -> &IndexMap<ResourceId, ResourceState> {
        &self.states
    }

    pub fn cache(&self) -> &ResolvedCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut ResolvedCache {
        &mut self.cache
    }

    pub fn transition(
        &mut self,
        id: &ResourceId,
        next: ResourceState,
    ) -> Result<(), InvalidTransition> {
        let Some(current) = self.states.get_mut(id) else {
            return Err(InvalidTransition {
                resource: id.clone(),
                from: "unknown".to_string(),
                to: next.to_string(),
            });
        };

        if !current.can_transition_to(&next) {
            return Err(InvalidTransition {
                resource: id.clone(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        tracing::debug!(resource = %id, from = %current, to = %next, "state transition");
        *current = next;
        Ok(())
    }

    /// A dependency counts as ready when it is `Ready` in this run or external and seeded
    pub fn dependency_ready(&self, id: &ResourceId) -> bool {
        match self.states.get(id) {
            Some(state) => state.is_ready(),
            None => self.cache.handle(id).is_some(),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.states.values().filter(|s| s.is_in_flight()).count()
    }

    pub fn into_parts(self) -> (IndexMap<ResourceId, ResourceState>, ResolvedCache) {
        (self.states, self.cache)
    }
}
