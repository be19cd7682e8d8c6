//! Dependency resolution
//!
//! Turns a descriptor set into an [ExecutionPlan] with Kahn's algorithm. Whenever several
//! descriptors are ready at once the one declared first wins, so the same input always yields the
//! same plan.
//!
//! Resolution happens before any backend call. Every error here means nothing was provisioned.
use crate::descriptor::{ResourceDescriptor, ResourceId};
use crate::value::FieldPath;
use indexmap::{IndexMap, IndexSet};
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Descriptors in creation order
///
/// Every descriptor appears strictly after all of its dependencies.
#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    steps: Vec<ResourceDescriptor>,
    /// Non-id fields each resource has to make available, in first-use order
    required: IndexMap<ResourceId, Vec<FieldPath>>,
    /// Resources outside this plan that are expected to be live already
    external: IndexSet<ResourceId>,
}

impl ExecutionPlan {
    pub fn steps(&self) -> &[ResourceDescriptor] {
        &self.steps
    }

    pub fn order(&self) -> impl Iterator<Item = &ResourceId> {
        self.steps.iter().map(ResourceDescriptor::id)
    }

    pub fn get(&self, id: &ResourceId) -> Option<&ResourceDescriptor> {
        self.steps.iter().find(|step| step.id() == id)
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.get(id).is_some()
    }

    pub fn required_fields(&self, id: &ResourceId) -> &[FieldPath] {
        self.required.get(id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn external(&self) -> &IndexSet<ResourceId> {
        &self.external
    }

    pub fn is_external(&self, id: &ResourceId) -> bool {
        self.external.contains(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Position of `id` in the plan
    pub fn position(&self, id: &ResourceId) -> Option<usize> {
        self.steps.iter().position(|step| step.id() == id)
    }
}

/// Builds [ExecutionPlan]s
#[derive(Debug, Default, Clone)]
pub struct Resolver {
    external: IndexSet<ResourceId>,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept dependencies on `id` although it is not part of the descriptor set
    ///
    /// Used for plans that run after another plan and build on its resources.
    pub fn external(mut self, id: impl Into<ResourceId>) -> Self {
        self.external.insert(id.into());
        self
    }

    #[tracing::instrument(level = "debug", skip_all, fields(descriptors = descriptors.len()))]
    pub fn resolve(
        &self,
        descriptors: Vec<ResourceDescriptor>,
    ) -> Result<ExecutionPlan, ResolveError> {
        let mut index: IndexMap<ResourceId, usize> = IndexMap::with_capacity(descriptors.len());
        for (position, descriptor) in descriptors.iter().enumerate() {
            if index.insert(descriptor.id().clone(), position).is_some()
                || self.external.contains(descriptor.id())
            {
                return Err(ResolveError::DuplicateResource(descriptor.id().clone()));
            }
        }

        // edges[i] = descriptors that have to wait for i
        let n = descriptors.len();
        let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
        let mut in_degree: Vec<usize> = vec![0; n];

        for (position, descriptor) in descriptors.iter().enumerate() {
            for dependency in descriptor.depends_on() {
                if let Some(&dependency_position) = index.get(dependency) {
                    edges[dependency_position].push(position);
                    in_degree[position] += 1;
                } else if !self.external.contains(dependency) {
                    return Err(ResolveError::UnknownDependency {
                        resource: descriptor.id().clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }

        // min-heap on declaration position
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|(_, degree)| **degree == 0)
            .map(|(position, _)| Reverse(position))
            .collect();

        let mut sorted: Vec<usize> = Vec::with_capacity(n);
        while let Some(Reverse(position)) = ready.pop() {
            sorted.push(position);
            for &next in &edges[position] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        if sorted.len() != n {
            let participants = cycle_participants(&edges, &in_degree)
                .into_iter()
                .map(|position| descriptors[position].id().clone())
                .collect();
            return Err(ResolveError::CyclicDependency { participants });
        }

        let mut required: IndexMap<ResourceId, Vec<FieldPath>> = IndexMap::new();
        for descriptor in &descriptors {
            let fields = required.entry(descriptor.id().clone()).or_default();
            for field in descriptor.exposes() {
                if !fields.contains(field) {
                    fields.push(field.clone());
                }
            }
        }
        for &position in &sorted {
            for reference in descriptors[position].placeholders() {
                if reference.field.is_id() {
                    continue;
                }
                if let Some(fields) = required.get_mut(&reference.source) {
                    if !fields.contains(&reference.field) {
                        fields.push(reference.field.clone());
                    }
                }
            }
        }

        let mut slots: Vec<Option<ResourceDescriptor>> = descriptors.into_iter().map(Some).collect();
        let steps: Vec<ResourceDescriptor> = sorted
            .iter()
            .filter_map(|&position| slots[position].take())
            .collect();

        tracing::debug!(order = ?steps.iter().map(|s| s.id().as_str()).collect::<Vec<_>>(), "plan resolved");

        Ok(ExecutionPlan {
            steps,
            required,
            external: self.external.clone(),
        })
    }
}

/// Shorthand for `Resolver::new().resolve(descriptors)`
pub fn resolve(descriptors: Vec<ResourceDescriptor>) -> Result<ExecutionPlan, ResolveError> {
    Resolver::new().resolve(descriptors)
}

/// Nodes left over by Kahn's algorithm that sit on a cycle, in declaration order
///
/// Leftovers also include nodes that merely depend on a cycle. Those are not participants.
fn cycle_participants(edges: &[Vec<usize>], in_degree: &[usize]) -> Vec<usize> {
    let leftover: Vec<bool> = in_degree.iter().map(|degree| *degree > 0).collect();

    (0..edges.len())
        .filter(|&start| leftover[start] && reaches(edges, &leftover, start, start))
        .collect()
}

fn reaches(edges: &[Vec<usize>], leftover: &[bool], from: usize, target: usize) -> bool {
    let mut seen = vec![false; edges.len()];
    let mut stack = vec![from];

    while let Some(node) = stack.pop() {
        for &next in &edges[node] {
            if next == target {
                return true;
            }
            if leftover[next] && !seen[next] {
                seen[next] = true;
                stack.push(next);
            }
        }
    }

    false
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("resource `{0}` is declared more than once")]
    DuplicateResource(ResourceId),
    #[error("`{resource}` depends on unknown resource `{dependency}`")]
    UnknownDependency {
        resource: ResourceId,
        dependency: ResourceId,
    },
    #[error("cyclic dependency between {}", join_ids(.participants))]
    CyclicDependency { participants: Vec<ResourceId> },
}

fn join_ids(ids: &[ResourceId]) -> String {
    ids.iter()
        .map(|id| format!("`{id}`"))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::descriptor::ConfigValue;
    use pretty_assertions::assert_eq;

    fn node(id: &str, deps: &[&str]) -> ResourceDescriptor {
        deps.iter()
            .fold(ResourceDescriptor::builder(id, "test:node"), |b, dep| {
                b.depends_on(*dep)
            })
            .build()
            .unwrap()
    }

    fn order(plan: &ExecutionPlan) -> Vec<&str> {
        plan.order().map(ResourceId::as_str).collect()
    }

    #[test]
    fn independent_descriptors_keep_declaration_order() {
        let plan = resolve(vec![node("c", &[]), node("a", &[]), node("b", &[])]).unwrap();
        assert_eq!(order(&plan), vec!["c", "a", "b"]);
    }

    #[test]
    fn dependencies_come_first() {
        let plan = resolve(vec![
            node("listener", &["load_balancer", "target_group"]),
            node("target_group", &[]),
            node("load_balancer", &["address"]),
            node("address", &[]),
        ])
        .unwrap();

        assert_eq!(
            order(&plan),
            vec!["target_group", "address", "load_balancer", "listener"]
        );
    }

    #[test]
    fn resolution_is_deterministic() {
        let build = || {
            vec![
                node("d", &["a"]),
                node("a", &[]),
                node("c", &["a"]),
                node("b", &[]),
                node("e", &["b", "c"]),
            ]
        };

        let first = resolve(build()).unwrap();
        for _ in 0..16 {
            assert_eq!(order(&resolve(build()).unwrap()), order(&first));
        }
    }

    #[test]
    fn cycle_names_all_participants() {
        let err = resolve(vec![
            node("a", &["c"]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("downstream", &["c"]),
            node("free", &[]),
        ])
        .unwrap_err();

        assert_eq!(
            err,
            ResolveError::CyclicDependency {
                participants: vec!["a".into(), "b".into(), "c".into()]
            }
        );
        assert_eq!(
            err.to_string(),
            "cyclic dependency between `a`, `b`, `c`"
        );
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let err = resolve(vec![node("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            ResolveError::CyclicDependency {
                participants: vec!["a".into()]
            }
        );
    }

    #[test]
    fn unknown_dependency() {
        let err = resolve(vec![node("a", &[]), node("b", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            ResolveError::UnknownDependency {
                resource: "b".into(),
                dependency: "ghost".into()
            }
        );
    }

    #[test]
    fn external_dependency_is_accepted() {
        let plan = Resolver::new()
            .external("listener")
            .resolve(vec![node("accelerator", &["listener"])])
            .unwrap();
        assert_eq!(order(&plan), vec!["accelerator"]);
        assert!(plan.is_external(&"listener".into()));
    }

    #[test]
    fn duplicate_resource() {
        let err = resolve(vec![node("a", &[]), node("a", &[])]).unwrap_err();
        assert_eq!(err, ResolveError::DuplicateResource("a".into()));
    }

    #[test]
    fn required_fields_include_exposed_and_referenced() {
        let a = ResourceDescriptor::builder("a", "test:a")
            .expose("dns_name")
            .build()
            .unwrap();
        let b = ResourceDescriptor::builder("b", "test:b")
            .config("ip", ConfigValue::pending("a", "ip"))
            .config("handle", ConfigValue::pending("a", "id"))
            .config("dns", ConfigValue::pending("a", "dns_name"))
            .depends_on("a")
            .build()
            .unwrap();

        let plan = resolve(vec![b, a]).unwrap();
        assert_eq!(
            plan.required_fields(&"a".into()),
            &[FieldPath::parse("dns_name"), FieldPath::parse("ip")]
        );
        assert!(plan.required_fields(&"b".into()).is_empty());
    }
}
