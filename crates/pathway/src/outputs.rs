//! Output collection
//!
//! Maps logical output names to resolved values. Only resources that reached `Ready` contribute.
//! A missing entry is how a caller tells that part of the run did not finish.
use crate::descriptor::{FieldRef, ResourceId};
use crate::executor::RunReport;
use crate::resolver::ExecutionPlan;
use crate::value::{FieldPath, Value};
use indexmap::IndexMap;

/// Publish `source` under `name`
#[derive(Debug, Clone, PartialEq, derive_new::new)]
pub struct OutputSpec {
    pub name: String,
    pub source: FieldRef,
}

impl OutputSpec {
    pub fn field(name: &str, source: &str, field: &str) -> Self {
        Self::new(
            name.to_string(),
            FieldRef::new(source.into(), FieldPath::parse(field)),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
#[serde(transparent)]
pub struct Outputs(IndexMap<String, Value>);

impl Outputs {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Entries of `other` are appended, existing names keep their value
    pub fn merge(&mut self, other: Outputs) {
        for (name, value) in other.0 {
            self.0.entry(name).or_insert(value);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputCollector {
    specs: Vec<OutputSpec>,
}

impl OutputCollector {
    pub fn new(specs: Vec<OutputSpec>) -> Self {
        Self { specs }
    }

    /// One output per plan resource, named after it, carrying its backend handle
    pub fn handles(plan: &ExecutionPlan) -> Self {
        Self::new(
            plan.order()
                .map(|id| {
                    OutputSpec::new(id.to_string(), FieldRef::new(id.clone(), FieldPath::id()))
                })
                .collect(),
        )
    }

    pub fn specs(&self) -> &[OutputSpec] {
        &self.specs
    }

    pub fn collect(&self, report: &RunReport) -> Outputs {
        Outputs(
            self.specs
                .iter()
                .filter(|spec| is_ready(report, &spec.source.source))
                .filter_map(|spec| {
                    let value = report.cache().get(&spec.source)?;
                    Some((spec.name.clone(), value.clone()))
                })
                .collect(),
        )
    }
}

fn is_ready(report: &RunReport, id: &ResourceId) -> bool {
    report.state(id).is_some_and(|state| state.is_ready())
}
