//! Randomized graphs
//!
//! Every generated graph is provisioned against a backend that rejects a create call whose
//! injected dependency handles it has not handed out yet.

use async_trait::async_trait;
use parking_lot::Mutex;
use pathway::backend::{BackendError, Created, ProvisioningBackend};
use pathway::descriptor::{ConfigValue, ResourceDescriptor, ResourceKind};
use pathway::discovery::RetryPolicy;
use pathway::executor::{Executor, ExecutorSettings, FailureCause};
use pathway::resolver::{self, ResolveError};
use pathway::value::{FieldPath, Value};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const GRAPHS: u64 = 1_000;

/// Hands out `h-<name>` and serves `value` either right away or one describe later
#[derive(Default)]
struct OrderCheckingBackend {
    created: Mutex<HashSet<String>>,
    described: Mutex<HashMap<String, u32>>,
}

fn value_of(handle: &str) -> Value {
    Value::from([("value", format!("v:{handle}"))])
}

#[async_trait]
impl ProvisioningBackend for OrderCheckingBackend {
    async fn create(&self, _: &ResourceKind, config: &Value) -> Result<Created, BackendError> {
        let mut created = self.created.lock();

        let deps = match config.lookup(&FieldPath::parse("deps")) {
            Some(Value::Array(deps)) => deps.clone(),
            _ => vec![],
        };
        for dep in &deps {
            if !dep.as_str().is_some_and(|handle| created.contains(handle)) {
                return Err(BackendError::new("Ordering", format!("{dep} does not exist yet")));
            }
        }

        if let Some(Value::Array(values)) = config.lookup(&FieldPath::parse("values")) {
            for value in values {
                if !value.as_str().is_some_and(|v| v.starts_with("v:h-")) {
                    return Err(BackendError::new("Injection", format!("unexpected {value}")));
                }
            }
        }

        let name = config
            .lookup(&FieldPath::parse("name"))
            .map(Value::to_string)
            .unwrap_or_default();
        let handle = format!("h-{name}");
        created.insert(handle.clone());

        let late = name.len() % 2 == 0;
        let attributes = if late { Value::object() } else { value_of(&handle) };
        Ok(Created::new(handle, attributes))
    }

    async fn describe(&self, handle: &str) -> Result<Option<Value>, BackendError> {
        let mut described = self.described.lock();
        let count = described.entry(handle.to_string()).or_default();
        *count += 1;

        if *count == 1 {
            return Ok(None);
        }
        Ok(Some(value_of(handle)))
    }
}

/// Node `i` may only depend on nodes declared before it, then the declaration order is shuffled
fn random_dag(rng: &mut StdRng) -> (Vec<ResourceDescriptor>, Vec<(String, String)>) {
    let size = rng.gen_range(1..=12);
    let mut descriptors = vec![];
    let mut edges = vec![];

    for i in 0..size {
        let name = format!("n{i}");
        let mut builder = ResourceDescriptor::builder(name.as_str(), "test:node")
            .config("name", name.as_str())
            .expose("value");

        let mut deps = vec![];
        let mut values = vec![];
        for j in 0..i {
            if rng.gen_bool(0.3) {
                let dep = format!("n{j}");
                deps.push(ConfigValue::pending(dep.as_str(), "id"));
                if rng.gen_bool(0.5) {
                    values.push(ConfigValue::pending(dep.as_str(), "value"));
                }
                builder = builder.depends_on(dep.as_str());
                edges.push((dep, name.clone()));
            }
        }

        let descriptor = builder
            .config("deps", ConfigValue::list(deps))
            .config("values", ConfigValue::list(values))
            .build()
            .unwrap();
        descriptors.push(descriptor);
    }

    descriptors.shuffle(rng);
    (descriptors, edges)
}

#[tokio::test]
async fn random_graphs_provision_completely() {
    for seed in 0..GRAPHS {
        let mut rng = StdRng::seed_from_u64(seed);
        let (descriptors, edges) = random_dag(&mut rng);

        let plan = resolver::resolve(descriptors.clone()).unwrap();
        let again = resolver::resolve(descriptors).unwrap();
        assert_eq!(
            plan.order().collect::<Vec<_>>(),
            again.order().collect::<Vec<_>>(),
            "seed {seed}: order is not deterministic"
        );

        for (from, to) in &edges {
            assert!(
                plan.position(&from.as_str().into()) < plan.position(&to.as_str().into()),
                "seed {seed}: `{from}` must come before `{to}`"
            );
        }

        let settings = ExecutorSettings {
            concurrency: rng.gen_range(1..=4),
            retry: RetryPolicy {
                max_attempts: 3,
                backoff_base_ms: 1,
                backoff_max_ms: 2,
                query_timeout_ms: 1_000,
            },
        };
        let executor = Executor::new(Arc::new(OrderCheckingBackend::default()), settings);
        let report = executor.run(&plan).await;

        assert!(
            !report
                .failures()
                .iter()
                .any(|f| matches!(f.cause, FailureCause::Internal(_))),
            "seed {seed}: internal failure {:?}",
            report.failures()
        );
        assert!(
            report.is_complete(),
            "seed {seed}: incomplete run {:?}",
            report.failures()
        );
    }
}

#[test]
fn back_edges_are_cycles() {
    for seed in 0..GRAPHS / 5 {
        let mut rng = StdRng::seed_from_u64(seed);
        let size = rng.gen_range(2..=10);

        let descriptors = (0..size)
            .map(|i| {
                // every node points at its successor, the last one closes the loop
                ResourceDescriptor::builder(format!("n{i}"), "test:node")
                    .depends_on(format!("n{}", (i + 1) % size))
                    .build()
                    .unwrap()
            })
            .collect();

        let err = resolver::resolve(descriptors).unwrap_err();
        match err {
            ResolveError::CyclicDependency { participants } => {
                assert_eq!(participants.len(), size, "seed {seed}")
            }
            other => panic!("seed {seed}: unexpected {other}"),
        }
    }
}
