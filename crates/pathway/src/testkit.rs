//! Test utilities
//!
//! Enabled for unit tests and through the `testkit` feature for integration tests.
//!
//! [ScriptedBackend] replays canned responses and records every call it receives, so tests can
//! assert on what reached the backend as well as on the run result.
use crate::backend::{BackendError, Created, ProvisioningBackend};
use crate::descriptor::ResourceKind;
use crate::value::Value;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Create { kind: ResourceKind, config: Value },
    Describe { handle: String },
}

enum CreateScript {
    Respond { handle: String, attributes: Value },
    Fail(BackendError),
}

enum DescribeScript {
    /// The last response repeats once the others are used up
    Respond(VecDeque<Option<Value>>),
    Fail(BackendError),
}

#[derive(Default)]
struct Script {
    creates: HashMap<ResourceKind, CreateScript>,
    describes: HashMap<String, DescribeScript>,
    /// Attributes returned at creation, served by unscripted describes
    known: HashMap<String, Value>,
    calls: Vec<Call>,
    created: usize,
    in_flight: usize,
    max_in_flight: usize,
}

/// Backend double with scripted responses
///
/// Unscripted creates succeed with handle `<kind>-<n>` and no attributes. Unscripted describes
/// return whatever the create call returned for that handle, or `NotFound` for handles the
/// backend never handed out.
#[derive(Default)]
pub struct ScriptedBackend {
    script: Mutex<Script>,
    latency: Option<Duration>,
    describe_latency: Option<Duration>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(
        self,
        kind: &str,
        handle: impl Into<String>,
        attributes: impl Into<Value>,
    ) -> Self {
        self.script.lock().creates.insert(
            kind.into(),
            CreateScript::Respond {
                handle: handle.into(),
                attributes: attributes.into(),
            },
        );
        self
    }

    pub fn fail_create(self, kind: &str, error: BackendError) -> Self {
        self.script
            .lock()
            .creates
            .insert(kind.into(), CreateScript::Fail(error));
        self
    }

    pub fn on_describe(
        self,
        handle: impl Into<String>,
        responses: impl IntoIterator<Item = Option<Value>>,
    ) -> Self {
        self.script.lock().describes.insert(
            handle.into(),
            DescribeScript::Respond(responses.into_iter().collect()),
        );
        self
    }

    pub fn fail_describe(self, handle: impl Into<String>, error: BackendError) -> Self {
        self.script
            .lock()
            .describes
            .insert(handle.into(), DescribeScript::Fail(error));
        self
    }

    /// Every create call takes `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Every describe call takes `latency`
    pub fn with_describe_latency(mut self, latency: Duration) -> Self {
        self.describe_latency = Some(latency);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().calls.clone()
    }

    /// Configs of all create calls for `kind`
    pub fn create_calls(&self, kind: &str) -> Vec<Value> {
        self.script
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Create { kind: k, config } if k.as_str() == kind => Some(config.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn created_kinds(&self) -> Vec<ResourceKind> {
        self.script
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Create { kind, .. } => Some(kind.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn describe_calls(&self, handle: &str) -> usize {
        self.script
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, Call::Describe { handle: h } if h == handle))
            .count()
    }

    /// Highest number of create calls that were running at the same time
    pub fn max_concurrent_creates(&self) -> usize {
        self.script.lock().max_in_flight
    }
}

#[async_trait]
impl ProvisioningBackend for ScriptedBackend {
    async fn create(&self, kind: &ResourceKind, config: &Value) -> Result<Created, BackendError> {
        {
            let mut script = self.script.lock();
            script.calls.push(Call::Create {
                kind: kind.clone(),
                config: config.clone(),
            });
            script.in_flight += 1;
            script.max_in_flight = script.max_in_flight.max(script.in_flight);
        }

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut guard = self.script.lock();
        let script = &mut *guard;
        script.in_flight -= 1;
        script.created += 1;

        let created = match script.creates.get(kind) {
            Some(CreateScript::Fail(error)) => return Err(error.clone()),
            Some(CreateScript::Respond { handle, attributes }) => {
                Created::new(handle.clone(), attributes.clone())
            }
            None => Created::new(format!("{kind}-{}", script.created), Value::object()),
        };

        script
            .known
            .insert(created.handle.clone(), created.attributes.clone());
        Ok(created)
    }

    async fn describe(&self, handle: &str) -> Result<Option<Value>, BackendError> {
        self.script.lock().calls.push(Call::Describe {
            handle: handle.to_string(),
        });

        if let Some(latency) = self.describe_latency {
            tokio::time::sleep(latency).await;
        }

        let mut guard = self.script.lock();
        let script = &mut *guard;

        match script.describes.get_mut(handle) {
            Some(DescribeScript::Fail(error)) => Err(error.clone()),
            Some(DescribeScript::Respond(responses)) => {
                if responses.len() > 1 {
                    Ok(responses.pop_front().flatten())
                } else {
                    Ok(responses.front().cloned().flatten())
                }
            }
            None => Ok(script.known.get(handle).cloned()),
        }
    }
}
