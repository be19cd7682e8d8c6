//! In-memory backend for rehearsals
//!
//! Hands out deterministic handles and behaves like the real control planes where it matters for
//! the workflow: interface endpoints get their network interfaces and accelerators their DNS name
//! only some `describe` rounds after creation, and references to handles that were never created
//! are rejected.
//!
//! Any `vpc-...` handle is treated as an existing network.
use super::{BackendError, Created, ProvisioningBackend};
use crate::descriptor::ResourceKind;
use crate::stack::kind;
use crate::value::{FieldPath, Value};
use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::HashMap;

const ACCOUNT: &str = "000000000000";
const EXISTING_VPC_CIDR: &str = "10.0.0.0/16";

/// Config entries that must name a handle this backend knows
const REFERENCE_KEYS: [&str; 5] = [
    "vpc_id",
    "load_balancer_arn",
    "target_group_arn",
    "listener_arn",
    "accelerator_arn",
];

struct Simulated {
    attributes: Value,
    /// Attributes that show up once `lag` describes went by
    deferred: IndexMap<String, Value>,
    lag: u32,
    /// Not found at all until `lag` is used up
    hidden: bool,
}

#[derive(Default)]
struct World {
    counters: HashMap<ResourceKind, u32>,
    resources: HashMap<String, Simulated>,
}

impl World {
    fn next(&mut self, kind: &ResourceKind) -> u32 {
        let counter = self.counters.entry(kind.clone()).or_default();
        *counter += 1;
        *counter
    }

    fn exists(&self, handle: &str) -> bool {
        handle.starts_with("vpc-") || self.resources.contains_key(handle)
    }
}

#[derive(Default)]
pub struct SimulatedBackend {
    world: Mutex<World>,
    discovery_lag: u32,
}

impl SimulatedBackend {
    /// `discovery_lag` is the number of describes before asynchronously assigned attributes appear
    pub fn new(discovery_lag: u32) -> Self {
        Self {
            world: Mutex::default(),
            discovery_lag,
        }
    }

    fn check_references(world: &World, config: &Value) -> Result<(), BackendError> {
        for key in REFERENCE_KEYS {
            let Some(reference) = config.lookup(&FieldPath::parse(key)) else {
                continue;
            };

            match reference.as_str() {
                Some(handle) if world.exists(handle) => {}
                _ => {
                    return Err(BackendError::new(
                        "InvalidParameterValue",
                        format!("{key} `{reference}` does not exist"),
                    ))
                }
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ProvisioningBackend for SimulatedBackend {
    async fn create(&self, kind: &ResourceKind, config: &Value) -> Result<Created, BackendError> {
        let mut world = self.world.lock();
        Self::check_references(&world, config)?;

        let n = world.next(kind);
        let lag = self.discovery_lag;
        let immediate = |attributes: Value| Simulated {
            attributes,
            deferred: IndexMap::new(),
            lag: 0,
            hidden: false,
        };

        let (handle, resource) = match kind.as_str() {
            kind::SECURITY_GROUP => (format!("sg-{n:08x}"), immediate(Value::object())),
            kind::VPC_ENDPOINT => {
                let handle = format!("vpce-{n:08x}");
                let interface = format!("eni-{n:08x}");

                world.resources.insert(
                    interface.clone(),
                    Simulated {
                        attributes: Value::from([(
                            "private_ip_address",
                            format!("10.0.{}.{}", n / 250, 10 + n % 250),
                        )]),
                        deferred: IndexMap::new(),
                        lag,
                        hidden: true,
                    },
                );

                let resource = Simulated {
                    attributes: Value::from([("state", "pending")]),
                    deferred: IndexMap::from([(
                        "network_interface_ids".to_string(),
                        Value::from(vec![interface]),
                    )]),
                    lag,
                    hidden: false,
                };
                (handle, resource)
            }
            kind::ELASTIC_IP => {
                let handle = format!("eipalloc-{n:08x}");
                let attributes = Value::from([
                    ("allocation_id", Value::from(handle.as_str())),
                    ("public_ip", Value::from(format!("198.51.100.{}", n % 255))),
                ]);
                (handle, immediate(attributes))
            }
            kind::LOAD_BALANCER => {
                let handle = format!(
                    "arn:aws:elasticloadbalancing:sim:{ACCOUNT}:loadbalancer/net/pathway/{n:016x}"
                );
                let attributes =
                    Value::from([("dns_name", format!("pathway-{n:08x}.elb.sim.amazonaws.com"))]);
                (handle, immediate(attributes))
            }
            kind::TARGET_GROUP => (
                format!("arn:aws:elasticloadbalancing:sim:{ACCOUNT}:targetgroup/pathway/{n:016x}"),
                immediate(Value::object()),
            ),
            kind::TARGET_REGISTRATION => {
                let target_group = config
                    .lookup(&FieldPath::parse("target_group_arn"))
                    .map(Value::to_string)
                    .unwrap_or_default();
                (format!("{target_group}/targets/{n}"), immediate(Value::object()))
            }
            kind::LISTENER => (
                format!("arn:aws:elasticloadbalancing:sim:{ACCOUNT}:listener/net/pathway/{n:016x}"),
                immediate(Value::object()),
            ),
            kind::ACCELERATOR => {
                let handle = format!("arn:aws:globalaccelerator::{ACCOUNT}:accelerator/{n:08x}");
                let resource = Simulated {
                    attributes: Value::from([("status", "IN_PROGRESS")]),
                    deferred: IndexMap::from([(
                        "dns_name".to_string(),
                        Value::from(format!("a{n:08x}.awsglobalaccelerator.com")),
                    )]),
                    lag,
                    hidden: false,
                };
                (handle, resource)
            }
            kind::ACCELERATOR_LISTENER | kind::ENDPOINT_GROUP => {
                let parent = ["accelerator_arn", "listener_arn"]
                    .iter()
                    .find_map(|key| config.lookup(&FieldPath::parse(key)))
                    .map(Value::to_string)
                    .unwrap_or_default();
                let suffix = kind.as_str().trim_start_matches(kind::ACCELERATOR_PREFIX);
                (format!("{parent}/{suffix}/{n:08x}"), immediate(Value::object()))
            }
            other => {
                return Err(BackendError::new(
                    "UnsupportedResourceType",
                    format!("cannot create `{other}`"),
                ))
            }
        };

        tracing::debug!(%kind, %handle, "simulated create");
        let created = Created::new(handle.clone(), resource.attributes.clone());
        world.resources.insert(handle, resource);
        Ok(created)
    }

    async fn describe(&self, handle: &str) -> Result<Option<Value>, BackendError> {
        let mut world = self.world.lock();

        let Some(resource) = world.resources.get_mut(handle) else {
            if handle.starts_with("vpc-") {
                return Ok(Some(Value::from([
                    ("id", handle),
                    ("cidr_block", EXISTING_VPC_CIDR),
                ])));
            }
            return Ok(None);
        };

        if resource.lag > 0 {
            resource.lag -= 1;
            tracing::trace!(handle, remaining = resource.lag, "attributes not assigned yet");
            if resource.hidden {
                return Ok(None);
            }
            return Ok(Some(resource.attributes.clone()));
        }

        let mut attributes = resource.attributes.clone();
        if let Value::Object(object) = &mut attributes {
            object.extend(resource.deferred.clone());
        }
        Ok(Some(attributes))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn endpoint_interfaces_appear_after_lag() {
        let backend = SimulatedBackend::new(2);
        let created = backend
            .create(&kind::VPC_ENDPOINT.into(), &Value::object())
            .await
            .unwrap();

        let field = FieldPath::parse("network_interface_ids.0");
        for _ in 0..2 {
            let attributes = backend.describe(&created.handle).await.unwrap().unwrap();
            assert_eq!(attributes.lookup(&field), None);
        }

        let attributes = backend.describe(&created.handle).await.unwrap().unwrap();
        let interface = attributes.lookup(&field).unwrap().to_string();
        assert_eq!(interface, "eni-00000001");

        assert_eq!(backend.describe(&interface).await.unwrap(), None);
        assert_eq!(backend.describe(&interface).await.unwrap(), None);
        assert!(backend.describe(&interface).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn existing_vpc_is_described() {
        let backend = SimulatedBackend::new(0);
        let vpc = backend.describe("vpc-0abc").await.unwrap().unwrap();
        assert_eq!(
            vpc.lookup(&"cidr_block".into()),
            Some(&Value::from(EXISTING_VPC_CIDR))
        );
        assert_eq!(backend.describe("sg-unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn dangling_reference_is_rejected() {
        let backend = SimulatedBackend::new(0);
        let config = Value::from([("load_balancer_arn", "arn:missing")]);

        let err = backend
            .create(&kind::LISTENER.into(), &config)
            .await
            .unwrap_err();
        assert_eq!(err.code, "InvalidParameterValue");
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let backend = SimulatedBackend::new(0);
        let err = backend
            .create(&"s3:bucket".into(), &Value::object())
            .await
            .unwrap_err();
        assert_eq!(err.code, "UnsupportedResourceType");
    }
}
