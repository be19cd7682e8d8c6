//! # pathway - private inference endpoint provisioning
//!
//! Provisions a PrivateLink endpoint for the inference runtime inside an existing VPC, exposes it
//! through an internet-facing network load balancer and, optionally, an accelerator.
//!
//! ## Introduction for developers
//!
//! Read this to understand how `pathway` works internally.
//!
//! ### Terms
//!
//! - a `resource` is one provisionable unit, described by a [descriptor::ResourceDescriptor]
//! - its `handle` is the identifier the backend assigned to it (an ARN, `vpce-...`, ...)
//! - a `placeholder` ([descriptor::ConfigValue::Pending]) is a config leaf that refers to a field of
//!   another resource, which is only known once that resource is live
//! - `discovery` is polling the backend for fields that are assigned some time after creation
//!
//! ### Building a plan
//!
//! [stack::Stack::new] declares the descriptors of the concrete topology. Every placeholder must
//! point at a declared dependency, otherwise the descriptor is rejected
//! ([descriptor::DescriptorError::MalformedDependency]).
//!
//! [resolver::Resolver] orders the descriptors topologically. Ties are broken by declaration order
//! so the same input always gives the same plan. Unknown dependencies and cycles are rejected
//! before anything reaches the backend.
//!
//! The resolver also works out which fields each resource has to make available: the fields it
//! exposes plus every field another descriptor references on it.
//!
//! ### Executing a plan
//!
//! [executor::Executor] drives every resource through the state machine of [state::ResourceState]:
//!
//! | from | to |
//! |------|----|
//! | `Pending` | `Creating`, `Failed` |
//! | `Creating` | `AwaitingDiscovery`, `Ready`, `Failed` |
//! | `AwaitingDiscovery` | `AwaitingDiscovery` (fewer outstanding), `Ready`, `Failed` |
//!
//! Resolved fields land in a write-once [state::ResolvedCache]. Placeholders are injected from it
//! right before the create call. The backend is only reachable through
//! [backend::ProvisioningBackend].
//!
//! ### After a run
//!
//! [outputs::OutputCollector] maps resolved fields to named outputs. A run that did not finish
//! returns [error::ProvisioningFailed] listing the resources that are live, since nothing is ever
//! rolled back.
//!
//! The accelerator is a [branch::Branch]. When disabled it is never built, so it cannot issue a
//! single backend call.
//!
pub mod backend;
pub mod branch;
pub mod config;
pub mod descriptor;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod outputs;
pub mod resolver;
pub mod stack;
pub mod state;
#[cfg(any(test, feature = "testkit"))]
pub mod testkit;
pub mod value;

pub use error::Error;
