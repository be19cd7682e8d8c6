//! Crate level errors
//!
//! | error | raised | side effects |
//! |-------|--------|--------------|
//! | [DescriptorError] | building descriptors | none |
//! | [ResolveError] | resolving a plan | none |
//! | [ProvisioningFailed] | after a run | resources in `live` stay provisioned |
use crate::config::ConfigIssues;
use crate::descriptor::{DescriptorError, ResourceId};
use crate::executor::{FailureCause, LiveResource};
use crate::outputs::Outputs;
use crate::resolver::ResolveError;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigIssues),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Provisioning(#[from] ProvisioningFailed),
}

/// A run that did not bring every declared resource to `Ready`
///
/// Nothing is rolled back. `live` lists what exists on the backend now and needs manual cleanup
/// or a later run.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("provisioning failed at `{resource}`")]
pub struct ProvisioningFailed {
    pub resource: ResourceId,
    #[source]
    pub cause: FailureCause,
    pub live: Vec<LiveResource>,
    /// Outputs of the resources that did become ready
    pub outputs: Outputs,
}
