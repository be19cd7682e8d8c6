//! Provisioning backend capability
//!
//! The executor only talks to [ProvisioningBackend]. A backend creates resources and describes
//! them by handle. Attributes it assigns asynchronously are simply absent from `describe` until
//! they exist.
use crate::descriptor::ResourceKind;
use crate::value::Value;
use async_trait::async_trait;

pub mod simulated;

/// Response to a create call
#[derive(Debug, Clone, PartialEq, derive_new::new)]
pub struct Created {
    /// Backend identifier of the new resource (ARN, `vpce-...`, ...)
    pub handle: String,
    /// Attributes known at creation time
    pub attributes: Value,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("backend error {code}: {message}")]
pub struct BackendError {
    pub code: String,
    pub message: String,
}

impl BackendError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[async_trait]
pub trait ProvisioningBackend: Send + Sync {
    async fn create(&self, kind: &ResourceKind, config: &Value) -> Result<Created, BackendError>;

    /// `Ok(None)` when the backend does not know `handle` (yet)
    async fn describe(&self, handle: &str) -> Result<Option<Value>, BackendError>;
}
