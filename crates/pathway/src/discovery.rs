//! Discovery of asynchronously assigned attributes
//!
//! Some attributes exist only a while after the backend acknowledged a create call, e.g. the
//! network interfaces of an interface endpoint. [poll] keeps describing the resource until every
//! queried field shows up, waiting with exponential backoff in between, and gives up after
//! [RetryPolicy::max_attempts].
use crate::backend::{BackendError, ProvisioningBackend};
use crate::descriptor::ResourceId;
use crate::state::ResolvedValue;
use crate::value::FieldPath;
use indexmap::IndexSet;
use std::time::Duration;

/// Read of one field of a created resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_new::new)]
pub struct DiscoveryQuery {
    pub target: ResourceId,
    /// Backend handle of `target`
    pub handle: String,
    pub field: FieldPath,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Describe rounds before giving up, at least one
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound for a single describe call
    pub query_timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            backoff_base_ms: 500,
            backoff_max_ms: 15_000,
            query_timeout_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failed round (zero based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_base_ms.max(1) as f64;
        let max = self.backoff_max_ms.max(1) as f64;
        let exp = attempt.min(30) as i32;
        let without_jitter = (base * 2f64.powi(exp)).min(max);
        let jitter_factor = 0.9 + (attempt as f64 % 3.0) * 0.05;
        Duration::from_millis((without_jitter * jitter_factor) as u64)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Discovered {
    pub values: Vec<ResolvedValue>,
    /// Describe rounds it took
    pub attempts: u32,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DiscoveryError {
    #[error("`{target}`: `{field}` did not appear after {attempts} attempts")]
    Timeout {
        target: ResourceId,
        field: FieldPath,
        attempts: u32,
    },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Describe until every query is answered
///
/// `on_progress` is told the number of fields still outstanding whenever a round answered some,
/// but not all of them. A `NotFound` or a describe that exceeds the query timeout only costs a
/// round. Backend errors end the poll immediately.
pub async fn poll<F>(
    backend: &dyn ProvisioningBackend,
    policy: &RetryPolicy,
    queries: &[DiscoveryQuery],
    mut on_progress: F,
) -> Result<Discovered, DiscoveryError>
where
    F: FnMut(usize),
{
    let mut outstanding: Vec<&DiscoveryQuery> = queries.iter().collect();
    let mut values = Vec::with_capacity(queries.len());
    let mut attempts = 0;

    while !outstanding.is_empty() {
        if attempts >= policy.max_attempts.max(1) {
            let first = outstanding[0];
            return Err(DiscoveryError::Timeout {
                target: first.target.clone(),
                field: first.field.clone(),
                attempts,
            });
        }

        if attempts > 0 {
            tokio::time::sleep(policy.backoff_delay(attempts - 1)).await;
        }
        attempts += 1;

        let before = outstanding.len();
        let handles: IndexSet<String> = outstanding.iter().map(|q| q.handle.clone()).collect();

        for handle in handles {
            let attributes =
                match tokio::time::timeout(policy.query_timeout(), backend.describe(&handle)).await
                {
                    Err(_) => {
                        tracing::debug!(%handle, attempts, "describe timed out");
                        continue;
                    }
                    Ok(Err(err)) => return Err(err.into()),
                    Ok(Ok(None)) => {
                        tracing::debug!(%handle, attempts, "not found yet");
                        continue;
                    }
                    Ok(Ok(Some(attributes))) => attributes,
                };

            outstanding.retain(|query| {
                if query.handle != handle {
                    return true;
                }

                let Some(value) = attributes.lookup(&query.field) else {
                    return true;
                };

                tracing::trace!(target_id = %query.target, field = %query.field, %value, "discovered");
                values.push(ResolvedValue::new(
                    query.target.clone(),
                    query.field.clone(),
                    value.clone(),
                ));
                false
            });
        }

        if !outstanding.is_empty() && outstanding.len() < before {
            on_progress(outstanding.len());
        }
    }

    Ok(Discovered { values, attempts })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testkit::ScriptedBackend;
    use crate::value::Value;
    use pretty_assertions::assert_eq;

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            query_timeout_ms: 50,
        }
    }

    fn query(field: &str) -> DiscoveryQuery {
        DiscoveryQuery::new("endpoint".into(), "vpce-1".into(), field.into())
    }

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy {
            backoff_base_ms: 100,
            backoff_max_ms: 1_000,
            ..Default::default()
        };

        assert_eq!(policy.backoff_delay(0), Duration::from_millis(90));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(190));
        assert_eq!(policy.backoff_delay(10), Duration::from_millis(950));
    }

    #[tokio::test]
    async fn resolves_after_not_found() {
        let backend = ScriptedBackend::new().on_describe(
            "vpce-1",
            [None, Some(Value::from([("ip", "10.0.0.5")]))],
        );

        let discovered = poll(&backend, &fast(), &[query("ip")], |_| {})
            .await
            .unwrap();

        assert_eq!(discovered.attempts, 2);
        assert_eq!(
            discovered.values,
            vec![ResolvedValue::new(
                "endpoint".into(),
                "ip".into(),
                "10.0.0.5".into()
            )]
        );
    }

    #[tokio::test]
    async fn reports_partial_progress() {
        let backend = ScriptedBackend::new().on_describe(
            "vpce-1",
            [
                Some(Value::from([("a", "1")])),
                Some(Value::from([("a", "1"), ("b", "2")])),
            ],
        );

        let mut progress = vec![];
        poll(&backend, &fast(), &[query("a"), query("b")], |left| {
            progress.push(left)
        })
        .await
        .unwrap();

        assert_eq!(progress, vec![1]);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let backend = ScriptedBackend::new().on_describe("vpce-1", [None]);

        let err = poll(&backend, &fast(), &[query("ip")], |_| {})
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DiscoveryError::Timeout {
                target: "endpoint".into(),
                field: "ip".into(),
                attempts: 4
            }
        );
        assert_eq!(backend.describe_calls("vpce-1"), 4);
    }

    #[tokio::test]
    async fn slow_describe_costs_an_attempt() {
        let backend = ScriptedBackend::new()
            .on_describe("vpce-1", [Some(Value::from([("ip", "10.0.0.5")]))])
            .with_describe_latency(Duration::from_secs(3600));
        let policy = RetryPolicy {
            query_timeout_ms: 20,
            ..fast()
        };

        let started = std::time::Instant::now();
        let err = poll(&backend, &policy, &[query("ip")], |_| {})
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DiscoveryError::Timeout {
                target: "endpoint".into(),
                field: "ip".into(),
                attempts: 4
            }
        );
        assert_eq!(backend.describe_calls("vpce-1"), 4);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test]
    async fn backend_error_is_not_retried() {
        let backend = ScriptedBackend::new()
            .fail_describe("vpce-1", BackendError::new("403", "denied"));

        let err = poll(&backend, &fast(), &[query("ip")], |_| {})
            .await
            .unwrap_err();

        assert_eq!(
            err,
            DiscoveryError::Backend(BackendError::new("403", "denied"))
        );
        assert_eq!(backend.describe_calls("vpce-1"), 1);
    }
}
