//! The concrete stack, end to end against the scripted backend

use pathway::backend::BackendError;
use pathway::config::StackConfig;
use pathway::descriptor::ResourceId;
use pathway::discovery::RetryPolicy;
use pathway::executor::{Executor, ExecutorSettings};
use pathway::stack::{kind, Stack};
use pathway::testkit::ScriptedBackend;
use pathway::value::{FieldPath, Value};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;

const LB_ARN: &str = "arn:aws:elasticloadbalancing:us-west-2:000000000000:loadbalancer/net/nlb/1";
const LB_DNS: &str = "nlb-1.elb.us-west-2.amazonaws.com";
const GA_ARN: &str = "arn:aws:globalaccelerator::000000000000:accelerator/1";

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_env("PATHWAY_LOG"))
        .with_test_writer()
        .try_init();
}

fn config(enable_accelerator: bool) -> StackConfig {
    StackConfig {
        vpc_id: "vpc-0abc1234".to_string(),
        subnet_ids: vec!["subnet-0aaa".to_string()],
        region: "us-west-2".to_string(),
        nlb_security_group: "203.0.113.0/24".to_string(),
        enable_accelerator,
    }
}

/// Responses of a healthy account, the endpoint interface shows up one describe late
fn backend() -> ScriptedBackend {
    ScriptedBackend::new()
        .on_describe(
            "vpc-0abc1234",
            [Some(Value::from([("cidr_block", "10.0.0.0/16")]))],
        )
        .on_create(kind::VPC_ENDPOINT, "vpce-1", Value::from([("state", "pending")]))
        .on_describe(
            "vpce-1",
            [
                Some(Value::from([("state", "pending")])),
                Some(Value::from([(
                    "network_interface_ids",
                    Value::from(vec!["eni-1"]),
                )])),
            ],
        )
        .on_describe(
            "eni-1",
            [Some(Value::from([("private_ip_address", "10.0.1.10")]))],
        )
        .on_create(
            kind::ELASTIC_IP,
            "eipalloc-1",
            Value::from([("allocation_id", "eipalloc-1"), ("public_ip", "198.51.100.7")]),
        )
        .on_create(kind::LOAD_BALANCER, LB_ARN, Value::from([("dns_name", LB_DNS)]))
        .on_create(kind::ACCELERATOR, GA_ARN, Value::object())
        .on_describe(
            GA_ARN,
            [Some(Value::from([("dns_name", "a1.awsglobalaccelerator.com")]))],
        )
}

fn executor(backend: Arc<ScriptedBackend>) -> Executor {
    Executor::new(
        backend,
        ExecutorSettings {
            concurrency: 4,
            retry: RetryPolicy {
                max_attempts: 4,
                backoff_base_ms: 1,
                backoff_max_ms: 5,
                query_timeout_ms: 1_000,
            },
        },
    )
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    value.lookup(&FieldPath::parse(path))
}

#[test]
fn primary_plan_order() {
    let stack = Stack::new(&config(false)).unwrap();
    let order: Vec<&str> = stack.primary().order().map(ResourceId::as_str).collect();

    insta::assert_yaml_snapshot!("primary_plan_order", order);
}

#[test]
fn accelerator_plan_order() {
    let stack = Stack::new(&config(true)).unwrap();
    let branch = stack.accelerator().plan().unwrap();
    let order: Vec<&str> = branch.plan().order().map(ResourceId::as_str).collect();

    insta::assert_yaml_snapshot!("accelerator_plan_order", order);
}

#[test]
fn loads_env_file() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/accelerator.env");
    let config = StackConfig::load(&path).unwrap();

    assert_eq!(config.vpc_id, "vpc-0abc1234");
    assert_eq!(config.subnet_ids, vec!["subnet-0aaa", "subnet-0bbb"]);
    assert_eq!(config.region, "us-west-2");
    assert!(config.enable_accelerator);
}

#[tokio::test]
async fn disabled_accelerator_issues_no_accelerator_calls() {
    init_tracing();
    let backend = Arc::new(backend());
    let stack = Stack::new(&config(false)).unwrap();

    let result = stack.provision(&executor(backend.clone())).await.unwrap();

    assert!(result.accelerator.is_none());
    assert!(backend
        .created_kinds()
        .iter()
        .all(|k| !k.as_str().starts_with(kind::ACCELERATOR_PREFIX)));

    assert_eq!(
        result.outputs.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
        vec!["VpcEndpointId", "ElasticIp", "LoadBalancerDns", "LoadBalancerArn"]
    );
    assert_eq!(result.outputs.get("VpcEndpointId"), Some(&Value::from("vpce-1")));
    assert_eq!(result.outputs.get("ElasticIp"), Some(&Value::from("198.51.100.7")));
    assert_eq!(result.outputs.get("LoadBalancerDns"), Some(&Value::from(LB_DNS)));
    assert_eq!(result.live().len(), 10);
}

#[tokio::test]
async fn placeholders_are_wired_through() {
    init_tracing();
    let backend = Arc::new(backend());
    let stack = Stack::new(&config(false)).unwrap();

    stack.provision(&executor(backend.clone())).await.unwrap();

    let registration = backend.create_calls(kind::TARGET_REGISTRATION).remove(0);
    assert_eq!(
        lookup(&registration, "targets.0.id"),
        Some(&Value::from("10.0.1.10"))
    );

    let load_balancer = backend.create_calls(kind::LOAD_BALANCER).remove(0);
    assert_eq!(
        lookup(&load_balancer, "subnet_mappings.0.allocation_id"),
        Some(&Value::from("eipalloc-1"))
    );

    let listener = backend.create_calls(kind::LISTENER).remove(0);
    assert_eq!(
        lookup(&listener, "load_balancer_arn"),
        Some(&Value::from(LB_ARN))
    );

    let sources: Vec<_> = backend
        .create_calls(kind::SECURITY_GROUP)
        .iter()
        .filter_map(|config| lookup(config, "ingress.0.source").cloned())
        .collect();
    assert!(sources.contains(&Value::from("10.0.0.0/16")));
    assert!(sources.contains(&Value::from("203.0.113.0/24")));
}

#[tokio::test]
async fn enabled_accelerator_routes_to_load_balancer() {
    init_tracing();
    let backend = Arc::new(backend());
    let stack = Stack::new(&config(true)).unwrap();

    let result = stack.provision(&executor(backend.clone())).await.unwrap();

    assert_eq!(
        result.outputs.get("GlobalAcceleratorDnsName"),
        Some(&Value::from("a1.awsglobalaccelerator.com"))
    );
    assert_eq!(
        result.outputs.get("GlobalAcceleratorArn"),
        Some(&Value::from(GA_ARN))
    );
    assert_eq!(result.live().len(), 13);

    let accelerator = backend.create_calls(kind::ACCELERATOR).remove(0);
    assert_eq!(lookup(&accelerator, "tags.Origin"), Some(&Value::from(LB_DNS)));

    let endpoint_group = backend.create_calls(kind::ENDPOINT_GROUP).remove(0);
    assert_eq!(
        lookup(&endpoint_group, "endpoints.0.endpoint_id"),
        Some(&Value::from(LB_ARN))
    );
    assert_eq!(
        lookup(&endpoint_group, "endpoints.0.weight"),
        Some(&Value::from(100i64))
    );
}

#[tokio::test]
async fn accelerator_failure_keeps_primary_outputs() {
    init_tracing();
    let backend = Arc::new(
        backend().fail_create(kind::ACCELERATOR, BackendError::new("403", "AccessDenied")),
    );
    let stack = Stack::new(&config(true)).unwrap();

    let failed = stack
        .provision(&executor(backend.clone()))
        .await
        .unwrap_err();

    assert_eq!(failed.resource, ResourceId::from("accelerator"));
    assert_eq!(failed.live.len(), 10);
    assert_eq!(failed.outputs.get("LoadBalancerDns"), Some(&Value::from(LB_DNS)));
    assert_eq!(failed.outputs.get("GlobalAcceleratorArn"), None);
    assert!(backend.create_calls(kind::ACCELERATOR_LISTENER).is_empty());
}

#[tokio::test]
async fn primary_failure_never_starts_accelerator() {
    init_tracing();
    let backend = Arc::new(
        backend().fail_create(kind::LISTENER, BackendError::new("403", "AccessDenied")),
    );
    let stack = Stack::new(&config(true)).unwrap();

    let failed = stack
        .provision(&executor(backend.clone()))
        .await
        .unwrap_err();

    assert_eq!(failed.resource, ResourceId::from("listener"));
    assert_eq!(failed.live.len(), 9);
    assert!(backend.create_calls(kind::ACCELERATOR).is_empty());
}
