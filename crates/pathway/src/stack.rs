//! The private inference pathway
//!
//! A PrivateLink endpoint to the inference runtime inside an existing VPC, published through an
//! internet-facing network load balancer with a static address. Optionally an accelerator with
//! anycast addresses is put in front of the load balancer.
//!
//! ```text
//! client -> [accelerator] -> load_balancer:443 -> target_group -> endpoint_interface -> endpoint
//! ```
//!
//! The primary plan has to be complete before the accelerator branch starts, since the branch
//! routes to the primary plan's load balancer.
use crate::branch::{Branch, BranchOutcome, BranchPlan};
use crate::config::StackConfig;
use crate::descriptor::{ConfigValue, ResourceDescriptor, ResourceId};
use crate::error::{Error, ProvisioningFailed};
use crate::executor::{Executor, FailureCause, LiveResource, RunReport};
use crate::outputs::{OutputCollector, OutputSpec, Outputs};
use crate::resolver::{self, ExecutionPlan};

/// Backend resource kinds used by the stack
pub mod kind {
    pub const VPC: &str = "ec2:vpc";
    pub const SECURITY_GROUP: &str = "ec2:security_group";
    pub const VPC_ENDPOINT: &str = "ec2:vpc_endpoint";
    pub const NETWORK_INTERFACE: &str = "ec2:network_interface";
    pub const ELASTIC_IP: &str = "ec2:eip";
    pub const LOAD_BALANCER: &str = "elbv2:load_balancer";
    pub const TARGET_GROUP: &str = "elbv2:target_group";
    pub const TARGET_REGISTRATION: &str = "elbv2:target_registration";
    pub const LISTENER: &str = "elbv2:listener";
    pub const ACCELERATOR: &str = "globalaccelerator:accelerator";
    pub const ACCELERATOR_LISTENER: &str = "globalaccelerator:listener";
    pub const ENDPOINT_GROUP: &str = "globalaccelerator:endpoint_group";

    /// Prefix shared by all accelerator kinds
    pub const ACCELERATOR_PREFIX: &str = "globalaccelerator:";
}

const HTTPS: i64 = 443;
const ACCELERATOR_NAME: &str = "bedrock-accelerator";
const ADDRESS_NAME_TAG: &str = "BedrockAccelerator-NLB-EIP";

fn https_ingress(source: impl Into<ConfigValue>) -> ConfigValue {
    ConfigValue::list([ConfigValue::map([
        ("protocol", ConfigValue::from("tcp")),
        ("port", HTTPS.into()),
        ("source", source.into()),
    ])])
}

fn primary_descriptors(config: &StackConfig) -> Result<Vec<ResourceDescriptor>, Error> {
    let subnet = config.primary_subnet();

    Ok(vec![
        ResourceDescriptor::builder("vpc", kind::VPC)
            .lookup()
            .config("id", config.vpc_id.as_str())
            .expose("cidr_block")
            .build()?,
        ResourceDescriptor::builder("endpoint_security_group", kind::SECURITY_GROUP)
            .config("vpc_id", ConfigValue::pending("vpc", "id"))
            .config("description", "Security group for the inference VPC endpoint")
            .config("allow_all_outbound", true)
            .config("ingress", https_ingress(ConfigValue::pending("vpc", "cidr_block")))
            .depends_on("vpc")
            .build()?,
        ResourceDescriptor::builder("nlb_security_group", kind::SECURITY_GROUP)
            .config("vpc_id", ConfigValue::pending("vpc", "id"))
            .config("description", "Security group for the public load balancer")
            .config("allow_all_outbound", true)
            .config("ingress", https_ingress(config.nlb_security_group.as_str()))
            .depends_on("vpc")
            .build()?,
        ResourceDescriptor::builder("endpoint", kind::VPC_ENDPOINT)
            .config("vpc_id", ConfigValue::pending("vpc", "id"))
            .config(
                "service_name",
                format!("com.amazonaws.{}.bedrock-runtime", config.region),
            )
            .config("port", HTTPS)
            .config("subnet_ids", ConfigValue::list([ConfigValue::from(subnet)]))
            .config(
                "security_group_ids",
                ConfigValue::list([ConfigValue::pending("endpoint_security_group", "id")]),
            )
            .config("private_dns_enabled", false)
            .expose("network_interface_ids.0")
            .depends_on("vpc")
            .depends_on("endpoint_security_group")
            .build()?,
        ResourceDescriptor::builder("endpoint_interface", kind::NETWORK_INTERFACE)
            .lookup()
            .config("id", ConfigValue::pending("endpoint", "network_interface_ids.0"))
            .expose("private_ip_address")
            .depends_on("endpoint")
            .build()?,
        ResourceDescriptor::builder("static_address", kind::ELASTIC_IP)
            .config("domain", "vpc")
            .config("tags", ConfigValue::map([("Name", ConfigValue::from(ADDRESS_NAME_TAG))]))
            .expose("allocation_id")
            .expose("public_ip")
            .build()?,
        ResourceDescriptor::builder("load_balancer", kind::LOAD_BALANCER)
            .config("type", "network")
            .config("scheme", "internet-facing")
            .config(
                "security_groups",
                ConfigValue::list([ConfigValue::pending("nlb_security_group", "id")]),
            )
            .config(
                "subnet_mappings",
                ConfigValue::list([ConfigValue::map([
                    ("subnet_id", ConfigValue::from(subnet)),
                    (
                        "allocation_id",
                        ConfigValue::pending("static_address", "allocation_id"),
                    ),
                ])]),
            )
            .expose("dns_name")
            .depends_on("nlb_security_group")
            .depends_on("static_address")
            .build()?,
        ResourceDescriptor::builder("target_group", kind::TARGET_GROUP)
            .config("vpc_id", ConfigValue::pending("vpc", "id"))
            .config("port", HTTPS)
            .config("protocol", "TCP")
            .config("target_type", "ip")
            .config(
                "health_check",
                ConfigValue::map([("enabled", ConfigValue::from(true)), ("protocol", "TCP".into())]),
            )
            .depends_on("vpc")
            .build()?,
        ResourceDescriptor::builder("target_registration", kind::TARGET_REGISTRATION)
            .config("target_group_arn", ConfigValue::pending("target_group", "id"))
            .config(
                "targets",
                ConfigValue::list([ConfigValue::map([
                    (
                        "id",
                        ConfigValue::pending("endpoint_interface", "private_ip_address"),
                    ),
                    ("port", HTTPS.into()),
                ])]),
            )
            .depends_on("target_group")
            .depends_on("endpoint_interface")
            .build()?,
        ResourceDescriptor::builder("listener", kind::LISTENER)
            .config("load_balancer_arn", ConfigValue::pending("load_balancer", "id"))
            .config("port", HTTPS)
            .config("protocol", "TCP")
            .config(
                "default_action",
                ConfigValue::map([
                    ("type", ConfigValue::from("forward")),
                    ("target_group_arn", ConfigValue::pending("target_group", "id")),
                ]),
            )
            .depends_on("load_balancer")
            .depends_on("target_group")
            .depends_on("target_registration")
            .build()?,
    ])
}

fn primary_outputs() -> Vec<OutputSpec> {
    vec![
        OutputSpec::field("VpcEndpointId", "endpoint", "id"),
        OutputSpec::field("ElasticIp", "static_address", "public_ip"),
        OutputSpec::field("LoadBalancerDns", "load_balancer", "dns_name"),
        OutputSpec::field("LoadBalancerArn", "load_balancer", "id"),
    ]
}

fn accelerator_branch(config: &StackConfig) -> Result<BranchPlan, Error> {
    let descriptors = vec![
        ResourceDescriptor::builder("accelerator", kind::ACCELERATOR)
            .config("name", ACCELERATOR_NAME)
            .config("enabled", true)
            .config("ip_address_type", "IPV4")
            .config(
                "tags",
                ConfigValue::map([("Origin", ConfigValue::pending("load_balancer", "dns_name"))]),
            )
            .expose("dns_name")
            .depends_on("listener")
            .depends_on("load_balancer")
            .build()?,
        ResourceDescriptor::builder("accelerator_listener", kind::ACCELERATOR_LISTENER)
            .config("accelerator_arn", ConfigValue::pending("accelerator", "id"))
            .config(
                "port_ranges",
                ConfigValue::list([ConfigValue::map([
                    ("from_port", ConfigValue::from(HTTPS)),
                    ("to_port", HTTPS.into()),
                ])]),
            )
            .config("protocol", "TCP")
            .depends_on("accelerator")
            .build()?,
        ResourceDescriptor::builder("endpoint_group", kind::ENDPOINT_GROUP)
            .config("listener_arn", ConfigValue::pending("accelerator_listener", "id"))
            .config("region", config.region.as_str())
            .config(
                "endpoints",
                ConfigValue::list([ConfigValue::map([
                    ("endpoint_id", ConfigValue::pending("load_balancer", "id")),
                    ("weight", 100i64.into()),
                    ("client_ip_preservation", false.into()),
                ])]),
            )
            .depends_on("accelerator_listener")
            .depends_on("load_balancer")
            .build()?,
    ];

    let outputs = vec![
        OutputSpec::field("GlobalAcceleratorDnsName", "accelerator", "dns_name"),
        OutputSpec::field("GlobalAcceleratorArn", "accelerator", "id"),
    ];

    Ok(BranchPlan::new(
        "accelerator",
        [ResourceId::from("listener"), ResourceId::from("load_balancer")],
        descriptors,
        outputs,
    )?)
}

/// The resolved stack, ready to be provisioned
#[derive(Debug, Clone)]
pub struct Stack {
    primary: ExecutionPlan,
    outputs: OutputCollector,
    accelerator: Branch,
}

/// A successful run
#[derive(Debug, Clone)]
pub struct RunResult {
    pub outputs: Outputs,
    pub primary: RunReport,
    /// Only when the accelerator branch ran
    pub accelerator: Option<RunReport>,
}

impl RunResult {
    /// Live resources of all plans that ran
    pub fn live(&self) -> Vec<LiveResource> {
        let mut live = self.primary.live();
        if let Some(accelerator) = &self.accelerator {
            live.extend(accelerator.live());
        }
        live
    }
}

impl Stack {
    pub fn new(config: &StackConfig) -> Result<Self, Error> {
        config.validate()?;

        if config.subnet_ids.len() > 1 {
            tracing::warn!(
                subnet = config.primary_subnet(),
                ignored = ?&config.subnet_ids[1..],
                "placing endpoint and load balancer in a single subnet"
            );
        }

        let primary = resolver::resolve(primary_descriptors(config)?)?;
        let accelerator = Branch::when(config.enable_accelerator, || accelerator_branch(config))?;

        Ok(Self {
            primary,
            outputs: OutputCollector::new(primary_outputs()),
            accelerator,
        })
    }

    pub fn primary(&self) -> &ExecutionPlan {
        &self.primary
    }

    pub fn accelerator(&self) -> &Branch {
        &self.accelerator
    }

    /// Provision the primary plan, then the accelerator branch if enabled
    ///
    /// On failure the error carries the outputs of everything that did become ready.
    pub async fn provision(&self, executor: &Executor) -> Result<RunResult, ProvisioningFailed> {
        let primary = executor.run(&self.primary).await;
        let mut outputs = self.outputs.collect(&primary);

        let primary = match primary.into_result() {
            Ok(primary) => primary,
            Err(mut failed) => {
                failed.outputs = outputs;
                return Err(failed);
            }
        };

        match self.accelerator.run(executor, &primary).await {
            BranchOutcome::Skipped => Ok(RunResult {
                outputs,
                primary,
                accelerator: None,
            }),
            BranchOutcome::Blocked => {
                let resource = self
                    .accelerator
                    .plan()
                    .and_then(|branch| branch.plan().order().next().cloned())
                    .unwrap_or_else(|| ResourceId::from("accelerator"));

                Err(ProvisioningFailed {
                    resource,
                    cause: FailureCause::Internal("accelerator anchors are not ready".to_string()),
                    live: primary.live(),
                    outputs,
                })
            }
            BranchOutcome::Ran {
                report,
                outputs: branch_outputs,
            } => {
                outputs.merge(branch_outputs);
                match report.into_result() {
                    Ok(report) => Ok(RunResult {
                        outputs,
                        primary,
                        accelerator: Some(report),
                    }),
                    Err(mut failed) => {
                        let mut live = primary.live();
                        live.append(&mut failed.live);
                        failed.live = live;
                        failed.outputs = outputs;
                        Err(failed)
                    }
                }
            }
        }
    }
}
