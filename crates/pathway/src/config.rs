//! Stack configuration
//!
//! [StackConfig] is the validated input of a run. It is usually read from a `.env` style file:
//!
//! ```text
//! VPC_ID=vpc-0abc
//! PUBLIC_SUBNET_IDS=subnet-1,subnet-2
//! AWS_REGION=us-west-2
//! NLB_SECURITY_GROUP=203.0.113.0/24
//! ENABLE_GLOBAL_ACCELERATOR=true
//! ```
//!
//! `AWS_REGION` falls back to the `AWS_DEFAULT_REGION` or `CDK_DEFAULT_REGION` process variable.
//! Validation reports every problem at once rather than the first one.
use std::path::{Path, PathBuf};

/// Process variables consulted in order when the file has no `AWS_REGION`
pub const REGION_FALLBACKS: [&str; 2] = ["AWS_DEFAULT_REGION", "CDK_DEFAULT_REGION"];

/// First non-empty [REGION_FALLBACKS] variable according to `var`
pub fn fallback_region(var: impl Fn(&str) -> Option<String>) -> Option<String> {
    REGION_FALLBACKS
        .iter()
        .filter_map(|&name| var(name))
        .map(|region| region.trim().to_string())
        .find(|region| !region.is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackConfig {
    pub vpc_id: String,
    pub subnet_ids: Vec<String>,
    pub region: String,
    /// Allowed source of traffic to the load balancer
    pub nlb_security_group: String,
    pub enable_accelerator: bool,
}

impl StackConfig {
    pub fn validate(&self) -> Result<(), ConfigIssues> {
        let mut e = ConfigIssues::new();

        if self.vpc_id.trim().is_empty() {
            e.log(Issue::MissingVpcId);
        }

        if self.subnet_ids.is_empty() {
            e.log(Issue::NoSubnets);
        }

        for (index, subnet) in self.subnet_ids.iter().enumerate() {
            if subnet.trim().is_empty() {
                e.log(Issue::EmptySubnetId(index));
            }
        }

        if self.region.trim().is_empty() {
            e.log(Issue::MissingRegion);
        }

        if self.nlb_security_group.trim().is_empty() {
            e.log(Issue::MissingSecurityGroup);
        }

        if !e.issues.is_empty() {
            return Err(e);
        }

        Ok(())
    }

    /// The one subnet everything is placed in
    ///
    /// Only the first configured subnet is used. Multi-AZ placement is not supported.
    pub fn primary_subnet(&self) -> &str {
        self.subnet_ids.first().map(String::as_str).unwrap_or_default()
    }

    /// Build from `KEY=value` pairs and validate
    pub fn from_pairs(
        pairs: impl IntoIterator<Item = (String, String)>,
        fallback_region: Option<String>,
    ) -> Result<Self, ConfigIssues> {
        let mut config = StackConfig {
            vpc_id: String::new(),
            subnet_ids: vec![],
            region: String::new(),
            nlb_security_group: String::new(),
            enable_accelerator: false,
        };

        for (key, value) in pairs {
            let value = value.trim();
            match key.trim() {
                "VPC_ID" => config.vpc_id = value.to_string(),
                "PUBLIC_SUBNET_IDS" => {
                    config.subnet_ids = match value {
                        "" => vec![],
                        list => list.split(',').map(|s| s.trim().to_string()).collect(),
                    }
                }
                "AWS_REGION" => config.region = value.to_string(),
                "NLB_SECURITY_GROUP" => config.nlb_security_group = value.to_string(),
                "ENABLE_GLOBAL_ACCELERATOR" => {
                    config.enable_accelerator = value.eq_ignore_ascii_case("true")
                }
                other => tracing::trace!(key = other, "ignoring configuration key"),
            }
        }

        if config.region.is_empty() {
            if let Some(region) = fallback_region {
                config.region = region;
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load a `.env` style file
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        if !path.is_file() {
            return Err(LoadError::NotFound(path.to_path_buf()));
        }

        tracing::info!(path = %path.display(), "loading configuration");
        let pairs = dotenvy::from_path_iter(path)?.collect::<Result<Vec<_>, _>>()?;

        let config = Self::from_pairs(pairs, fallback_region(|name| std::env::var(name).ok()))?;
        if config.subnet_ids.len() > 1 {
            tracing::info!(
                used = config.primary_subnet(),
                ignored = config.subnet_ids.len() - 1,
                "only the first subnet is used"
            );
        }

        Ok(config)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error("configuration file {} not found", .0.display())]
    NotFound(PathBuf),
    #[error("Unable to parse configuration file")]
    Parse(#[from] dotenvy::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigIssues),
}

#[derive(derive_new::new, Debug, Clone, PartialEq)]
pub struct ConfigIssues {
    #[new(default)]
    issues: Vec<Issue>,
}

impl ConfigIssues {
    pub fn log(&mut self, issue: Issue) {
        tracing::trace!(?issue, "issue found");
        self.issues.push(issue);
    }

    pub fn issues(&self) -> &[Issue] {
        &self.issues
    }
}

impl std::error::Error for ConfigIssues {}

impl std::fmt::Display for ConfigIssues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("invalid configuration: ")?;
        for (index, issue) in self.issues.iter().enumerate() {
            if index > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{issue}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Issue {
    MissingVpcId,
    NoSubnets,
    EmptySubnetId(usize),
    MissingRegion,
    MissingSecurityGroup,
}

impl std::fmt::Display for Issue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Issue::MissingVpcId => f.write_str("VPC_ID must be provided"),
            Issue::NoSubnets => f.write_str("PUBLIC_SUBNET_IDS must list at least one subnet"),
            Issue::EmptySubnetId(index) => write!(f, "PUBLIC_SUBNET_IDS entry {index} is empty"),
            Issue::MissingRegion => {
                f.write_str(
                "AWS_REGION must be provided or AWS_DEFAULT_REGION or CDK_DEFAULT_REGION must be set",
            )
            }
            Issue::MissingSecurityGroup => f.write_str("NLB_SECURITY_GROUP must be provided"),
        }
    }
}
