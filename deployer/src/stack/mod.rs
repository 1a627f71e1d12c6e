//! Synthesize the batch stack into a CloudFormation template
//!
//! Resources are declared in dependency order (network, access control, storage,
//! identity, compute, verification host). Ordering between resources is otherwise
//! expressed only through references, which CloudFormation resolves when it applies
//! the template. Synthesis is a single synchronous pass: the same configuration always
//! produces the same template.

use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::{error, info};

pub mod audit;
pub mod cidr;
pub mod compute;
pub mod config;
pub mod host;
pub mod identity;
pub mod network;
pub mod security;
pub mod storage;
pub mod template;

pub use audit::{audit, Violation};
pub use config::Config;
pub use template::{Format, Template};

pub const SYNTH_CMD: &str = "synth";
pub const VERIFY_CMD: &str = "verify";

/// Names of the outputs consumed when running the task
pub const CLUSTER_OUTPUT: &str = "ClusterName";
pub const TASK_DEFINITION_OUTPUT: &str = "TaskDefinitionArn";
pub const PRIVATE_SUBNETS_OUTPUT: &str = "PrivateSubnetIds";
pub const TASK_SECURITY_GROUP_OUTPUT: &str = "TaskSecurityGroupId";
pub const FILE_SYSTEM_OUTPUT: &str = "FileSystemId";
pub const VPC_OUTPUT: &str = "VpcId";
pub const HOST_OUTPUT: &str = "VerificationInstanceId";

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid stack name (1-32 of [a-z0-9-], starting with a letter): {0}")]
    InvalidName(String),
    #[error("invalid CIDR block: {0}")]
    InvalidCidr(String),
    #[error("invalid subnet mask /{mask} for {network}")]
    InvalidSubnetMask { network: cidr::Cidr, mask: u8 },
    #[error("{network} cannot fit {requested} /{mask} subnets")]
    CidrExhausted {
        network: cidr::Cidr,
        mask: u8,
        requested: usize,
    },
    #[error("invalid availability zone count: {0}")]
    InvalidAzCount(usize),
    #[error("invalid NAT gateway count {nat_gateways} for {azs} availability zones")]
    InvalidNatGatewayCount { nat_gateways: usize, azs: usize },
    #[error("{listed} availability zones listed but {required} required")]
    NotEnoughAvailabilityZones { listed: usize, required: usize },
    #[error("invalid Fargate task size: {cpu} CPU / {memory} MiB")]
    InvalidTaskSize { cpu: u32, memory: u32 },
    #[error("containers reserve {cpu} CPU / {memory} MiB, exceeding the task's {task_cpu} / {task_memory}")]
    ContainersExceedTask {
        cpu: u64,
        memory: u64,
        task_cpu: u32,
        task_memory: u32,
    },
    #[error("invalid log retention: {0} days")]
    InvalidLogRetention(u32),
    #[error("invalid volume name: {0:?}")]
    InvalidVolumeName(String),
    #[error("mount path must be absolute: {0}")]
    RelativeMountPath(String),
    #[error("invalid data file name: {0:?}")]
    InvalidDataFile(String),
    #[error("dataset bucket and key must be set")]
    MissingDataset,
    #[error("file system encryption cannot be disabled")]
    UnencryptedStorage,
    #[error("value may not contain `${{`: {0}")]
    SubstitutionInValue(String),
    #[error("duplicate logical ID: {0}")]
    DuplicateLogicalId(String),
    #[error("unknown template format: {0}")]
    InvalidFormat(String),
    #[error("template has {} violation(s)", .0.len())]
    Violations(Vec<Violation>),
}

/// Builds the full template for a configuration
pub fn synthesize(config: &Config) -> Result<Template, Error> {
    config.validate()?;
    let mut template = Template::new(format!(
        "{}: Fargate batch job over a shared EFS volume",
        config.name
    ));

    let network = network::build(&mut template, config)?;
    let groups = security::build(&mut template, config, &network)?;
    let storage = storage::build(&mut template, config, &network, &groups)?;
    let identity = identity::build(&mut template, config)?;
    let compute = compute::build(&mut template, config, &storage, &identity)?;
    let host = host::build(&mut template, config, &network, &groups, &storage, &identity)?;

    template.add_output(VPC_OUTPUT, template::reference(&network.vpc), "VPC ID");
    template.add_output(
        CLUSTER_OUTPUT,
        template::reference(&compute.cluster),
        "ECS cluster name",
    );
    template.add_output(
        TASK_DEFINITION_OUTPUT,
        template::reference(&compute.task_definition),
        "Task definition ARN",
    );
    template.add_output(
        PRIVATE_SUBNETS_OUTPUT,
        template::join(
            ",",
            network
                .private_subnets
                .iter()
                .map(|id| template::reference(id))
                .collect(),
        ),
        "Private subnet IDs (comma separated)",
    );
    template.add_output(
        TASK_SECURITY_GROUP_OUTPUT,
        template::get_att(&groups.task, "GroupId"),
        "Security group of the task",
    );
    template.add_output(
        FILE_SYSTEM_OUTPUT,
        template::reference(&storage.file_system),
        "EFS file system ID",
    );
    if let Some(host) = host {
        template.add_output(
            HOST_OUTPUT,
            template::reference(&host),
            "Verification host instance ID",
        );
    }

    let violations = audit(&template);
    if !violations.is_empty() {
        for violation in &violations {
            error!(%violation, "synthesized template failed audit");
        }
        return Err(Error::Violations(violations));
    }
    info!(
        stack = config.name.as_str(),
        resources = template.resources.len(),
        "synthesized template"
    );
    Ok(template)
}

/// `synth` subcommand: writes the template to a file (or stdout)
pub fn synth(config: &PathBuf, output: Option<&PathBuf>, format: Format) -> Result<(), Error> {
    let config = Config::load(config)?;
    info!(stack = config.name.as_str(), "loaded configuration");
    let template = synthesize(&config)?;
    let rendered = template.render(format)?;
    match output {
        Some(path) => {
            fs::write(path, rendered)?;
            info!(path = ?path, %format, "wrote template");
        }
        None => println!("{rendered}"),
    }
    Ok(())
}

/// `verify` subcommand: audits a template on disk
pub fn verify(path: &Path) -> Result<(), Error> {
    let body = fs::read_to_string(path)?;
    let template = Template::parse(&body)?;
    let violations = audit(&template);
    if violations.is_empty() {
        info!(path = ?path, resources = template.resources.len(), "template passed audit");
        return Ok(());
    }
    for violation in &violations {
        error!(%violation, "template failed audit");
    }
    Err(Error::Violations(violations))
}
