//! Deploy the synthesized stack with CloudFormation and run its task on ECS
//!
//! # Commands
//!
//! * `deploy`: Create (or update) the stack and wait for it to settle
//! * `run`: Run the batch task once on Fargate (optionally waiting for it to stop)
//! * `destroy`: Delete the stack (resources with a `retain` removal policy survive)
//! * `list`: List deployments that were created but not destroyed
//!
//! # Deploy-time Trigger
//!
//! With `run_task_on_deploy: true`, `deploy` runs the task once right after the stack
//! settles, using a fixed idempotency token so later deploys do not run it again. This
//! is off by default: tasks started this way intermittently fail to mount the file
//! system while the same task started later with `run` succeeds. The cause (a wait
//! needed before the first run, or security group and route propagation) has not been
//! diagnosed.
//!
//! # Persistence
//!
//! Every deployment keeps a directory at `$HOME/.batchstack_deployer/<name>` holding the
//! deployed template, deployment metadata, and marker files (`created`, `destroyed`,
//! `triggered`).

use aws_config::{BehaviorVersion, Region, SdkConfig};
use aws_sdk_cloudformation::config::retry::ReconnectMode;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

pub mod cloudformation;
pub mod ecs;

mod deploy;
pub use deploy::deploy;
mod destroy;
pub use destroy::destroy;
mod list;
pub use list::list;
mod run;
pub use run::run;

pub const CMD: &str = "aws";
pub const DEPLOY_CMD: &str = "deploy";
pub const RUN_CMD: &str = "run";
pub const DESTROY_CMD: &str = "destroy";
pub const LIST_CMD: &str = "list";

/// Environment variable naming the account the stack must land in
pub const ACCOUNT_ENV: &str = "DEPLOYER_ACCOUNT";

/// Environment variable naming the target region (falls back to the SDK's region chain)
pub const REGION_ENV: &str = "DEPLOYER_REGION";

/// Directory (under `$HOME`) holding per-deployment state
const DEPLOYER_DIRECTORY: &str = ".batchstack_deployer";

pub const METADATA_FILE_NAME: &str = "metadata.yaml";
pub const TEMPLATE_FILE_NAME: &str = "template.json";
pub const CREATED_FILE_NAME: &str = "created";
pub const DESTROYED_FILE_NAME: &str = "destroyed";
pub const TRIGGERED_FILE_NAME: &str = "triggered";

/// Interval between stack and task status polls
pub const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Maximum number of status polls (one hour at [POLL_INTERVAL])
pub const MAX_POLL_ATTEMPTS: usize = 360;

/// Maximum attempts for a single AWS request
const MAX_REQUEST_ATTEMPTS: u32 = 10;

/// Returns the directory holding deployer state (for a deployment, if named)
pub fn deployer_directory(name: Option<&str>) -> PathBuf {
    let base = std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
        .join(DEPLOYER_DIRECTORY);
    match name {
        Some(name) => base.join(name),
        None => base,
    }
}

/// Deployment target read once at startup
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Environment {
    pub account: Option<String>,
    pub region: Option<String>,
}

impl Environment {
    pub fn from_env() -> Self {
        let read = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        Self {
            account: read(ACCOUNT_ENV),
            region: read(REGION_ENV),
        }
    }
}

/// Loads SDK configuration with adaptive retries for the target region
pub async fn sdk_config(environment: &Environment) -> SdkConfig {
    let retry = aws_config::retry::RetryConfig::adaptive()
        .with_max_attempts(MAX_REQUEST_ATTEMPTS)
        .with_initial_backoff(Duration::from_millis(500))
        .with_max_backoff(Duration::from_secs(30))
        .with_reconnect_mode(ReconnectMode::ReconnectOnTransientError);
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).retry_config(retry);
    if let Some(region) = &environment.region {
        loader = loader.region(Region::new(region.clone()));
    }
    loader.load().await
}

/// Persisted record of a deployment
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Metadata {
    pub name: String,
    pub created_at: u64,
    pub stack_id: String,
    pub region: Option<String>,
    pub resources: usize,
}

#[derive(Debug, Clone, Copy)]
pub enum CloudFormationOperation {
    DescribeStacks,
    CreateStack,
    UpdateStack,
    DeleteStack,
}

#[derive(Debug, Clone, Copy)]
pub enum EcsOperation {
    RunTask,
    DescribeTasks,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("stack error: {0}")]
    Stack(#[from] crate::stack::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("AWS CloudFormation error during {operation:?}: {source}")]
    AwsCloudFormation {
        operation: CloudFormationOperation,
        source: Box<aws_sdk_cloudformation::Error>,
    },
    #[error("AWS ECS error during {operation:?}: {source}")]
    AwsEcs {
        operation: EcsOperation,
        source: Box<aws_sdk_ecs::Error>,
    },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("template is {0} bytes, over the {max} byte limit", max = cloudformation::MAX_TEMPLATE_BODY)]
    TemplateTooLarge(usize),
    #[error("stack {stack} ended in {status}: {reason}")]
    StackFailed {
        stack: String,
        status: String,
        reason: String,
    },
    #[error("stack not found: {0}")]
    StackNotFound(String),
    #[error("stack output missing: {0}")]
    MissingOutput(String),
    #[error("stack {stack} is in account {actual}, expected {expected}")]
    AccountMismatch {
        stack: String,
        expected: String,
        actual: String,
    },
    #[error("task failed to start: {0}")]
    TaskNotStarted(String),
    #[error("task {task} failed: {reason}")]
    TaskFailed { task: String, reason: String },
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("either --config or --name must be provided")]
    MissingTarget,
}
