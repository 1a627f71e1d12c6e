//! AWS ECS SDK function wrappers

use crate::{
    aws::{EcsOperation, Error, MAX_POLL_ATTEMPTS, POLL_INTERVAL},
    stack::{
        CLUSTER_OUTPUT, PRIVATE_SUBNETS_OUTPUT, TASK_DEFINITION_OUTPUT, TASK_SECURITY_GROUP_OUTPUT,
    },
};
use aws_config::SdkConfig;
use aws_sdk_ecs::{
    types::{AssignPublicIp, AwsVpcConfiguration, LaunchType, NetworkConfiguration},
    Client as EcsClient,
};
use std::collections::BTreeMap;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Status reported once a task has fully stopped
const STOPPED_STATUS: &str = "STOPPED";

/// Creates an ECS client from loaded SDK configuration
pub fn create_client(config: &SdkConfig) -> EcsClient {
    EcsClient::new(config)
}

/// Everything needed to run the task, read from stack outputs
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunTarget {
    pub cluster: String,
    pub task_definition: String,
    pub subnets: Vec<String>,
    pub security_group: String,
}

impl RunTarget {
    pub fn from_outputs(outputs: &BTreeMap<String, String>) -> Result<Self, Error> {
        let get = |key: &str| {
            outputs
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or_else(|| Error::MissingOutput(key.to_string()))
        };
        let subnets: Vec<String> = get(PRIVATE_SUBNETS_OUTPUT)?
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
        if subnets.is_empty() {
            return Err(Error::MissingOutput(PRIVATE_SUBNETS_OUTPUT.to_string()));
        }
        Ok(Self {
            cluster: get(CLUSTER_OUTPUT)?,
            task_definition: get(TASK_DEFINITION_OUTPUT)?,
            subnets,
            security_group: get(TASK_SECURITY_GROUP_OUTPUT)?,
        })
    }
}

/// Exit state of a single container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerExit {
    pub name: String,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
}

/// Snapshot of a task as reported by `DescribeTasks`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskState {
    pub arn: String,
    pub status: String,
    pub stopped_reason: Option<String>,
    pub containers: Vec<ContainerExit>,
}

impl TaskState {
    pub fn is_stopped(&self) -> bool {
        self.status == STOPPED_STATUS
    }

    /// Succeeds only if every container exited with status 0
    pub fn check(&self) -> Result<(), Error> {
        let failed: Vec<String> = self
            .containers
            .iter()
            .filter(|c| c.exit_code != Some(0))
            .map(|c| match (c.exit_code, &c.reason) {
                (Some(code), _) => format!("{} exited with {code}", c.name),
                (None, Some(reason)) => format!("{} did not exit: {reason}", c.name),
                (None, None) => format!("{} did not exit", c.name),
            })
            .collect();
        if failed.is_empty() && !self.containers.is_empty() {
            return Ok(());
        }
        let mut reason = failed.join(", ");
        if let Some(stopped) = &self.stopped_reason {
            if reason.is_empty() {
                reason = stopped.clone();
            } else {
                reason = format!("{reason} ({stopped})");
            }
        }
        Err(Error::TaskFailed {
            task: self.arn.clone(),
            reason,
        })
    }
}

/// Runs one Fargate task in the private subnets, returning its ARN
pub async fn run_task(
    client: &EcsClient,
    target: &RunTarget,
    client_token: Option<String>,
) -> Result<String, Error> {
    let awsvpc = AwsVpcConfiguration::builder()
        .set_subnets(Some(target.subnets.clone()))
        .security_groups(&target.security_group)
        .assign_public_ip(AssignPublicIp::Disabled)
        .build()
        .map_err(|e| Error::InvalidRequest(e.to_string()))?;
    let response = client
        .run_task()
        .cluster(&target.cluster)
        .task_definition(&target.task_definition)
        .launch_type(LaunchType::Fargate)
        .count(1)
        .enable_execute_command(true)
        .network_configuration(
            NetworkConfiguration::builder()
                .awsvpc_configuration(awsvpc)
                .build(),
        )
        .set_client_token(client_token)
        .send()
        .await
        .map_err(|e| Error::AwsEcs {
            operation: EcsOperation::RunTask,
            source: Box::new(aws_sdk_ecs::Error::from(e.into_service_error())),
        })?;
    if let Some(failure) = response.failures().first() {
        let reason = [failure.reason(), failure.detail()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(": ");
        return Err(Error::TaskNotStarted(reason));
    }
    let arn = response
        .tasks()
        .first()
        .and_then(|task| task.task_arn())
        .ok_or_else(|| Error::TaskNotStarted("no task returned".to_string()))?
        .to_string();
    info!(cluster = target.cluster.as_str(), task = arn.as_str(), "started task");
    Ok(arn)
}

pub async fn describe_task(
    client: &EcsClient,
    cluster: &str,
    task: &str,
) -> Result<TaskState, Error> {
    let response = client
        .describe_tasks()
        .cluster(cluster)
        .tasks(task)
        .send()
        .await
        .map_err(|e| Error::AwsEcs {
            operation: EcsOperation::DescribeTasks,
            source: Box::new(aws_sdk_ecs::Error::from(e.into_service_error())),
        })?;
    let Some(described) = response.tasks().first() else {
        let reason = response
            .failures()
            .first()
            .and_then(|f| f.reason())
            .unwrap_or("task not found");
        return Err(Error::TaskFailed {
            task: task.to_string(),
            reason: reason.to_string(),
        });
    };
    Ok(TaskState {
        arn: described.task_arn().unwrap_or(task).to_string(),
        status: described.last_status().unwrap_or_default().to_string(),
        stopped_reason: described.stopped_reason().map(String::from),
        containers: described
            .containers()
            .iter()
            .map(|c| ContainerExit {
                name: c.name().unwrap_or_default().to_string(),
                exit_code: c.exit_code(),
                reason: c.reason().map(String::from),
            })
            .collect(),
    })
}

/// Polls a task until it stops and checks its containers' exit codes
pub async fn wait_for_task(
    client: &EcsClient,
    cluster: &str,
    task: &str,
) -> Result<TaskState, Error> {
    for _ in 0..MAX_POLL_ATTEMPTS {
        let state = describe_task(client, cluster, task).await?;
        if state.is_stopped() {
            if let Err(e) = state.check() {
                warn!(task, error = %e, "task failed");
                return Err(e);
            }
            info!(task, "task completed");
            return Ok(state);
        }
        debug!(task, status = state.status.as_str(), "waiting for task");
        sleep(POLL_INTERVAL).await;
    }
    Err(Error::Timeout(format!("task {task}")))
}
