//! AWS CloudFormation SDK function wrappers

use crate::aws::{CloudFormationOperation, Error, MAX_POLL_ATTEMPTS, POLL_INTERVAL};
use aws_config::SdkConfig;
use aws_sdk_cloudformation::{
    error::ProvideErrorMetadata, types::Capability, Client as CloudFormationClient,
};
use std::collections::BTreeMap;
use tokio::time::sleep;
use tracing::{debug, info};

/// Largest template accepted inline (`TemplateBody`)
pub const MAX_TEMPLATE_BODY: usize = 51_200;

/// Message returned by `UpdateStack` when the template is unchanged
const NO_UPDATES_MESSAGE: &str = "No updates are to be performed";

/// Creates a CloudFormation client from loaded SDK configuration
pub fn create_client(config: &SdkConfig) -> CloudFormationClient {
    CloudFormationClient::new(config)
}

/// Snapshot of a stack as reported by `DescribeStacks`
#[derive(Clone, Debug)]
pub struct StackState {
    pub id: String,
    pub status: String,
    pub reason: Option<String>,
    pub outputs: BTreeMap<String, String>,
}

/// Operation a caller is waiting on
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Goal {
    Create,
    Update,
    Delete,
}

/// Where a stack stands relative to a [Goal]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    Pending,
    Done,
    Failed,
}

/// Classifies a stack status for the operation being waited on
pub fn classify(status: &str, goal: Goal) -> Progress {
    if status.ends_with("_IN_PROGRESS") {
        return Progress::Pending;
    }
    match (goal, status) {
        (Goal::Create, "CREATE_COMPLETE")
        | (Goal::Update, "UPDATE_COMPLETE")
        | (Goal::Delete, "DELETE_COMPLETE") => Progress::Done,
        _ => Progress::Failed,
    }
}

/// Extracts the account ID from a stack ARN
pub fn stack_account(stack_id: &str) -> Option<&str> {
    let mut parts = stack_id.split(':');
    if parts.next() != Some("arn") {
        return None;
    }
    parts.nth(3).filter(|account| !account.is_empty())
}

fn is_missing_stack(error: &aws_sdk_cloudformation::Error) -> bool {
    error.code() == Some("ValidationError")
        && error.message().is_some_and(|m| m.contains("does not exist"))
}

/// Describes a stack, returning `None` if it does not exist
pub async fn describe_stack(
    client: &CloudFormationClient,
    name: &str,
) -> Result<Option<StackState>, Error> {
    let response = match client.describe_stacks().stack_name(name).send().await {
        Ok(response) => response,
        Err(e) => {
            let error = aws_sdk_cloudformation::Error::from(e.into_service_error());
            if is_missing_stack(&error) {
                return Ok(None);
            }
            return Err(Error::AwsCloudFormation {
                operation: CloudFormationOperation::DescribeStacks,
                source: Box::new(error),
            });
        }
    };
    let Some(stack) = response.stacks().first() else {
        return Ok(None);
    };
    let outputs = stack
        .outputs()
        .iter()
        .filter_map(|o| Some((o.output_key()?.to_string(), o.output_value()?.to_string())))
        .collect();
    Ok(Some(StackState {
        id: stack.stack_id().unwrap_or_default().to_string(),
        status: stack
            .stack_status()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        reason: stack.stack_status_reason().map(String::from),
        outputs,
    }))
}

/// Starts stack creation, returning the stack ID
pub async fn create_stack(
    client: &CloudFormationClient,
    name: &str,
    body: &str,
    token: &str,
) -> Result<String, Error> {
    let response = client
        .create_stack()
        .stack_name(name)
        .template_body(body)
        .capabilities(Capability::CapabilityNamedIam)
        .client_request_token(token)
        .send()
        .await
        .map_err(|e| Error::AwsCloudFormation {
            operation: CloudFormationOperation::CreateStack,
            source: Box::new(aws_sdk_cloudformation::Error::from(e.into_service_error())),
        })?;
    let id = response.stack_id().unwrap_or(name).to_string();
    info!(stack = name, id = id.as_str(), "started stack creation");
    Ok(id)
}

/// Starts a stack update, returning false if the template is unchanged
pub async fn update_stack(
    client: &CloudFormationClient,
    name: &str,
    body: &str,
    token: &str,
) -> Result<bool, Error> {
    let result = client
        .update_stack()
        .stack_name(name)
        .template_body(body)
        .capabilities(Capability::CapabilityNamedIam)
        .client_request_token(token)
        .send()
        .await;
    match result {
        Ok(_) => {
            info!(stack = name, "started stack update");
            Ok(true)
        }
        Err(e) => {
            let error = aws_sdk_cloudformation::Error::from(e.into_service_error());
            if error
                .message()
                .is_some_and(|m| m.contains(NO_UPDATES_MESSAGE))
            {
                return Ok(false);
            }
            Err(Error::AwsCloudFormation {
                operation: CloudFormationOperation::UpdateStack,
                source: Box::new(error),
            })
        }
    }
}

pub async fn delete_stack(client: &CloudFormationClient, name: &str) -> Result<(), Error> {
    client
        .delete_stack()
        .stack_name(name)
        .send()
        .await
        .map_err(|e| Error::AwsCloudFormation {
            operation: CloudFormationOperation::DeleteStack,
            source: Box::new(aws_sdk_cloudformation::Error::from(e.into_service_error())),
        })?;
    info!(stack = name, "started stack deletion");
    Ok(())
}

/// Polls a stack until it settles, returning its final state (`None` once deleted)
pub async fn wait_for_stack(
    client: &CloudFormationClient,
    name: &str,
    goal: Goal,
) -> Result<Option<StackState>, Error> {
    for _ in 0..MAX_POLL_ATTEMPTS {
        let Some(state) = describe_stack(client, name).await? else {
            if goal == Goal::Delete {
                return Ok(None);
            }
            return Err(Error::StackNotFound(name.to_string()));
        };
        match classify(&state.status, goal) {
            Progress::Pending => {
                debug!(stack = name, status = state.status.as_str(), "waiting for stack");
                sleep(POLL_INTERVAL).await;
            }
            Progress::Done => {
                info!(stack = name, status = state.status.as_str(), "stack settled");
                return Ok(Some(state));
            }
            Progress::Failed => {
                return Err(Error::StackFailed {
                    stack: name.to_string(),
                    status: state.status,
                    reason: state.reason.unwrap_or_else(|| "no reason given".to_string()),
                });
            }
        }
    }
    Err(Error::Timeout(format!("stack {name}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(classify("CREATE_IN_PROGRESS", Goal::Create), Progress::Pending);
        assert_eq!(classify("CREATE_COMPLETE", Goal::Create), Progress::Done);
        assert_eq!(classify("ROLLBACK_IN_PROGRESS", Goal::Create), Progress::Pending);
        assert_eq!(classify("ROLLBACK_COMPLETE", Goal::Create), Progress::Failed);
        assert_eq!(
            classify("UPDATE_COMPLETE_CLEANUP_IN_PROGRESS", Goal::Update),
            Progress::Pending
        );
        assert_eq!(classify("UPDATE_COMPLETE", Goal::Update), Progress::Done);
        assert_eq!(
            classify("UPDATE_ROLLBACK_COMPLETE", Goal::Update),
            Progress::Failed
        );
        assert_eq!(classify("DELETE_COMPLETE", Goal::Delete), Progress::Done);
        assert_eq!(classify("DELETE_FAILED", Goal::Delete), Progress::Failed);
        assert_eq!(classify("CREATE_COMPLETE", Goal::Delete), Progress::Failed);
    }

    #[test]
    fn test_stack_account() {
        assert_eq!(
            stack_account("arn:aws:cloudformation:us-east-1:123456789012:stack/batchstack/1f2e"),
            Some("123456789012")
        );
        assert_eq!(
            stack_account("arn:aws-cn:cloudformation:cn-north-1:210987654321:stack/x/y"),
            Some("210987654321")
        );
        assert_eq!(stack_account("batchstack"), None);
        assert_eq!(stack_account("arn:aws:cloudformation:us-east-1::stack/x"), None);
    }
}
