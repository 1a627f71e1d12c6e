//! `deploy` subcommand for `aws`

use crate::{
    aws::{
        cloudformation::{self, Goal, StackState, MAX_TEMPLATE_BODY},
        deployer_directory, ecs, sdk_config, Environment, Error, Metadata, CREATED_FILE_NAME,
        DESTROYED_FILE_NAME, METADATA_FILE_NAME, TEMPLATE_FILE_NAME, TRIGGERED_FILE_NAME,
    },
    stack::{self, Config},
};
use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{info, warn};
use uuid::Uuid;

/// Idempotency token for the deploy-time task run
pub fn one_off_token(name: &str) -> String {
    format!("{name}-one-off-task")
}

/// Request token for a stack operation (must start with a letter)
fn request_token(operation: &str) -> String {
    format!("{operation}-{}", Uuid::new_v4())
}

/// Fails if the stack landed somewhere other than the expected account
pub fn check_account(state: &StackState, name: &str, expected: Option<&str>) -> Result<(), Error> {
    let Some(expected) = expected else {
        return Ok(());
    };
    let actual = cloudformation::stack_account(&state.id).unwrap_or_default();
    if actual != expected {
        return Err(Error::AccountMismatch {
            stack: name.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

/// Keeps the original creation time across updates of a live deployment
fn creation_time(directory: &Path, now: u64) -> Result<u64, Error> {
    let path = directory.join(METADATA_FILE_NAME);
    if !path.exists() || directory.join(DESTROYED_FILE_NAME).exists() {
        return Ok(now);
    }
    let previous: Metadata = serde_yaml::from_reader(File::open(path)?)?;
    Ok(previous.created_at)
}

/// Synthesizes the stack, submits it, and waits for it to settle
pub async fn deploy(config: &PathBuf) -> Result<(), Error> {
    // Load configuration and build the template before touching AWS
    let config = Config::load(config)?;
    let name = config.name.as_str();
    info!(stack = name, "loaded configuration");
    let template = stack::synthesize(&config)?;
    let body = template.to_json_compact()?;
    if body.len() > MAX_TEMPLATE_BODY {
        return Err(Error::TemplateTooLarge(body.len()));
    }

    // Persist the template that is about to be submitted
    let directory = deployer_directory(Some(name));
    fs::create_dir_all(&directory)?;
    fs::write(directory.join(TEMPLATE_FILE_NAME), template.to_json()?)?;
    info!(path = ?directory, "persisted template");

    // Create or update the stack
    let environment = Environment::from_env();
    let sdk = sdk_config(&environment).await;
    let client = cloudformation::create_client(&sdk);
    let state = match cloudformation::describe_stack(&client, name).await? {
        None => {
            cloudformation::create_stack(&client, name, &body, &request_token("create")).await?;
            cloudformation::wait_for_stack(&client, name, Goal::Create).await?
        }
        Some(existing) if existing.status == "ROLLBACK_COMPLETE" => {
            // A stack that failed its first creation can only be deleted
            return Err(Error::StackFailed {
                stack: name.to_string(),
                status: existing.status,
                reason: "destroy the stack before deploying again".to_string(),
            });
        }
        Some(existing) => {
            if cloudformation::update_stack(&client, name, &body, &request_token("update")).await?
            {
                cloudformation::wait_for_stack(&client, name, Goal::Update).await?
            } else {
                info!(stack = name, "stack already up to date");
                Some(existing)
            }
        }
    };
    let state = state.ok_or_else(|| Error::StackNotFound(name.to_string()))?;
    check_account(&state, name, environment.account.as_deref())?;

    // Record the deployment
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    let metadata = Metadata {
        name: name.to_string(),
        created_at: creation_time(&directory, now)?,
        stack_id: state.id.clone(),
        region: sdk.region().map(|r| r.to_string()),
        resources: template.resources.len(),
    };
    serde_yaml::to_writer(File::create(directory.join(METADATA_FILE_NAME))?, &metadata)?;
    File::create(directory.join(CREATED_FILE_NAME))?;
    let destroyed = directory.join(DESTROYED_FILE_NAME);
    if destroyed.exists() {
        fs::remove_file(destroyed)?;
    }
    info!(stack = name, id = state.id.as_str(), outputs = ?state.outputs, "deployed stack");

    if !config.run_task_on_deploy {
        return Ok(());
    }

    // Run the task once; the marker and fixed token keep later deploys from repeating it
    let triggered = directory.join(TRIGGERED_FILE_NAME);
    if triggered.exists() {
        info!(stack = name, "deploy-time task already triggered");
        return Ok(());
    }
    warn!(
        stack = name,
        "running task on deploy: first runs may fail to mount the file system, retry with `run`"
    );
    let target = ecs::RunTarget::from_outputs(&state.outputs)?;
    let ecs_client = ecs::create_client(&sdk);
    let task = ecs::run_task(&ecs_client, &target, Some(one_off_token(name))).await?;
    File::create(&triggered)?;
    info!(stack = name, task = task.as_str(), "triggered deploy-time task");
    Ok(())
}
